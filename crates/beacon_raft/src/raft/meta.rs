//! Persistent consensus meta: current term and votes by term.
//!
//! Both are written through synchronously, before any RPC response that
//! depends on them is sent.

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use std::collections::HashMap;

const CURRENT_TERM_KEY: &[u8] = b"current_term";
const VOTED_FOR_PREFIX: &str = "voted_for/";

pub struct MetaStore {
    keyspace: Keyspace,
    meta: PartitionHandle,
}

impl MetaStore {
    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, meta })
    }

    pub fn read_current_term(&self) -> anyhow::Result<i64> {
        match self.meta.get(CURRENT_TERM_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().context("short term record")?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn write_current_term(&self, term: i64) -> anyhow::Result<()> {
        self.meta
            .insert(CURRENT_TERM_KEY, term.to_be_bytes().to_vec())?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn read_voted_for(&self) -> anyhow::Result<HashMap<i64, String>> {
        let mut votes = HashMap::new();
        for item in self.meta.prefix(VOTED_FOR_PREFIX) {
            let (key, value) = item?;
            let term_text = std::str::from_utf8(&key[VOTED_FOR_PREFIX.len()..])
                .context("non-utf8 vote key")?;
            let term: i64 = term_text.parse().context("malformed vote key")?;
            let candidate =
                String::from_utf8(value.to_vec()).context("non-utf8 vote candidate")?;
            votes.insert(term, candidate);
        }
        Ok(votes)
    }

    pub fn write_voted_for(&self, term: i64, candidate: &str) -> anyhow::Result<()> {
        self.meta.insert(
            format!("{VOTED_FOR_PREFIX}{term}").into_bytes(),
            candidate.as_bytes().to_vec(),
        )?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_meta(dir: &std::path::Path) -> MetaStore {
        let keyspace = fjall::Config::new(dir).open().unwrap();
        MetaStore::open(keyspace).unwrap()
    }

    #[test]
    fn term_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let meta = open_meta(dir.path());
            assert_eq!(meta.read_current_term().unwrap(), 0);
            meta.write_current_term(12).unwrap();
        }
        let meta = open_meta(dir.path());
        assert_eq!(meta.read_current_term().unwrap(), 12);
    }

    #[test]
    fn votes_by_term() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        meta.write_voted_for(3, "127.0.0.1:1").unwrap();
        meta.write_voted_for(4, "127.0.0.1:2").unwrap();

        let votes = meta.read_voted_for().unwrap();
        assert_eq!(votes.get(&3).map(String::as_str), Some("127.0.0.1:1"));
        assert_eq!(votes.get(&4).map(String::as_str), Some("127.0.0.1:2"));
        assert!(votes.get(&5).is_none());
    }
}
