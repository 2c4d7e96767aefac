//! Key/value storage for the coordination state machine.
//!
//! All user data lives in one ordered fjall partition, keyed by
//! `user ‖ 0x00 ‖ key` so per-namespace range scans are prefix scans. Every
//! stored value carries a one-byte tag marking how it was produced: a plain
//! put or a lock grant (in which case the payload is the holding session id).

use std::sync::Mutex;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use beacon_raft::raft::RawRecord;

/// Default namespace for requests without a logged-in user.
pub const ANONYMOUS_USER: &str = "";

/// Reserved key tracking the apply cursor; skipped in scans.
pub const TAG_LAST_APPLIED_INDEX: &str = "#TAG_LAST_APPLIED_INDEX#";

const DATA_PARTITION: &str = "store";

/// How a stored value was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueTag {
    Put,
    Lock,
}

impl ValueTag {
    fn as_byte(self) -> u8 {
        match self {
            ValueTag::Put => 1,
            ValueTag::Lock => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ValueTag::Put),
            2 => Some(ValueTag::Lock),
            _ => None,
        }
    }
}

pub fn encode_value(tag: ValueTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tag.as_byte());
    out.extend_from_slice(payload);
    out
}

/// Split a stored value into its tag and payload.
pub fn parse_value(raw: &[u8]) -> Option<(ValueTag, &[u8])> {
    let (&tag, payload) = raw.split_first()?;
    ValueTag::from_byte(tag).map(|tag| (tag, payload))
}

fn data_key(user: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(user.len() + 1 + key.len());
    out.extend_from_slice(user.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

fn split_data_key(raw: &[u8]) -> anyhow::Result<(String, String)> {
    let sep = raw
        .iter()
        .position(|&b| b == 0)
        .context("malformed data key: missing separator")?;
    let user = String::from_utf8(raw[..sep].to_vec()).context("non-utf8 user")?;
    let key = String::from_utf8(raw[sep + 1..].to_vec()).context("non-utf8 key")?;
    Ok((user, key))
}

/// Ordered KV table shared by the state machine and read paths.
///
/// Reads go straight to the partition; the apply worker is the only writer
/// apart from the leader's optimistic lock write, which is idempotent with
/// the apply-time write.
pub struct StoreEngine {
    keyspace: Keyspace,
    data: Mutex<PartitionHandle>,
}

impl StoreEngine {
    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            data: Mutex::new(data),
        })
    }

    fn data(&self) -> PartitionHandle {
        self.data.lock().unwrap().clone()
    }

    pub fn get(&self, user: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data().get(data_key(user, key))?.map(|v| v.to_vec()))
    }

    /// Direct durable write, used for the leader's optimistic lock grant.
    pub fn put_raw(&self, user: &str, key: &str, raw: &[u8]) -> anyhow::Result<()> {
        self.data().insert(data_key(user, key), raw)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Start an atomic write batch.
    pub fn batch(&self) -> StoreBatch {
        StoreBatch {
            batch: self.keyspace.batch(),
            data: self.data(),
            keyspace: self.keyspace.clone(),
        }
    }

    /// Visit `[start_key, end_key)` of one namespace in order. The visitor
    /// returns `false` to stop early. An empty `end_key` means "to the end".
    pub fn scan_visit(
        &self,
        user: &str,
        start_key: &str,
        end_key: &str,
        mut visit: impl FnMut(&str, &[u8]) -> bool,
    ) -> anyhow::Result<()> {
        let data = self.data();
        let start = data_key(user, start_key);
        let end = if end_key.is_empty() {
            // One past the namespace separator covers every key in it.
            let mut out = user.as_bytes().to_vec();
            out.push(1);
            out
        } else {
            data_key(user, end_key)
        };
        for item in data.range(start..end) {
            let (raw_key, value) = item?;
            let (_, key) = split_data_key(&raw_key)?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Dump every record for snapshot production.
    pub fn raw_records(&self) -> anyhow::Result<Vec<RawRecord>> {
        let data = self.data();
        let mut out = Vec::new();
        for item in data.iter() {
            let (raw_key, value) = item?;
            let (user, key) = split_data_key(&raw_key)?;
            out.push(RawRecord {
                user,
                key,
                value: value.to_vec(),
            });
        }
        Ok(out)
    }

    /// Drop every record ahead of a snapshot install.
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut guard = self.data.lock().unwrap();
        let old = guard.clone();
        self.keyspace.delete_partition(old)?;
        *guard =
            self.keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        Ok(())
    }

    pub fn restore(&self, record: RawRecord) -> anyhow::Result<()> {
        self.data()
            .insert(data_key(&record.user, &record.key), record.value)?;
        Ok(())
    }

    /// Flush outstanding writes, e.g. after a stream of `restore` calls.
    pub fn sync(&self) -> anyhow::Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

/// Atomic multi-write against the store, flushed on commit.
pub struct StoreBatch {
    batch: fjall::Batch,
    data: PartitionHandle,
    keyspace: Keyspace,
}

impl StoreBatch {
    pub fn insert(&mut self, user: &str, key: &str, raw: Vec<u8>) {
        self.batch.insert(&self.data, data_key(user, key), raw);
    }

    pub fn remove(&mut self, user: &str, key: &str) {
        self.batch.remove(&self.data, data_key(user, key));
    }

    pub fn insert_partition(&mut self, partition: &PartitionHandle, key: &[u8], value: Vec<u8>) {
        self.batch.insert(partition, key, value);
    }

    pub fn commit(self) -> anyhow::Result<()> {
        self.batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
