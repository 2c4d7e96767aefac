//! Durable replicated binlog.
//!
//! Entries live in an ordered fjall partition keyed by big-endian index, so
//! slot reads, truncation, and prefix GC are all key-range operations. The
//! log bounds (first retained index, next index, last term) are cached in
//! memory and persisted to a sibling partition whenever they cannot be
//! re-derived from the entries alone (snapshot reset, truncate-to-empty, GC).

use std::sync::Mutex;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use super::types::LogEntry;

const BOUNDS_KEY: &[u8] = b"bounds";

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct LogBounds {
    start_index: i64,
    next_index: i64,
    last_term: i64,
    /// Term of the entry just below `start_index`, kept so prev-entry checks
    /// still line up at the snapshot/GC boundary.
    base_term: i64,
}

impl Default for LogBounds {
    fn default() -> Self {
        Self {
            start_index: 0,
            next_index: 0,
            last_term: -1,
            base_term: -1,
        }
    }
}

/// Append-only ordered log with prefix GC and snapshot reset.
pub struct Binlog {
    keyspace: Keyspace,
    entries: PartitionHandle,
    state: PartitionHandle,
    bounds: Mutex<LogBounds>,
}

fn slot_key(index: i64) -> Vec<u8> {
    (index as u64).to_be_bytes().to_vec()
}

fn decode_entry(bytes: &[u8]) -> anyhow::Result<LogEntry> {
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("decode log entry")?;
    Ok(entry)
}

fn encode_entry(entry: &LogEntry) -> anyhow::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(entry, bincode::config::standard()).context("encode log entry")
}

impl Binlog {
    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let entries = keyspace.open_partition("binlog", PartitionCreateOptions::default())?;
        let state = keyspace.open_partition("binlog_state", PartitionCreateOptions::default())?;

        let mut bounds = match state.get(BOUNDS_KEY)? {
            Some(raw) => {
                let (b, _) =
                    bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                        .context("decode binlog bounds")?;
                b
            }
            None => LogBounds::default(),
        };

        // Entries on disk are authoritative when present; the persisted bounds
        // only carry the empty-log case across restarts.
        let first = entries.iter().next().transpose()?;
        let last = entries.iter().next_back().transpose()?;
        if let (Some((first_key, _)), Some((last_key, last_value))) = (first, last) {
            bounds.start_index = decode_index(&first_key)?;
            bounds.next_index = decode_index(&last_key)? + 1;
            bounds.last_term = decode_entry(&last_value)?.term;
        }

        Ok(Self {
            keyspace,
            entries,
            state,
            bounds: Mutex::new(bounds),
        })
    }

    /// Number of slots ever assigned; the next entry lands at this index.
    pub fn next_index(&self) -> i64 {
        self.bounds.lock().unwrap().next_index
    }

    /// First index still readable; earlier slots have been reclaimed.
    pub fn first_index(&self) -> i64 {
        self.bounds.lock().unwrap().start_index
    }

    pub fn last_index_and_term(&self) -> (i64, i64) {
        let bounds = self.bounds.lock().unwrap();
        (bounds.next_index - 1, bounds.last_term)
    }

    /// Append one entry and flush it before returning its index.
    pub fn append(&self, entry: &LogEntry) -> anyhow::Result<i64> {
        let mut bounds = self.bounds.lock().unwrap();
        let index = bounds.next_index;
        self.entries.insert(slot_key(index), encode_entry(entry)?)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        bounds.next_index = index + 1;
        bounds.last_term = entry.term;
        Ok(index)
    }

    /// Append a batch atomically with a single flush.
    pub fn append_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut bounds = self.bounds.lock().unwrap();
        let mut batch = self.keyspace.batch();
        let mut index = bounds.next_index;
        for entry in entries {
            batch.insert(&self.entries, slot_key(index), encode_entry(entry)?);
            index += 1;
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        bounds.next_index = index;
        bounds.last_term = entries[entries.len() - 1].term;
        Ok(())
    }

    /// Read one slot. Returns `None` for reclaimed or unwritten slots.
    pub fn read_slot(&self, index: i64) -> anyhow::Result<Option<LogEntry>> {
        {
            let bounds = self.bounds.lock().unwrap();
            if index < bounds.start_index || index >= bounds.next_index {
                return Ok(None);
            }
        }
        match self.entries.get(slot_key(index))? {
            Some(raw) => Ok(Some(decode_entry(&raw)?)),
            None => Ok(None),
        }
    }

    /// Term of the entry at `index`, answering for the slot just below the
    /// retained range as well (the snapshot/GC base).
    pub fn term_at(&self, index: i64) -> anyhow::Result<Option<i64>> {
        {
            let bounds = self.bounds.lock().unwrap();
            if index == bounds.start_index - 1 && bounds.base_term >= 0 {
                return Ok(Some(bounds.base_term));
            }
        }
        Ok(self.read_slot(index)?.map(|e| e.term))
    }

    /// Keep entries `[0..=prefix_end]`, dropping everything after.
    pub fn truncate(&self, prefix_end: i64) -> anyhow::Result<()> {
        let mut bounds = self.bounds.lock().unwrap();
        let new_next = (prefix_end + 1).max(bounds.start_index);
        if new_next >= bounds.next_index {
            return Ok(());
        }
        let keys: Vec<_> = self
            .entries
            .range(slot_key(new_next)..)
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        let mut batch = self.keyspace.batch();
        for key in keys {
            batch.remove(&self.entries, key);
        }
        bounds.next_index = new_next;
        bounds.last_term = if new_next > bounds.start_index {
            match self.entries.get(slot_key(new_next - 1))? {
                Some(raw) => decode_entry(&raw)?.term,
                None => -1,
            }
        } else {
            // Truncated down to the snapshot base; the base term stands.
            bounds.base_term
        };
        batch.insert(&self.state, BOUNDS_KEY, encode_bounds(&bounds)?);
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Reclaim entries below `end` (exclusive). Used by log GC.
    pub fn remove_prefix_before(&self, end: i64) -> anyhow::Result<()> {
        let mut bounds = self.bounds.lock().unwrap();
        if end <= bounds.start_index {
            return Ok(());
        }
        let upper = end.min(bounds.next_index);
        if upper > bounds.start_index {
            if let Some(raw) = self.entries.get(slot_key(upper - 1))? {
                bounds.base_term = decode_entry(&raw)?.term;
            }
        }
        let keys: Vec<_> = self
            .entries
            .range(slot_key(bounds.start_index)..slot_key(upper))
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        let mut batch = self.keyspace.batch();
        for key in keys {
            batch.remove(&self.entries, key);
        }
        bounds.start_index = end.max(bounds.start_index);
        if bounds.start_index > bounds.next_index {
            bounds.next_index = bounds.start_index;
        }
        batch.insert(&self.state, BOUNDS_KEY, encode_bounds(&bounds)?);
        batch.commit()?;
        Ok(())
    }

    /// Drop all entries and restart the log after a snapshot install, so the
    /// next slot is `next_index`.
    pub fn reset_for_snapshot(&self, next_index: i64, last_term: i64) -> anyhow::Result<()> {
        let mut bounds = self.bounds.lock().unwrap();
        let keys: Vec<_> = self
            .entries
            .iter()
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        let mut batch = self.keyspace.batch();
        for key in keys {
            batch.remove(&self.entries, key);
        }
        bounds.start_index = next_index;
        bounds.next_index = next_index;
        bounds.last_term = last_term;
        bounds.base_term = last_term;
        batch.insert(&self.state, BOUNDS_KEY, encode_bounds(&bounds)?);
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

fn encode_bounds(bounds: &LogBounds) -> anyhow::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(bounds, bincode::config::standard())
        .context("encode binlog bounds")
}

fn decode_index(key: &[u8]) -> anyhow::Result<i64> {
    let raw: [u8; 8] = key.try_into().context("short binlog key")?;
    Ok(u64::from_be_bytes(raw) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::OpKind;

    fn entry(term: i64, key: &str) -> LogEntry {
        LogEntry {
            term,
            op: OpKind::Put,
            user: String::new(),
            key: key.to_string(),
            value: "v".to_string(),
        }
    }

    fn open_log(dir: &std::path::Path) -> Binlog {
        let keyspace = fjall::Config::new(dir).open().unwrap();
        Binlog::open(keyspace).unwrap()
    }

    #[test]
    fn append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        assert_eq!(log.next_index(), 0);
        assert_eq!(log.last_index_and_term(), (-1, -1));

        assert_eq!(log.append(&entry(1, "a")).unwrap(), 0);
        assert_eq!(log.append(&entry(2, "b")).unwrap(), 1);
        assert_eq!(log.next_index(), 2);
        assert_eq!(log.last_index_and_term(), (1, 2));

        let got = log.read_slot(0).unwrap().unwrap();
        assert_eq!(got.key, "a");
        assert!(log.read_slot(2).unwrap().is_none());
    }

    #[test]
    fn truncate_drops_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..5 {
            log.append(&entry(1, &format!("k{i}"))).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.next_index(), 3);
        assert!(log.read_slot(3).unwrap().is_none());
        assert_eq!(log.read_slot(2).unwrap().unwrap().key, "k2");

        // Truncating everything leaves an empty log.
        log.truncate(-1).unwrap();
        assert_eq!(log.next_index(), 0);
        assert_eq!(log.last_index_and_term(), (-1, -1));
    }

    #[test]
    fn prefix_gc_keeps_tail_readable() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..6 {
            log.append(&entry(1, &format!("k{i}"))).unwrap();
        }
        log.remove_prefix_before(4).unwrap();
        assert_eq!(log.first_index(), 4);
        assert!(log.read_slot(3).unwrap().is_none());
        assert_eq!(log.read_slot(4).unwrap().unwrap().key, "k4");
        assert_eq!(log.next_index(), 6);
    }

    #[test]
    fn reset_for_snapshot_restarts_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(&entry(1, &format!("k{i}"))).unwrap();
        }
        log.reset_for_snapshot(10, 4).unwrap();
        assert_eq!(log.next_index(), 10);
        assert_eq!(log.first_index(), 10);
        assert_eq!(log.last_index_and_term(), (9, 4));
        assert!(log.read_slot(2).unwrap().is_none());

        assert_eq!(log.append(&entry(5, "after")).unwrap(), 10);
        assert_eq!(log.read_slot(10).unwrap().unwrap().key, "after");
    }

    #[test]
    fn bounds_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path());
            log.append(&entry(3, "a")).unwrap();
            log.append(&entry(3, "b")).unwrap();
        }
        {
            let log = open_log(dir.path());
            assert_eq!(log.next_index(), 2);
            assert_eq!(log.last_index_and_term(), (1, 3));
        }

        // An emptied-by-snapshot log must keep its bounds across restarts.
        {
            let log = open_log(dir.path());
            log.reset_for_snapshot(7, 2).unwrap();
        }
        let log = open_log(dir.path());
        assert_eq!(log.next_index(), 7);
        assert_eq!(log.last_index_and_term(), (6, 2));
    }
}
