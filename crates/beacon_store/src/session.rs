//! Client sessions and the locks they own.
//!
//! The session table keeps two parallel ordered indexes, by id and by expiry
//! deadline, consistent under one lock; the expiry sweep drains by deadline.
//! The lock registry maps a session to the keys it holds so expiry can issue
//! the matching unlock entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub uuid: String,
    /// Microsecond deadline; the session expires once the clock passes it.
    pub last_timeout_us: i64,
}

#[derive(Default)]
struct SessionIndexes {
    by_id: HashMap<String, Session>,
    by_deadline: BTreeMap<(i64, String), ()>,
}

#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<SessionIndexes>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a session.
    pub fn upsert(&self, session: Session) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.by_id.remove(&session.session_id) {
            inner
                .by_deadline
                .remove(&(old.last_timeout_us, old.session_id));
        }
        inner
            .by_deadline
            .insert((session.last_timeout_us, session.session_id.clone()), ());
        inner.by_id.insert(session.session_id.clone(), session);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().by_id.contains_key(session_id)
    }

    /// Remove and return every session whose deadline has passed.
    pub fn remove_expired(&self, now_us: i64) -> Vec<Session> {
        let mut inner = self.inner.lock().unwrap();
        let expired_keys: Vec<(i64, String)> = inner
            .by_deadline
            .range(..(now_us, String::new()))
            .map(|(k, _)| k.clone())
            .collect();
        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            inner.by_deadline.remove(&key);
            if let Some(session) = inner.by_id.remove(&key.1) {
                expired.push(session);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys locked by each session.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, HashSet<String>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the advertised lock set, as carried by keep-alives.
    pub fn replace(&self, session_id: &str, keys: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.entry(session_id.to_string()).or_default();
        set.clear();
        set.extend(keys);
    }

    /// Record one granted lock.
    pub fn add(&self, session_id: &str, key: &str) {
        self.inner
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Remove and return a session's locked keys.
    pub fn take(&self, session_id: &str) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .remove(session_id)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, deadline: i64) -> Session {
        Session {
            session_id: id.to_string(),
            uuid: String::new(),
            last_timeout_us: deadline,
        }
    }

    #[test]
    fn refresh_moves_deadline() {
        let table = SessionTable::new();
        table.upsert(session("s1", 100));
        table.upsert(session("s1", 1_000));

        // Not expired at the old deadline any more.
        assert!(table.remove_expired(500).is_empty());
        assert!(table.contains("s1"));

        let expired = table.remove_expired(2_000);
        assert_eq!(expired.len(), 1);
        assert!(!table.contains("s1"));
        assert!(table.is_empty());
    }

    #[test]
    fn expiry_only_takes_past_deadlines() {
        let table = SessionTable::new();
        table.upsert(session("old", 10));
        table.upsert(session("fresh", 10_000));

        let expired = table.remove_expired(100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "old");
        assert!(table.contains("fresh"));
    }

    #[test]
    fn lock_registry_replace_and_take() {
        let locks = SessionLocks::new();
        locks.add("s1", "/a");
        locks.replace("s1", vec!["/b".to_string(), "/c".to_string()]);
        locks.add("s1", "/d");

        let keys = locks.take("s1");
        assert!(!keys.contains("/a"));
        assert!(keys.contains("/b"));
        assert!(keys.contains("/c"));
        assert!(keys.contains("/d"));
        assert!(locks.take("s1").is_empty());
    }
}
