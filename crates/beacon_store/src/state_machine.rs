//! The replicated coordination state machine.
//!
//! Applies committed log entries to the KV table, keeping the reserved apply
//! cursor in the same atomic batch as each entry's effect, and drives the
//! side effects that must stay in lock-step with log application: session
//! lock bookkeeping, parent-key touches, and watch delivery.

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use beacon_raft::raft::{ApplyOutcome, LogEntry, OpKind, RawRecord, RpcStatus, StateMachine};

use crate::kv::{
    encode_value, parse_value, StoreBatch, StoreEngine, ValueTag, ANONYMOUS_USER,
    TAG_LAST_APPLIED_INDEX,
};
use crate::session::SessionLocks;
use crate::user::UserManager;
use crate::watch::{parent_key, WatchHub};

pub struct CoordStateMachine {
    store: Arc<StoreEngine>,
    session_locks: Arc<SessionLocks>,
    watches: Arc<WatchHub>,
    users: Arc<UserManager>,
}

impl CoordStateMachine {
    pub fn new(
        store: Arc<StoreEngine>,
        session_locks: Arc<SessionLocks>,
        watches: Arc<WatchHub>,
        users: Arc<UserManager>,
    ) -> Self {
        Self {
            store,
            session_locks,
            watches,
            users,
        }
    }

    fn stamp_cursor(batch: &mut StoreBatch, index: i64) {
        batch.insert(
            ANONYMOUS_USER,
            TAG_LAST_APPLIED_INDEX,
            index.to_string().into_bytes(),
        );
    }

    /// Leave a `<action>,<session>` marker on the parent key so directory
    /// watchers observe lock traffic.
    fn touch_parent(batch: &mut StoreBatch, user: &str, key: &str, session: &str, action: &str) {
        if let Some(parent) = parent_key(key) {
            batch.insert(
                user,
                parent,
                encode_value(ValueTag::Put, format!("{action},{session}").as_bytes()),
            );
        }
    }
}

impl StateMachine for CoordStateMachine {
    fn apply(&self, index: i64, entry: &LogEntry) -> anyhow::Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        match entry.op {
            OpKind::Put | OpKind::Lock => {
                debug!(key = %entry.key, user = %entry.user, "applying write");
                let tag = if entry.op == OpKind::Lock {
                    ValueTag::Lock
                } else {
                    ValueTag::Put
                };
                let mut batch = self.store.batch();
                batch.insert(
                    &entry.user,
                    &entry.key,
                    encode_value(tag, entry.value.as_bytes()),
                );
                if entry.op == OpKind::Lock {
                    Self::touch_parent(&mut batch, &entry.user, &entry.key, &entry.value, "lock");
                }
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply write")?;
                if entry.op == OpKind::Lock {
                    self.session_locks.add(&entry.value, &entry.key);
                }
                self.watches
                    .trigger_with_parent(&entry.user, &entry.key, &entry.value, false);
            }
            OpKind::Del => {
                debug!(key = %entry.key, user = %entry.user, "applying delete");
                let mut batch = self.store.batch();
                batch.remove(&entry.user, &entry.key);
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply delete")?;
                self.watches
                    .trigger_with_parent(&entry.user, &entry.key, &entry.value, true);
            }
            OpKind::Unlock => {
                let current = self.store.get(&entry.user, &entry.key)?;
                let held_by_session = current
                    .as_deref()
                    .and_then(parse_value)
                    .map(|(tag, payload)| {
                        tag == ValueTag::Lock && payload == entry.value.as_bytes()
                    })
                    .unwrap_or(false);
                let mut batch = self.store.batch();
                if held_by_session {
                    batch.remove(&entry.user, &entry.key);
                    Self::touch_parent(
                        &mut batch,
                        &entry.user,
                        &entry.key,
                        &entry.value,
                        "unlock",
                    );
                }
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply unlock")?;
                if held_by_session {
                    debug!(key = %entry.key, "unlocked");
                    self.watches
                        .trigger_with_parent(&entry.user, &entry.key, &entry.value, true);
                }
            }
            OpKind::Login => {
                // key = username, value = password, user = uuid to bind.
                outcome.status = self.users.login(&entry.key, &entry.value, &entry.user);
                if outcome.status == RpcStatus::Ok {
                    outcome.uuid = entry.user.clone();
                }
                let mut batch = self.store.batch();
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply login")?;
            }
            OpKind::Logout => {
                outcome.status = self.users.logout(&entry.user);
                let mut batch = self.store.batch();
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply logout")?;
            }
            OpKind::Register => {
                let mut batch = self.store.batch();
                outcome.status = self.users.register_in(&mut batch, &entry.key, &entry.value);
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply register")?;
            }
            OpKind::Nop | OpKind::AddNode => {
                // Consensus-level entries; only the cursor moves here.
                let mut batch = self.store.batch();
                Self::stamp_cursor(&mut batch, index);
                batch.commit().context("apply cursor")?;
            }
        }
        Ok(outcome)
    }

    fn last_applied(&self) -> anyhow::Result<i64> {
        match self.store.get(ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX)? {
            Some(raw) => {
                let text = std::str::from_utf8(&raw).context("non-utf8 apply cursor")?;
                text.parse::<i64>().context("malformed apply cursor")
            }
            None => Ok(-1),
        }
    }

    fn raw_records(&self) -> anyhow::Result<Vec<RawRecord>> {
        self.store.raw_records()
    }

    fn reset(&self) -> anyhow::Result<()> {
        self.store.reset()
    }

    fn restore(&self, record: RawRecord) -> anyhow::Result<()> {
        self.store.restore(record)
    }
}
