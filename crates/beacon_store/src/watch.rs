//! One-shot watch registry.
//!
//! Watches are registered on a `(user, key, session)` triple and fire at most
//! once, either when the apply worker touches the key (or its parent) or
//! immediately at registration time when the caller's view is already stale.
//! Waiters are indexed both by bound key and by session so session expiry can
//! cancel everything a client left behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

/// Event delivered to a watcher.
#[derive(Clone, Debug, Default)]
pub struct WatchFired {
    pub watch_key: String,
    pub key: String,
    pub value: String,
    pub deleted: bool,
    pub canceled: bool,
}

/// Join a user namespace and key into the registry's bound-key form.
pub fn bind_key(user: &str, key: &str) -> String {
    format!("{user}::{key}")
}

/// Strip the user namespace off a bound key.
pub fn bound_key_suffix(bound: &str) -> &str {
    match bound.find("::") {
        Some(at) => &bound[at + 2..],
        None => bound,
    }
}

/// Parent key, derived by trimming past the final `/`.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rfind('/').map(|at| &key[..at])
}

struct Waiter {
    bound_key: String,
    session_id: String,
    tx: oneshot::Sender<WatchFired>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    waiters: HashMap<u64, Waiter>,
    by_key: BTreeMap<String, Vec<u64>>,
    by_session: HashMap<String, Vec<u64>>,
}

impl Registry {
    fn detach(&mut self, id: u64) -> Option<Waiter> {
        let waiter = self.waiters.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&waiter.bound_key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_key.remove(&waiter.bound_key);
            }
        }
        if let Some(ids) = self.by_session.get_mut(&waiter.session_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_session.remove(&waiter.session_id);
            }
        }
        Some(waiter)
    }
}

#[derive(Default)]
pub struct WatchHub {
    inner: Mutex<Registry>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a one-shot watch. A newer registration for the same
    /// (session, key) cancels the old one.
    pub fn register(&self, bound_key: &str, session_id: &str) -> oneshot::Receiver<WatchFired> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<u64> = inner
            .by_session
            .get(session_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                inner
                    .waiters
                    .get(id)
                    .map(|w| w.bound_key == bound_key)
                    .unwrap_or(false)
            })
            .collect();
        for id in stale {
            if let Some(waiter) = inner.detach(id) {
                debug!(key = %waiter.bound_key, session = %waiter.session_id, "replacing watch");
                let _ = waiter.tx.send(WatchFired {
                    canceled: true,
                    ..WatchFired::default()
                });
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.insert(
            id,
            Waiter {
                bound_key: bound_key.to_string(),
                session_id: session_id.to_string(),
                tx,
            },
        );
        inner
            .by_key
            .entry(bound_key.to_string())
            .or_default()
            .push(id);
        inner
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .push(id);
        rx
    }

    /// Fire every watch parked on `watch_bound_key`. Returns whether any
    /// waiter was found.
    pub fn trigger(
        &self,
        watch_bound_key: &str,
        event_bound_key: &str,
        value: &str,
        deleted: bool,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ids = match inner.by_key.get(watch_bound_key) {
            Some(ids) => ids.clone(),
            None => {
                debug!(key = %watch_bound_key, "no watchers on key");
                return false;
            }
        };
        let mut fired = 0;
        for id in ids {
            if let Some(waiter) = inner.detach(id) {
                let _ = waiter.tx.send(WatchFired {
                    watch_key: bound_key_suffix(watch_bound_key).to_string(),
                    key: bound_key_suffix(event_bound_key).to_string(),
                    value: value.to_string(),
                    deleted,
                    canceled: false,
                });
                fired += 1;
            }
        }
        info!(count = fired, key = %event_bound_key, "triggered watch events");
        fired > 0
    }

    /// Fire the watch one session holds on one key, if any.
    pub fn trigger_by_session_and_key(
        &self,
        session_id: &str,
        bound_key: &str,
        value: &str,
        deleted: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<u64> = inner
            .by_session
            .get(session_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            let matches = inner
                .waiters
                .get(&id)
                .map(|w| w.bound_key == bound_key)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if let Some(waiter) = inner.detach(id) {
                info!(key = %bound_key, session = %session_id, "triggered watch event");
                let _ = waiter.tx.send(WatchFired {
                    watch_key: bound_key_suffix(bound_key).to_string(),
                    key: bound_key_suffix(bound_key).to_string(),
                    value: value.to_string(),
                    deleted,
                    canceled: false,
                });
            }
        }
    }

    /// Drop every watch a session holds; their waiters see a cancellation.
    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<u64> = inner
            .by_session
            .get(session_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(waiter) = inner.detach(id) {
                debug!(key = %waiter.bound_key, session = %session_id, "removing watch");
                let _ = waiter.tx.send(WatchFired {
                    canceled: true,
                    ..WatchFired::default()
                });
            }
        }
    }

    /// Fire watches on a changed key and on its parent. A missed parent
    /// trigger retries once, accommodating registration/event races.
    pub fn trigger_with_parent(
        self: &Arc<Self>,
        user: &str,
        key: &str,
        value: &str,
        deleted: bool,
    ) {
        let event_bound = bind_key(user, key);
        self.trigger(&event_bound, &event_bound, value, deleted);
        if let Some(parent) = parent_key(key) {
            let parent_bound = bind_key(user, parent);
            if !self.trigger(&parent_bound, &event_bound, value, deleted) {
                let hub = self.clone();
                let value = value.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    hub.trigger(&parent_bound, &event_bound, &value, deleted);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers() {
        assert_eq!(bind_key("u", "/a/b"), "u::/a/b");
        assert_eq!(bound_key_suffix("u::/a/b"), "/a/b");
        assert_eq!(parent_key("/a/b"), Some("/a"));
        assert_eq!(parent_key("plain"), None);
    }

    #[tokio::test]
    async fn fires_once() {
        let hub = WatchHub::new();
        let rx = hub.register("u::/a", "s1");
        assert!(hub.trigger("u::/a", "u::/a", "v", false));
        let fired = rx.await.unwrap();
        assert_eq!(fired.key, "/a");
        assert_eq!(fired.value, "v");
        assert!(!fired.deleted);

        // One-shot: nothing left to fire.
        assert!(!hub.trigger("u::/a", "u::/a", "v2", false));
    }

    #[tokio::test]
    async fn replaced_watch_is_canceled() {
        let hub = WatchHub::new();
        let old_rx = hub.register("u::/a", "s1");
        let new_rx = hub.register("u::/a", "s1");

        let canceled = old_rx.await.unwrap();
        assert!(canceled.canceled);

        assert!(hub.trigger("u::/a", "u::/a", "v", false));
        assert!(!new_rx.await.unwrap().canceled);
    }

    #[tokio::test]
    async fn session_removal_cancels_watches() {
        let hub = WatchHub::new();
        let rx_a = hub.register("u::/a", "s1");
        let rx_b = hub.register("u::/b", "s1");
        let rx_other = hub.register("u::/a", "s2");

        hub.remove_session("s1");
        assert!(rx_a.await.unwrap().canceled);
        assert!(rx_b.await.unwrap().canceled);

        assert!(hub.trigger("u::/a", "u::/a", "v", false));
        assert!(!rx_other.await.unwrap().canceled);
    }

    #[tokio::test]
    async fn parent_watch_sees_child_event() {
        let hub = Arc::new(WatchHub::new());
        let rx = hub.register("u::/a", "s1");
        hub.trigger_with_parent("u", "/a/b", "v", false);
        let fired = rx.await.unwrap();
        assert_eq!(fired.watch_key, "/a");
        assert_eq!(fired.key, "/a/b");
    }
}
