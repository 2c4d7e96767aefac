//! User accounts and login sessions.
//!
//! Accounts are stored as blake3 password digests in their own partition;
//! account mutations ride the same atomic batch as the apply cursor. Login
//! state (uuid → username) is in-memory and rebuilt by clients logging in
//! again after a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::debug;

use beacon_raft::raft::RpcStatus;

use crate::kv::StoreBatch;

const ACCOUNTS_PARTITION: &str = "accounts";

pub struct UserManager {
    accounts: PartitionHandle,
    logged_in: Mutex<HashMap<String, String>>,
}

fn password_digest(password: &str) -> String {
    blake3::hash(password.as_bytes()).to_hex().to_string()
}

impl UserManager {
    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let accounts =
            keyspace.open_partition(ACCOUNTS_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            accounts,
            logged_in: Mutex::new(HashMap::new()),
        })
    }

    /// A fresh uuid for a login attempt.
    pub fn calc_uuid(username: &str) -> String {
        let nonce: u64 = rand::random();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        blake3::hash(format!("{username}:{now}:{nonce}").as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn is_valid_user(&self, username: &str) -> bool {
        matches!(self.accounts.get(username), Ok(Some(_)))
    }

    pub fn is_logged_in(&self, uuid: &str) -> bool {
        self.logged_in.lock().unwrap().contains_key(uuid)
    }

    /// Resolve a request's namespace; unknown or empty uuids fall back to the
    /// anonymous namespace.
    pub fn username_from_uuid(&self, uuid: &str) -> String {
        self.logged_in
            .lock()
            .unwrap()
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply-time account creation; refuses to overwrite an existing account.
    pub fn register_in(
        &self,
        batch: &mut StoreBatch,
        username: &str,
        password: &str,
    ) -> RpcStatus {
        if username.is_empty() {
            return RpcStatus::Error;
        }
        if self.is_valid_user(username) {
            debug!(username, "account already exists");
            return RpcStatus::Error;
        }
        batch.insert_partition(
            &self.accounts,
            username.as_bytes(),
            password_digest(password).into_bytes(),
        );
        RpcStatus::Ok
    }

    /// Apply-time login: validate credentials and bind the uuid.
    pub fn login(&self, username: &str, password: &str, uuid: &str) -> RpcStatus {
        let stored = match self.accounts.get(username) {
            Ok(Some(stored)) => stored,
            _ => return RpcStatus::UnknownUser,
        };
        if stored.as_ref() != password_digest(password).as_bytes() {
            debug!(username, "bad credentials");
            return RpcStatus::Error;
        }
        self.logged_in
            .lock()
            .unwrap()
            .insert(uuid.to_string(), username.to_string());
        RpcStatus::Ok
    }

    /// Apply-time logout: invalidate the uuid.
    pub fn logout(&self, uuid: &str) -> RpcStatus {
        match self.logged_in.lock().unwrap().remove(uuid) {
            Some(_) => RpcStatus::Ok,
            None => RpcStatus::UnknownUser,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::StoreEngine;

    fn open(dir: &std::path::Path) -> (StoreEngine, UserManager) {
        let keyspace = fjall::Config::new(dir).open().unwrap();
        let store = StoreEngine::open(keyspace.clone()).unwrap();
        let users = UserManager::open(keyspace).unwrap();
        (store, users)
    }

    #[test]
    fn register_login_logout() {
        let dir = tempfile::tempdir().unwrap();
        let (store, users) = open(dir.path());

        let mut batch = store.batch();
        assert_eq!(users.register_in(&mut batch, "alice", "secret"), RpcStatus::Ok);
        batch.commit().unwrap();
        assert!(users.is_valid_user("alice"));

        // Duplicate registration is refused.
        let mut batch = store.batch();
        assert_eq!(
            users.register_in(&mut batch, "alice", "other"),
            RpcStatus::Error
        );

        let uuid = UserManager::calc_uuid("alice");
        assert_eq!(users.login("alice", "wrong", &uuid), RpcStatus::Error);
        assert!(!users.is_logged_in(&uuid));

        assert_eq!(users.login("alice", "secret", &uuid), RpcStatus::Ok);
        assert!(users.is_logged_in(&uuid));
        assert_eq!(users.username_from_uuid(&uuid), "alice");

        assert_eq!(users.logout(&uuid), RpcStatus::Ok);
        assert_eq!(users.logout(&uuid), RpcStatus::UnknownUser);
        assert!(!users.is_logged_in(&uuid));
    }

    #[test]
    fn unknown_user_cannot_login() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, users) = open(dir.path());
        assert_eq!(
            users.login("ghost", "secret", "uuid"),
            RpcStatus::UnknownUser
        );
        assert_eq!(users.username_from_uuid("uuid"), "");
    }

    #[test]
    fn uuids_are_unique_per_login() {
        let a = UserManager::calc_uuid("alice");
        let b = UserManager::calc_uuid("alice");
        assert_ne!(a, b);
    }
}
