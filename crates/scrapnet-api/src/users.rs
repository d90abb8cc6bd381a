//! User directory: usernames mapped to bcrypt password hashes.
//!
//! The directory holds both the records this node owns and the copies its
//! neighbors push over; ownership is the router's concern, not the map's.

use bcrypt::{hash, verify};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};

#[cfg(not(test))]
use bcrypt::DEFAULT_COST;

// Hashing at the default cost makes the test suite crawl.
#[cfg(test)]
const TEST_BCRYPT_COST: u32 = 4;

/// Concurrent username → hashed-password map.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<String, String>,
}

impl UserDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cost() -> u32 {
        #[cfg(test)]
        {
            TEST_BCRYPT_COST
        }
        #[cfg(not(test))]
        {
            DEFAULT_COST
        }
    }

    /// Register a new user. Duplicate names conflict.
    pub fn register(&self, username: &str, password: &str) -> ApiResult<()> {
        match self.users.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ApiError::UserExists(username.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let hashed = hash(password, Self::cost())
                    .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))?;
                slot.insert(hashed);
                info!(username, "User registered");
                Ok(())
            }
        }
    }

    /// Check a password against the stored hash.
    pub fn verify(&self, username: &str, password: &str) -> ApiResult<()> {
        let stored = self
            .users
            .get(username)
            .ok_or_else(|| ApiError::UnknownUser(username.to_string()))?;

        if verify(password, stored.value()).unwrap_or(false) {
            Ok(())
        } else {
            Err(ApiError::WrongPassword)
        }
    }

    /// Whether a user exists.
    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// All `(username, hashed_password)` pairs, for the replication diff.
    #[must_use]
    pub fn export(&self) -> Vec<(String, String)> {
        self.users
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Merge replicated pairs, last writer wins. Returns how many entries
    /// were inserted or overwritten.
    pub fn merge(&self, pairs: Vec<(String, String)>) -> usize {
        let count = pairs.len();
        for (username, hashed) in pairs {
            debug!(username, "User record merged via replication");
            self.users.insert(username, hashed);
        }
        count
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_verify() {
        let users = UserDirectory::new();
        users.register("alice", "s3cret").unwrap();
        assert!(users.verify("alice", "s3cret").is_ok());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let users = UserDirectory::new();
        users.register("alice", "s3cret").unwrap();
        let result = users.register("alice", "other");
        assert!(matches!(result, Err(ApiError::UserExists(_))));
    }

    #[test]
    fn wrong_password_and_unknown_user_differ() {
        let users = UserDirectory::new();
        users.register("alice", "s3cret").unwrap();
        assert!(matches!(
            users.verify("alice", "nope"),
            Err(ApiError::WrongPassword)
        ));
        assert!(matches!(
            users.verify("bob", "s3cret"),
            Err(ApiError::UnknownUser(_))
        ));
    }

    #[test]
    fn merge_is_last_writer_wins() {
        let users = UserDirectory::new();
        users.register("alice", "s3cret").unwrap();
        let replacement = "$2b$04$replacementhashreplacementhashrepl".to_string();

        let merged = users.merge(vec![
            ("alice".into(), replacement.clone()),
            ("carol".into(), replacement.clone()),
        ]);

        assert_eq!(merged, 2);
        assert_eq!(users.len(), 2);
        // alice's original hash was overwritten, so her old password fails.
        assert!(users.verify("alice", "s3cret").is_err());
    }

    #[test]
    fn export_contains_hashes_not_passwords() {
        let users = UserDirectory::new();
        users.register("alice", "s3cret").unwrap();
        let exported = users.export();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].0, "alice");
        assert_ne!(exported[0].1, "s3cret");
    }
}
