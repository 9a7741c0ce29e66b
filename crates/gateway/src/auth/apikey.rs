//! Pre-shared credential lookup.
//!
//! The configured map may store a credential either raw or as its SHA-256
//! hex; resolution tries the presented value verbatim first, then its hash.
//! The map is an atomically swappable snapshot so hot reload never mutates
//! a table mid-lookup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use tg_domain::config::CredentialConfig;
use tg_domain::CallerContext;

pub struct KeyStore {
    map: RwLock<Arc<HashMap<String, CredentialConfig>>>,
}

impl KeyStore {
    pub fn new(credentials: &[CredentialConfig]) -> Self {
        Self {
            map: RwLock::new(Arc::new(build_map(credentials))),
        }
    }

    /// Swap in a fresh snapshot (hot reload).
    pub fn replace(&self, credentials: &[CredentialConfig]) {
        *self.map.write() = Arc::new(build_map(credentials));
    }

    /// Resolve a presented credential: verbatim, then by SHA-256 hex.
    /// Disabled and expired records resolve to `None`.
    pub fn resolve(&self, raw: &str) -> Option<CallerContext> {
        let map = Arc::clone(&self.map.read());
        let record = map
            .get(raw)
            .or_else(|| map.get(&sha256_hex(raw)))?;

        if !record.enabled {
            tracing::debug!(credential_id = %record.id, "credential is disabled");
            return None;
        }
        if let Some(expiry) = record.expires_at {
            if Utc::now() >= expiry {
                tracing::debug!(credential_id = %record.id, "credential is expired");
                return None;
            }
        }

        Some(CallerContext {
            consumer_id: record.consumer_id.clone(),
            credential_id: record.id.clone(),
            roles: record.roles.clone(),
            rate_limit_per_minute: record.rate_limit_per_minute,
            email: None,
            metadata: None,
        })
    }
}

fn build_map(credentials: &[CredentialConfig]) -> HashMap<String, CredentialConfig> {
    credentials
        .iter()
        .map(|c| (c.key.clone(), c.clone()))
        .collect()
}

pub(crate) fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(key: &str) -> CredentialConfig {
        CredentialConfig {
            id: "key-1".into(),
            key: key.into(),
            name: "test".into(),
            consumer_id: "acme".into(),
            roles: vec!["reader".into()],
            rate_limit_per_minute: Some(10),
            expires_at: None,
            enabled: true,
        }
    }

    #[test]
    fn resolves_raw_key() {
        let store = KeyStore::new(&[record("sekrit")]);
        let ctx = store.resolve("sekrit").unwrap();
        assert_eq!(ctx.consumer_id, "acme");
        assert_eq!(ctx.rate_limit_per_minute, Some(10));
    }

    #[test]
    fn resolves_hashed_storage_form() {
        // Config stores the hash; the caller presents the raw key.
        let hashed = sha256_hex("sekrit");
        let store = KeyStore::new(&[record(&hashed)]);
        assert!(store.resolve("sekrit").is_some());
        assert!(store.resolve(&hashed).is_some()); // hash presented verbatim
    }

    #[test]
    fn unknown_key_resolves_to_none() {
        let store = KeyStore::new(&[record("sekrit")]);
        assert!(store.resolve("nope").is_none());
    }

    #[test]
    fn disabled_credential_is_rejected() {
        let mut rec = record("sekrit");
        rec.enabled = false;
        let store = KeyStore::new(&[rec]);
        assert!(store.resolve("sekrit").is_none());
    }

    #[test]
    fn expired_credential_is_rejected() {
        let mut rec = record("sekrit");
        rec.expires_at = Some(Utc::now() - Duration::hours(1));
        let store = KeyStore::new(&[rec]);
        assert!(store.resolve("sekrit").is_none());
    }

    #[test]
    fn future_expiry_is_accepted() {
        let mut rec = record("sekrit");
        rec.expires_at = Some(Utc::now() + Duration::hours(1));
        let store = KeyStore::new(&[rec]);
        assert!(store.resolve("sekrit").is_some());
    }
}
