//! Secure credential store boundary
//!
//! The store is a black box holding the API-key login material. The host
//! decides where it lives; this crate only needs save/retrieve/delete.

use std::collections::HashMap;
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Key under which the API client id is stored
pub const CLIENT_ID_KEY: &str = "bw_client_id";
/// Key under which the API client secret is stored
pub const CLIENT_SECRET_KEY: &str = "bw_client_secret";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque key/value store with at-rest protection
pub trait CredentialStore: Send + Sync {
    fn save(&self, key: &str, secret: SecretString) -> Result<(), CredentialError>;

    fn retrieve(&self, key: &str) -> Result<Option<SecretString>, CredentialError>;

    fn delete(&self, key: &str) -> Result<(), CredentialError>;
}

/// Process-memory store, seeded by the host at startup
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, SecretString>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `BW_CLIENTID` / `BW_CLIENTSECRET` if they are set.
    pub fn from_env() -> Self {
        let store = Self::new();
        for (var, key) in [("BW_CLIENTID", CLIENT_ID_KEY), ("BW_CLIENTSECRET", CLIENT_SECRET_KEY)] {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    let _ = store.save(key, SecretString::from(value));
                }
            }
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, key: &str, secret: SecretString) -> Result<(), CredentialError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CredentialError::Unavailable("store lock poisoned".into()))?;
        entries.insert(key.to_string(), secret);
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<SecretString>, CredentialError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CredentialError::Unavailable("store lock poisoned".into()))?;
        Ok(entries
            .get(key)
            .map(|s| SecretString::from(s.expose_secret().to_owned())))
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CredentialError::Unavailable("store lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}
