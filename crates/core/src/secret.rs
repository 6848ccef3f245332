//! Repository passwords and where they come from.
//!
//! Passwords are looked up on demand through a [`SecretStore`] keyed by
//! repository location. Nothing in this crate writes a secret to disk.

use crate::{DeckError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use zeroize::Zeroizing;

/// Placeholder shown wherever a secret would otherwise appear.
pub const REDACTED: &str = "********";

/// Used instead of [`REDACTED`] when the secret is made of asterisks. The two
/// share no character, so one of them never contains the secret.
const REDACTED_ALT: &str = "<redacted>";

/// A password held in memory. Wiped on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `text` would reveal this secret.
    pub fn appears_in(&self, text: &str) -> bool {
        !self.is_empty() && text.contains(self.expose())
    }

    /// A placeholder that does not itself contain the secret.
    pub fn placeholder(&self) -> &'static str {
        if self.appears_in(REDACTED) {
            REDACTED_ALT
        } else {
            REDACTED
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(")?;
        f.write_str(REDACTED)?;
        f.write_str(")")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Per-repository password storage.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Secret>>;
    fn put(&self, key: &str, secret: Secret) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Like `get`, but a missing entry is an error.
    fn require(&self, key: &str) -> Result<Secret> {
        self.get(key)?
            .ok_or_else(|| DeckError::SecretRetrieval(format!("no password stored for {}", key)))
    }
}

/// Process-lifetime store. Used by the CLI (seeded from a prompt or
/// environment) and by tests.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(key: impl Into<String>, secret: Secret) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.secrets.write() {
            map.insert(key.into(), secret);
        }
        store
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<Secret>> {
        let map = self
            .secrets
            .read()
            .map_err(|_| DeckError::SecretRetrieval("secret store lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, secret: Secret) -> Result<()> {
        let mut map = self
            .secrets
            .write()
            .map_err(|_| DeckError::SecretRetrieval("secret store lock poisoned".to_string()))?;
        map.insert(key.to_string(), secret);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self
            .secrets
            .write()
            .map_err(|_| DeckError::SecretRetrieval("secret store lock poisoned".to_string()))?;
        map.remove(key);
        Ok(())
    }
}
