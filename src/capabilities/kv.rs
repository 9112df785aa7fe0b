use crux_kv::KeyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Event;

/// Device persistence goes through the shell's key-value store (AsyncStorage,
/// UserDefaults, localStorage). Keys are validated here; values are opaque
/// bytes.
pub type KvCapability = KeyValue<Event>;

pub const MAX_KEY_LENGTH: usize = 512;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("storage backend error: {message}")]
    Backend { message: String },
}

impl From<crux_kv::error::KeyValueError> for KvError {
    fn from(e: crux_kv::error::KeyValueError) -> Self {
        KvError::Backend {
            message: e.to_string(),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Settings,
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Settings => "settings",
        }
    }
}

/// Namespaced, validated storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self { namespace, key })
    }

    /// The flat key handed to the shell store.
    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    fn validate(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }
        if key.contains('\0') || key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains control characters".to_string(),
            });
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key looks like a path".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_key_gets_namespace_prefix() {
        let key = KvKey::new(KeyNamespace::Outbox, "journal_store_v1_abcd").unwrap();
        assert_eq!(key.raw(), "outbox:journal_store_v1_abcd");
    }

    #[test]
    fn empty_key_rejected() {
        assert!(KvKey::new(KeyNamespace::Outbox, "").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "   ").is_err());
    }

    #[test]
    fn overlong_key_rejected() {
        assert!(KvKey::new(KeyNamespace::Outbox, "k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn path_like_keys_rejected() {
        assert!(KvKey::new(KeyNamespace::Outbox, "../escape").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "/absolute").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "null\0byte").is_err());
    }
}
