//! Local Key/Value Storage
//!
//! Browser-like persistent storage consumed by the identity store and the
//! client correlation key. Backend failures are always recoverable: callers
//! fall back to a non-persisted value and get told about it through
//! [`Stored::Ephemeral`].

use std::collections::BTreeMap;

use thiserror::Error;

/// Persistence backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Backend refused the read.
    #[error("storage read failed: {0}")]
    Read(String),
    /// Backend refused the write (quota, private mode, ...).
    #[error("storage write failed: {0}")]
    Write(String),
    /// Stored record could not be decoded.
    #[error("corrupt record under {key}: {reason}")]
    Corrupt {
        /// Storage key.
        key: String,
        /// Decode failure.
        reason: String,
    },
}

/// Minimal key/value storage contract.
pub trait KeyValueStorage {
    /// Read a value.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Write a value.
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Delete a value. Deleting a missing key is not an error.
    fn remove_item(&mut self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    items: BTreeMap<String, String>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }
}

/// Result of a get-or-create against local storage.
///
/// Both branches carry a usable value; `Ephemeral` means it was not
/// persisted and will not survive a reload.
#[derive(Debug, Clone)]
pub enum Stored<T> {
    /// Loaded from, or written to, storage.
    Persisted(T),
    /// Generated in memory only because storage failed.
    Ephemeral {
        /// The usable value.
        value: T,
        /// Why persistence failed.
        error: StorageError,
    },
}

impl<T> Stored<T> {
    /// Borrow the value regardless of branch.
    pub fn value(&self) -> &T {
        match self {
            Stored::Persisted(value) => value,
            Stored::Ephemeral { value, .. } => value,
        }
    }

    /// Take the value regardless of branch.
    pub fn into_inner(self) -> T {
        match self {
            Stored::Persisted(value) => value,
            Stored::Ephemeral { value, .. } => value,
        }
    }

    /// Was the value persisted?
    pub fn is_persisted(&self) -> bool {
        matches!(self, Stored::Persisted(_))
    }
}

// =============================================================================
// TESTS
// =============================================================================
