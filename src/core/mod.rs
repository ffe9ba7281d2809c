//! Core deterministic primitives.
//!
//! Canonical serialization, state hashing, key-value persistence and
//! signing identities. Everything here is independent of table semantics.

pub mod canonical;
pub mod hash;
pub mod identity;
pub mod storage;

// Re-export core types
pub use canonical::{canonicalize, canonicalize_bytes, CanonicalError, CanonicalValue};
pub use hash::{canonical_state_hash, StateHash};
pub use identity::{PublicIdentity, SessionIdentity, Signature, SigningKeyPair, VerifyKey};
pub use storage::{KeyValueStorage, MemoryStorage, StorageError, Stored};
