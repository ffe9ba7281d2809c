//! State Hashing for Verification
//!
//! Provides deterministic hashing of replicated table state for:
//! - Snapshot checkpoints (divergence detection between peers)
//! - Player id derivation from public keys
//! - Seed expansion for deterministic identities

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::canonical::{canonicalize_bytes, CanonicalError};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain separator for replicated table state.
pub const TABLE_STATE_DOMAIN: &[u8] = b"TABLETOP_STATE_V1";

/// Deterministic hasher with a domain separator.
///
/// Order of updates is critical for determinism.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for table state.
    pub fn for_table_state() -> Self {
        Self::new(TABLE_STATE_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the canonical form of a value under the table-state domain.
///
/// This is the `stateHash` carried by snapshot checkpoints.
pub fn canonical_state_hash<T: Serialize + ?Sized>(value: &T) -> Result<StateHash, CanonicalError> {
    let bytes = canonicalize_bytes(value)?;
    let mut hasher = StateHasher::for_table_state();
    hasher.update_bytes(&bytes);
    Ok(hasher.finalize())
}

// =============================================================================
// TESTS
// =============================================================================
