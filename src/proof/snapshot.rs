//! Snapshot Checkpoints
//!
//! A signed assertion that the replicated maps hashed to `stateHash` after
//! the first `seq` commands of the log were applied. Peers use the newest
//! verified checkpoint to bound replay on reconnect, and compare hashes to
//! detect divergence.
//!
//! A checkpoint also names the last entry it covers. Entries that sort
//! earlier can still arrive after the checkpoint was signed; once the entry
//! at `seq - 1` is no longer the named one, the checkpoint describes a prefix
//! that no longer exists and is superseded.

use serde::{Deserialize, Serialize};

use crate::core::canonical::CanonicalError;
use crate::core::hash::{canonical_state_hash, StateHash};
use crate::core::identity::{sign, verify, Signature, SigningKeyPair};
use crate::game::state::{PlayerId, TableMaps};
use crate::proof::envelope::{CommandEnvelope, LogOrder};
use crate::proof::verify::{KeyDirectory, VerificationError};

/// Signed checkpoint of the replicated maps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSnapshot {
    /// Session.
    pub session_id: String,
    /// Log position: number of commands covered.
    pub seq: u64,
    /// Order of the last covered entry, `None` at position 0.
    #[serde(default)]
    pub through: Option<LogOrder>,
    /// Hex SHA-256 of the canonical maps.
    pub state_hash: String,
    /// Snapshot author.
    pub author_id: PlayerId,
    /// Epoch millis.
    pub timestamp: i64,
    /// Hex Ed25519 signature.
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody<'a> {
    session_id: &'a str,
    seq: u64,
    through: Option<&'a LogOrder>,
    state_hash: &'a str,
    author_id: &'a PlayerId,
    timestamp: i64,
}

/// Hash replicated maps the way checkpoints do.
pub fn table_state_hash(maps: &TableMaps) -> Result<StateHash, CanonicalError> {
    canonical_state_hash(maps)
}

/// True when the first `seq` entries of `commands` end with `through`.
pub fn covers_prefix(commands: &[CommandEnvelope], seq: u64, through: Option<&LogOrder>) -> bool {
    let Ok(len) = usize::try_from(seq) else {
        return false;
    };
    match (len, through) {
        (0, None) => true,
        (0, Some(_)) | (_, None) => false,
        (len, Some(through)) => commands.get(len - 1).is_some_and(|last| &last.order() == through),
    }
}

impl SignedSnapshot {
    /// Hash `maps` and sign the checkpoint.
    pub fn create(
        session_id: impl Into<String>,
        seq: u64,
        through: Option<LogOrder>,
        maps: &TableMaps,
        author_id: PlayerId,
        key: &SigningKeyPair,
        timestamp: i64,
    ) -> Result<Self, CanonicalError> {
        let session_id = session_id.into();
        let state_hash = hex::encode(table_state_hash(maps)?);
        let signature = sign(
            &SnapshotBody {
                session_id: &session_id,
                seq,
                through: through.as_ref(),
                state_hash: &state_hash,
                author_id: &author_id,
                timestamp,
            },
            key,
        )?;

        Ok(Self {
            session_id,
            seq,
            through,
            state_hash,
            author_id,
            timestamp,
            signature: signature.to_hex(),
        })
    }

    fn body(&self) -> SnapshotBody<'_> {
        SnapshotBody {
            session_id: &self.session_id,
            seq: self.seq,
            through: self.through.as_ref(),
            state_hash: &self.state_hash,
            author_id: &self.author_id,
            timestamp: self.timestamp,
        }
    }

    /// Verify the author's signature and return the decoded hash.
    pub fn verify(&self, keys: &KeyDirectory) -> Result<StateHash, VerificationError> {
        let key = keys
            .get(&self.author_id)
            .ok_or_else(|| VerificationError::UnknownAuthor {
                author_id: self.author_id.clone(),
            })?;
        let malformed = || VerificationError::MalformedSnapshot {
            author_id: self.author_id.clone(),
            seq: self.seq,
        };
        let signature = Signature::from_hex(&self.signature).ok_or_else(malformed)?;
        let hash: StateHash = hex::decode(&self.state_hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(malformed)?;

        if !verify(&self.body(), &signature, key) {
            return Err(VerificationError::BadSnapshotSignature {
                author_id: self.author_id.clone(),
                seq: self.seq,
            });
        }
        Ok(hash)
    }

    /// Does `commands` still start with the prefix this checkpoint covers?
    pub fn covers(&self, commands: &[CommandEnvelope]) -> bool {
        covers_prefix(commands, self.seq, self.through.as_ref())
    }

    /// Compare the checkpoint hash against `maps`.
    pub fn check_state(&self, expected: &StateHash, maps: &TableMaps) -> Result<(), VerificationError> {
        let computed = table_state_hash(maps).map_err(|_| VerificationError::MalformedSnapshot {
            author_id: self.author_id.clone(),
            seq: self.seq,
        })?;
        if &computed != expected {
            return Err(VerificationError::SnapshotHashMismatch {
                seq: self.seq,
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
