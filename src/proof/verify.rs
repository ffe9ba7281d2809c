//! Verification API
//!
//! Author key registry, per-author sequence tracking, and verification of a
//! whole command log by deterministic replay against its snapshot checkpoints.

use std::collections::BTreeMap;

use crate::core::hash::StateHash;
use crate::core::identity::{player_id_for_key, PublicIdentity, VerifyKey};
use crate::game::commands::{apply_command, Command};
use crate::game::state::{PlayerId, TableMaps};
use crate::proof::envelope::CommandEnvelope;
use crate::proof::snapshot::{table_state_hash, SignedSnapshot};

/// Errors raised while verifying remote envelopes and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// No public key registered for the author.
    UnknownAuthor {
        /// Claimed author.
        author_id: PlayerId,
    },

    /// Signature is not 64 hex-encoded bytes.
    MalformedSignature {
        /// Claimed author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
    },

    /// Signature does not match the signing body.
    BadSignature {
        /// Claimed author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
        /// Envelope type.
        command_type: String,
    },

    /// Signed payload does not decode to a known command.
    InvalidCommand {
        /// Author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
        /// Decode failure.
        reason: String,
    },

    /// Envelope was built against a command set this build does not speak.
    UnsupportedVersion {
        /// Author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
        /// Claimed command set version.
        version: u32,
    },

    /// Envelope belongs to another session.
    WrongSession {
        /// Author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
    },

    /// Seq is not above the author's high-water mark.
    StaleSequence {
        /// Author.
        author_id: PlayerId,
        /// Envelope seq.
        seq: u64,
        /// Highest seq already applied.
        high_water: u64,
    },

    /// Snapshot fields cannot be decoded.
    MalformedSnapshot {
        /// Claimed author.
        author_id: PlayerId,
        /// Snapshot position.
        seq: u64,
    },

    /// Snapshot signature does not match.
    BadSnapshotSignature {
        /// Claimed author.
        author_id: PlayerId,
        /// Snapshot position.
        seq: u64,
    },

    /// Recomputed state hash differs from the checkpoint.
    SnapshotHashMismatch {
        /// Snapshot position.
        seq: u64,
        /// Hash carried by the snapshot.
        expected: StateHash,
        /// Hash of local state.
        computed: StateHash,
    },
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAuthor { author_id } => write!(f, "Unknown author {}", author_id),
            Self::MalformedSignature { author_id, seq } => {
                write!(f, "Malformed signature from {} at seq {}", author_id, seq)
            }
            Self::BadSignature { author_id, seq, command_type } => {
                write!(f, "Bad signature on {} from {} at seq {}", command_type, author_id, seq)
            }
            Self::InvalidCommand { author_id, seq, reason } => {
                write!(f, "Invalid command from {} at seq {}: {}", author_id, seq, reason)
            }
            Self::UnsupportedVersion { author_id, seq, version } => {
                write!(f, "Unsupported command set version {} from {} at seq {}", version, author_id, seq)
            }
            Self::WrongSession { author_id, seq } => {
                write!(f, "Envelope from {} at seq {} belongs to another session", author_id, seq)
            }
            Self::StaleSequence { author_id, seq, high_water } => {
                write!(f, "Stale seq {} from {} (already at {})", seq, author_id, high_water)
            }
            Self::MalformedSnapshot { author_id, seq } => {
                write!(f, "Malformed snapshot from {} at position {}", author_id, seq)
            }
            Self::BadSnapshotSignature { author_id, seq } => {
                write!(f, "Bad snapshot signature from {} at position {}", author_id, seq)
            }
            Self::SnapshotHashMismatch { seq, expected, computed } => write!(
                f,
                "Snapshot hash mismatch at position {}: expected {}, computed {}",
                seq,
                hex::encode(&expected[..4]),
                hex::encode(&computed[..4])
            ),
        }
    }
}

impl std::error::Error for VerificationError {}

impl VerificationError {
    /// Stale sequences are expected under redelivery and are not a
    /// security event. Only validly signed envelopes reach the sequence
    /// check, so a forgery is never classed as a duplicate.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::StaleSequence { .. })
    }
}

// =============================================================================
// KEY DIRECTORY
// =============================================================================

/// Known author public keys.
#[derive(Clone, Debug, Default)]
pub struct KeyDirectory {
    keys: BTreeMap<PlayerId, VerifyKey>,
}

impl KeyDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer's public identity.
    ///
    /// Rejected when the key is malformed or the player id was not derived
    /// from it.
    pub fn register(&mut self, identity: &PublicIdentity) -> bool {
        let Some(key) = VerifyKey::from_hex(&identity.sign_public_key) else {
            return false;
        };
        if player_id_for_key(&key) != identity.player_id {
            return false;
        }
        self.keys.insert(identity.player_id.clone(), key);
        true
    }

    /// Key for an author.
    pub fn get(&self, author_id: &PlayerId) -> Option<&VerifyKey> {
        self.keys.get(author_id)
    }

    /// Number of known authors.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no author is known.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// =============================================================================
// SEQUENCE TRACKING
// =============================================================================

/// Highest applied seq per author.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqTracker {
    high_water: BTreeMap<PlayerId, u64>,
}

impl SeqTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `seq` from `author_id` if it is above the high-water mark.
    pub fn check(&self, author_id: &PlayerId, seq: u64) -> Result<(), VerificationError> {
        let high_water = self.high_water.get(author_id).copied().unwrap_or(0);
        if seq <= high_water {
            return Err(VerificationError::StaleSequence {
                author_id: author_id.clone(),
                seq,
                high_water,
            });
        }
        Ok(())
    }

    /// Record an applied seq.
    pub fn record(&mut self, author_id: &PlayerId, seq: u64) {
        let entry = self.high_water.entry(author_id.clone()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Highest applied seq for an author (0 if none).
    pub fn high_water(&self, author_id: &PlayerId) -> u64 {
        self.high_water.get(author_id).copied().unwrap_or(0)
    }
}

// =============================================================================
// LOG REPLAY VERIFICATION
// =============================================================================

/// Result of checking one checkpoint during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Log position.
    pub seq: u64,
    /// Hash carried by the snapshot.
    pub expected: StateHash,
    /// Hash recomputed from replay.
    pub computed: StateHash,
    /// Did this checkpoint match?
    pub valid: bool,
}

/// Outcome of a full log replay.
#[derive(Debug, Clone)]
pub struct ReplayVerification {
    /// Maps produced by replay.
    pub maps: TableMaps,
    /// Sequence state after replay.
    pub tracker: SeqTracker,
    /// Entries applied.
    pub applied: usize,
    /// Entries rejected, by log position.
    pub rejected: Vec<(usize, VerificationError)>,
    /// One result per snapshot that could be checked.
    pub checkpoint_results: Vec<CheckpointResult>,
}

impl ReplayVerification {
    /// Did every checked snapshot match?
    pub fn valid(&self) -> bool {
        self.checkpoint_results.iter().all(|c| c.valid)
    }
}

/// Verify one envelope against session, keys and sequence state.
///
/// The signature is checked before the sequence, so a forged envelope
/// reusing an applied seq surfaces as a signature failure.
pub fn verify_envelope(
    envelope: &CommandEnvelope,
    session_id: &str,
    keys: &KeyDirectory,
    tracker: &SeqTracker,
) -> Result<Command, VerificationError> {
    if envelope.session_id != session_id {
        return Err(VerificationError::WrongSession {
            author_id: envelope.author_id.clone(),
            seq: envelope.seq,
        });
    }
    let command = envelope.verify(keys)?;
    tracker.check(&envelope.author_id, envelope.seq)?;
    Ok(command)
}

/// Replay the whole log from position 0 on top of `base`, checking every
/// verifiable snapshot at its log position.
///
/// Snapshots whose covered prefix is no longer the head of `commands` are
/// superseded and skipped.
///
/// Rejected entries are skipped and reported; they never stop replay.
pub fn verify_log(
    base: &TableMaps,
    session_id: &str,
    commands: &[CommandEnvelope],
    snapshots: &[SignedSnapshot],
    keys: &KeyDirectory,
) -> ReplayVerification {
    let mut checkpoints: Vec<(u64, StateHash)> = snapshots
        .iter()
        .filter(|s| s.session_id == session_id && s.covers(commands))
        .filter_map(|s| s.verify(keys).ok().map(|hash| (s.seq, hash)))
        .collect();
    checkpoints.sort_by_key(|(seq, _)| *seq);

    let mut result = ReplayVerification {
        maps: base.clone(),
        tracker: SeqTracker::new(),
        applied: 0,
        rejected: Vec::new(),
        checkpoint_results: Vec::new(),
    };
    let mut next_checkpoint = 0;

    for position in 0..=commands.len() {
        // Checkpoints at `position` cover the first `position` entries
        while next_checkpoint < checkpoints.len() && checkpoints[next_checkpoint].0 == position as u64 {
            let (seq, expected) = checkpoints[next_checkpoint];
            if let Ok(computed) = table_state_hash(&result.maps) {
                result.checkpoint_results.push(CheckpointResult {
                    seq,
                    expected,
                    computed,
                    valid: computed == expected,
                });
            }
            next_checkpoint += 1;
        }

        let Some(envelope) = commands.get(position) else {
            break;
        };
        match verify_envelope(envelope, session_id, keys, &result.tracker) {
            Ok(command) => {
                apply_command(&mut result.maps, &command);
                result.tracker.record(&envelope.author_id, envelope.seq);
                result.applied += 1;
            }
            Err(err) => result.rejected.push((position, err)),
        }
    }

    result
}

// =============================================================================
// TESTS
// =============================================================================
