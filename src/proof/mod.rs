//! Command Log Proofs
//!
//! Provides verifiable replication through:
//! - Signed command envelopes
//! - Signed snapshot checkpoints over the canonical state hash
//! - Verification by deterministic replay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF LAYER                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  envelope.rs  - Signed command envelopes                    │
//! │  snapshot.rs  - Signed state-hash checkpoints               │
//! │  verify.rs    - Key directory, seq tracking, log replay     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod envelope;
pub mod snapshot;
pub mod verify;

// Re-export key types
pub use envelope::{CommandEnvelope, EnvelopeDraft};
pub use snapshot::{table_state_hash, SignedSnapshot};
pub use verify::{
    verify_envelope, verify_log, CheckpointResult, KeyDirectory, ReplayVerification, SeqTracker,
    VerificationError,
};
