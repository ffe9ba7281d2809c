//! # Tabletop Sync
//!
//! Synchronization core for a multiplayer virtual tabletop: a signed,
//! append-only command log replayed deterministically on every peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TABLETOP SYNC                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Deterministic primitives               │
//! │  ├── canonical.rs  - Canonical JSON serialization           │
//! │  ├── hash.rs       - Domain-separated state hashing         │
//! │  ├── storage.rs    - Key-value persistence                  │
//! │  └── identity.rs   - Signing/encryption key pairs           │
//! │                                                             │
//! │  game/             - Table logic (deterministic)            │
//! │  ├── state.rs      - Players, zones, cards, maps            │
//! │  ├── mutators.rs   - Idempotent map operators               │
//! │  ├── commands.rs   - Command set, replay, builders          │
//! │  └── visibility.rs - Per-viewer projection                  │
//! │                                                             │
//! │  proof/            - Verification                           │
//! │  ├── envelope.rs   - Signed command envelopes               │
//! │  ├── snapshot.rs   - Signed state-hash checkpoints          │
//! │  └── verify.rs     - Keys, seq tracking, log replay         │
//! │                                                             │
//! │  network/          - Session plumbing (non-deterministic)   │
//! │  ├── store.rs      - Replicated store seam                  │
//! │  ├── session.rs    - Session directory                      │
//! │  ├── log.rs        - Command log driver                     │
//! │  ├── auth.rs       - Join tokens                            │
//! │  ├── reconnect.rs  - Backoff and reconnect state            │
//! │  ├── signaling.rs  - WebSocket signaling client             │
//! │  └── echo.rs       - Remote-update echo suppression         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are deterministic:
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time dependencies
//! - Shuffles happen once, at build time, and are replicated as an order
//!
//! Given the same log, every peer reaches the same maps and therefore the
//! same canonical state hash.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod game;
pub mod network;
pub mod proof;

// Re-export commonly used types
pub use crate::core::hash::StateHash;
pub use crate::core::identity::{PublicIdentity, SessionIdentity};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use game::commands::{Command, CommandBuilder};
pub use game::state::{Card, CardId, Player, PlayerId, TableMaps, Zone, ZoneId, ZoneType};
pub use network::log::{CommandLog, SyncReport};
pub use proof::envelope::CommandEnvelope;
pub use proof::snapshot::SignedSnapshot;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
