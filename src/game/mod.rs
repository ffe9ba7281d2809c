//! Table Logic Module
//!
//! The replicated data model and everything that mutates or projects it.
//! 100% deterministic.
//!
//! ## Module Structure
//!
//! - `state`: Players, zones, cards and the replicated maps
//! - `mutators`: Idempotent operators over the maps
//! - `commands`: Closed command set, replay dispatch, payload builders
//! - `visibility`: Per-viewer projection of hidden zones

pub mod state;
pub mod mutators;
pub mod commands;
pub mod visibility;

// Re-export key types
pub use state::{Card, CardId, Player, PlayerId, TableMaps, Zone, ZoneId, ZoneType};
pub use commands::{apply_command, Command, CommandBuilder, CommandError};
pub use visibility::{project_for_viewer, revealed_library_card_ids, RevealMode, ViewerRole};
