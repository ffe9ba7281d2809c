//! Network Layer
//!
//! Session plumbing around the replicated document: the command log driver,
//! join tokens, the signaling link and its reconnection policy.
//! This layer is **non-deterministic** - all table logic runs through `game/`.

pub mod auth;
pub mod echo;
pub mod log;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod store;

pub use auth::{
    create_join_token, validate_room_id, verify_join_token, AuthError, JoinTokenClaims, JoinTokenConfig,
    JoinTokenIssuer, JoinTokenRequest, JoinTokenResponse, ValidationError,
};
pub use echo::{EchoGuard, LocalMirror, PublishDecision, UpdateOrigin};
pub use log::{CommandLog, CommandLogError, DivergenceReport, LogState, SnapshotPolicy, SyncReport};
pub use reconnect::{
    compute_backoff_delay, is_room_reset_close, should_abandon_reconnect, BackoffConfig, CloseReason,
    ReconnectController, ReconnectDecision, ReconnectState,
};
pub use session::{SessionDirectory, SessionError, SessionHandle};
pub use signaling::{signaling_url, SignalingClient, SignalingConfig, SignalingEvent, TransportError};
pub use store::{MemoryStore, ReplicatedStore};
