//! Crate-level error type.
//!
//! Each subsystem keeps its own error enum; `SyncError` is the umbrella
//! callers can `?` into when they drive several subsystems at once.

use thiserror::Error;

use crate::core::canonical::CanonicalError;
use crate::core::storage::StorageError;
use crate::game::commands::CommandError;
use crate::network::auth::{AuthError, ValidationError};
use crate::network::log::CommandLogError;
use crate::network::session::SessionError;
use crate::network::signaling::TransportError;
use crate::proof::verify::VerificationError;

/// Any synchronization core failure.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Canonical serialization failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Local persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Command could not be built or decoded.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Envelope or checkpoint failed verification.
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),
    /// Join token problem.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Rejected room id or URL.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Signaling link gave up.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Session registry problem.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Command log problem.
    #[error(transparent)]
    Log(#[from] CommandLogError),
}

/// Result alias over [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn open(room: &str) -> SyncResult<()> {
        crate::network::auth::validate_room_id(room)?;
        Ok(())
    }

    #[test]
    fn test_question_mark_conversion() {
        assert!(open("room-1").is_ok());
        let err = open("").unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::MissingRoomId)));
        assert_eq!(err.to_string(), ValidationError::MissingRoomId.to_string());
    }
}
