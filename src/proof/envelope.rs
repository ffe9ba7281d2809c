//! Command Envelopes
//!
//! A signed, immutable record of one player intent. The signature covers the
//! canonical form of `{sessionId, version, seq, lamport, type, payloadPublic,
//! authorId, timestamp}`; `payloadPrivate` travels alongside unsigned and is
//! never replayed.
//!
//! Every replica keeps the log sorted by [`LogOrder`], so replicas that hold
//! the same entries hold them in the same order no matter how they arrived.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::canonical::CanonicalError;
use crate::core::identity::{sign, verify, Signature, SigningKeyPair};
use crate::game::commands::{Command, COMMAND_SET_VERSION};
use crate::game::state::PlayerId;
use crate::proof::verify::{KeyDirectory, VerificationError};

/// One entry of the replicated command log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Session the command belongs to.
    pub session_id: String,
    /// Command set version the payload was built against.
    pub version: u32,
    /// Author-local sequence number, strictly increasing from 1.
    pub seq: u64,
    /// Lamport clock: one above every entry the author had seen.
    pub lamport: u64,
    /// Command wire name.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Signed payload.
    pub payload_public: Value,
    /// Unsigned side payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_private: Option<Value>,
    /// Author.
    pub author_id: PlayerId,
    /// Author wall clock, epoch millis.
    pub timestamp: i64,
    /// Hex Ed25519 signature over the signing body.
    pub signature: String,
}

/// Exactly the fields covered by the signature.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningBody<'a> {
    session_id: &'a str,
    version: u32,
    seq: u64,
    lamport: u64,
    #[serde(rename = "type")]
    command_type: &'a str,
    payload_public: &'a Value,
    author_id: &'a PlayerId,
    timestamp: i64,
}

/// Unsigned envelope fields, assembled before signing.
#[derive(Clone, Debug)]
pub struct EnvelopeDraft {
    /// Session.
    pub session_id: String,
    /// Sequence number.
    pub seq: u64,
    /// Lamport clock.
    pub lamport: u64,
    /// Command to carry.
    pub command: Command,
    /// Optional private payload.
    pub payload_private: Option<Value>,
    /// Author.
    pub author_id: PlayerId,
    /// Epoch millis.
    pub timestamp: i64,
}

impl EnvelopeDraft {
    /// Sign the draft. Signing is the commit point for a command.
    pub fn sign(self, key: &SigningKeyPair) -> Result<CommandEnvelope, CanonicalError> {
        let (command_type, payload_public) = self
            .command
            .to_parts()
            .map_err(|e| CanonicalError::Serialize(e.to_string()))?;

        let body = SigningBody {
            session_id: &self.session_id,
            version: COMMAND_SET_VERSION,
            seq: self.seq,
            lamport: self.lamport,
            command_type: &command_type,
            payload_public: &payload_public,
            author_id: &self.author_id,
            timestamp: self.timestamp,
        };
        let signature = sign(&body, key)?;

        Ok(CommandEnvelope {
            session_id: self.session_id,
            version: COMMAND_SET_VERSION,
            seq: self.seq,
            lamport: self.lamport,
            command_type,
            payload_public,
            payload_private: self.payload_private,
            author_id: self.author_id,
            timestamp: self.timestamp,
            signature: signature.to_hex(),
        })
    }
}

impl CommandEnvelope {
    fn signing_body(&self) -> SigningBody<'_> {
        SigningBody {
            session_id: &self.session_id,
            version: self.version,
            seq: self.seq,
            lamport: self.lamport,
            command_type: &self.command_type,
            payload_public: &self.payload_public,
            author_id: &self.author_id,
            timestamp: self.timestamp,
        }
    }

    /// Check the signature against the author's registered key and decode
    /// the command.
    pub fn verify(&self, keys: &KeyDirectory) -> Result<Command, VerificationError> {
        let key = keys
            .get(&self.author_id)
            .ok_or_else(|| VerificationError::UnknownAuthor {
                author_id: self.author_id.clone(),
            })?;
        let signature = Signature::from_hex(&self.signature).ok_or_else(|| {
            VerificationError::MalformedSignature {
                author_id: self.author_id.clone(),
                seq: self.seq,
            }
        })?;
        if !verify(&self.signing_body(), &signature, key) {
            return Err(VerificationError::BadSignature {
                author_id: self.author_id.clone(),
                seq: self.seq,
                command_type: self.command_type.clone(),
            });
        }
        if self.version != COMMAND_SET_VERSION {
            return Err(VerificationError::UnsupportedVersion {
                author_id: self.author_id.clone(),
                seq: self.seq,
                version: self.version,
            });
        }

        Command::from_parts(&self.command_type, &self.payload_public).map_err(|e| {
            VerificationError::InvalidCommand {
                author_id: self.author_id.clone(),
                seq: self.seq,
                reason: e.to_string(),
            }
        })
    }

    /// Where this entry sorts in the log.
    pub fn order(&self) -> LogOrder {
        LogOrder {
            lamport: self.lamport,
            author_id: self.author_id.clone(),
            seq: self.seq,
        }
    }

    /// Full sort key. The signature breaks ties between envelopes that claim
    /// the same order, so a forgery still has one agreed position.
    pub fn entry_id(&self) -> EntryId {
        (self.order(), self.signature.clone())
    }
}

/// Position of an entry in the agreed log order: Lamport clock first, then
/// author, then author seq.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOrder {
    /// Lamport clock.
    pub lamport: u64,
    /// Author.
    pub author_id: PlayerId,
    /// Author seq.
    pub seq: u64,
}

/// Order plus signature; unique per distinct envelope.
pub type EntryId = (LogOrder, String);

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::SessionIdentity;
    use serde_json::json;

    fn draft(identity: &SessionIdentity, seq: u64) -> EnvelopeDraft {
        EnvelopeDraft {
            session_id: "room-1".into(),
            seq,
            lamport: seq,
            command: Command::TapCard { card_id: "b1".into(), tapped: true },
            payload_private: Some(json!({ "note": "secret" })),
            author_id: identity.player_id.clone(),
            timestamp: 1_700_000_000_000,
        }
    }

    fn directory(identity: &SessionIdentity) -> KeyDirectory {
        let mut keys = KeyDirectory::new();
        assert!(keys.register(&identity.public()));
        keys
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let envelope = draft(&identity, 1).sign(identity.signing()).unwrap();

        assert_eq!(envelope.command_type, "card.tap");
        assert_eq!(envelope.payload_public, json!({ "cardId": "b1", "tapped": true }));

        let command = envelope.verify(&directory(&identity)).unwrap();
        assert_eq!(command, Command::TapCard { card_id: "b1".into(), tapped: true });
    }

    #[test]
    fn test_private_payload_is_not_signed() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        envelope.payload_private = None;
        assert!(envelope.verify(&directory(&identity)).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        envelope.payload_public = json!({ "cardId": "x1", "tapped": true });

        let err = envelope.verify(&directory(&identity)).unwrap_err();
        assert!(matches!(err, VerificationError::BadSignature { seq: 1, .. }));
    }

    #[test]
    fn test_tampered_seq_rejected() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        envelope.seq = 2;
        assert!(envelope.verify(&directory(&identity)).is_err());
    }

    #[test]
    fn test_unknown_author_rejected() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let envelope = draft(&alice, 1).sign(alice.signing()).unwrap();

        let err = envelope.verify(&KeyDirectory::new()).unwrap_err();
        assert!(matches!(err, VerificationError::UnknownAuthor { .. }));
    }

    #[test]
    fn test_impersonation_rejected() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let mallory = SessionIdentity::create(Some(b"mallory"));

        // Mallory signs a command claiming to be Alice
        let envelope = draft(&alice, 1).sign(mallory.signing()).unwrap();
        let err = envelope.verify(&directory(&alice)).unwrap_err();
        assert!(matches!(err, VerificationError::BadSignature { .. }));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        envelope.signature = "zz".into();
        let err = envelope.verify(&directory(&identity)).unwrap_err();
        assert!(matches!(err, VerificationError::MalformedSignature { .. }));
    }

    #[test]
    fn test_wire_field_names() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let envelope = draft(&identity, 3).sign(identity.signing()).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();

        for field in ["sessionId", "version", "seq", "lamport", "type", "payloadPublic", "payloadPrivate", "authorId", "timestamp", "signature"] {
            assert!(wire.get(field).is_some(), "missing {field}");
        }
        let back: CommandEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_tampered_lamport_rejected() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        envelope.lamport = 0;
        let err = envelope.verify(&directory(&identity)).unwrap_err();
        assert!(matches!(err, VerificationError::BadSignature { .. }));
    }

    #[test]
    fn test_unknown_command_set_version_rejected() {
        let identity = SessionIdentity::create(Some(b"alice"));
        let mut envelope = draft(&identity, 1).sign(identity.signing()).unwrap();
        assert_eq!(envelope.version, COMMAND_SET_VERSION);

        // Re-sign under a future version so only the version check can fail
        envelope.version = COMMAND_SET_VERSION + 1;
        envelope.signature = sign(&envelope.signing_body(), identity.signing()).unwrap().to_hex();
        let err = envelope.verify(&directory(&identity)).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::UnsupportedVersion { version, .. } if version == COMMAND_SET_VERSION + 1
        ));
    }

    #[test]
    fn test_log_order_sorts_by_lamport_then_author() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let bob = SessionIdentity::create(Some(b"bob"));
        let mut early_bob = draft(&bob, 5);
        early_bob.lamport = 1;
        let early_bob = early_bob.sign(bob.signing()).unwrap();
        let mut late_alice = draft(&alice, 1);
        late_alice.lamport = 2;
        let late_alice = late_alice.sign(alice.signing()).unwrap();

        assert!(early_bob.order() < late_alice.order());

        let tie_a = draft(&alice, 1).sign(alice.signing()).unwrap();
        let tie_b = draft(&bob, 1).sign(bob.signing()).unwrap();
        assert_eq!(tie_a.order() < tie_b.order(), alice.player_id < bob.player_id);
    }
}
