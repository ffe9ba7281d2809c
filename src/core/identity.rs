//! Session Identity & Signing
//!
//! Per-session key material:
//! - Ed25519 signing pair for command envelopes and snapshot checkpoints
//! - X25519 encryption pair for private payloads
//! - An opaque owner key
//!
//! Signing always goes through the canonical form; there is no API that
//! signs raw, non-canonicalized bytes.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;
use x25519_dalek::{PublicKey as EncPublicKey, StaticSecret};

use super::canonical::{canonicalize_bytes, CanonicalError};
use super::hash::hash_with_domain;
use super::storage::{KeyValueStorage, StorageError, Stored};
use crate::game::state::PlayerId;

const SIGN_SEED_DOMAIN: &[u8] = b"TABLETOP_SIGN_SEED_V1";
const ENC_SEED_DOMAIN: &[u8] = b"TABLETOP_ENC_SEED_V1";
const OWNER_SEED_DOMAIN: &[u8] = b"TABLETOP_OWNER_SEED_V1";
const PLAYER_ID_DOMAIN: &[u8] = b"tabletop-player:";

/// Storage key prefix for persisted identities.
pub const IDENTITY_KEY_PREFIX: &str = "tabletop:identity:";

/// Storage key for the client correlation key.
pub const CLIENT_KEY_STORAGE_KEY: &str = "tabletop:client-key";

// =============================================================================
// KEYS & SIGNATURES
// =============================================================================

/// Ed25519 public key (32 bytes), shared with peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerifyKey([u8; 32]);

impl VerifyKey {
    /// Create from bytes, rejecting points that are not valid keys.
    pub fn from_bytes(bytes: [u8; 32]) -> Option<Self> {
        VerifyingKey::from_bytes(&bytes).ok()?;
        Some(Self(bytes))
    }

    /// Parse from lowercase/uppercase hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
        Self::from_bytes(bytes)
    }

    /// Hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyKey({})", &self.to_hex()[..8])
    }
}

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse from hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 64] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

/// Ed25519 signing pair. The secret half never leaves the client.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generate a random pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Create from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Public half.
    pub fn public_key(&self) -> VerifyKey {
        VerifyKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Secret seed (for local persistence only).
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    fn sign_bytes(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Sign the canonical form of `payload`.
pub fn sign<T: Serialize + ?Sized>(
    payload: &T,
    key: &SigningKeyPair,
) -> Result<Signature, CanonicalError> {
    let bytes = canonicalize_bytes(payload)?;
    Ok(key.sign_bytes(&bytes))
}

/// Verify a signature over the canonical form of `payload`.
///
/// Returns false for any failure, including payloads that cannot be
/// canonicalized.
pub fn verify<T: Serialize + ?Sized>(payload: &T, signature: &Signature, key: &VerifyKey) -> bool {
    let Ok(bytes) = canonicalize_bytes(payload) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key.0) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify(&bytes, &sig).is_ok()
}

/// Derive a stable player id from a signing public key.
pub fn player_id_for_key(key: &VerifyKey) -> PlayerId {
    let hash = hash_with_domain(PLAYER_ID_DOMAIN, key.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&hash[..16]);
    PlayerId::new(uuid::Uuid::from_bytes(id).to_string())
}

// =============================================================================
// SESSION IDENTITY
// =============================================================================

/// Public, shareable part of an identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    /// Player this identity speaks for.
    pub player_id: PlayerId,
    /// Hex Ed25519 public key.
    pub sign_public_key: String,
    /// Hex X25519 public key.
    pub enc_public_key: String,
}

/// Per-session identity. Created once per session and persisted locally.
#[derive(Clone)]
pub struct SessionIdentity {
    /// Player id derived from the signing key.
    pub player_id: PlayerId,
    signing: SigningKeyPair,
    encryption: StaticSecret,
    owner_key: [u8; 32],
}

/// On-disk form of [`SessionIdentity`]. Local-only; never replicated.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    player_id: PlayerId,
    sign_public_key: String,
    sign_private_key: String,
    enc_public_key: String,
    enc_private_key: String,
    owner_key: String,
}

impl SessionIdentity {
    /// Build an identity. Deterministic when a seed is supplied.
    pub fn create(seed: Option<&[u8]>) -> Self {
        let (sign_seed, enc_seed, owner_key) = match seed {
            Some(seed) => (
                hash_with_domain(SIGN_SEED_DOMAIN, seed),
                hash_with_domain(ENC_SEED_DOMAIN, seed),
                hash_with_domain(OWNER_SEED_DOMAIN, seed),
            ),
            None => {
                let mut material = [[0u8; 32]; 3];
                for chunk in material.iter_mut() {
                    OsRng.fill_bytes(chunk);
                }
                (material[0], material[1], material[2])
            }
        };

        let signing = SigningKeyPair::from_seed(sign_seed);
        let player_id = player_id_for_key(&signing.public_key());
        Self {
            player_id,
            signing,
            encryption: StaticSecret::from(enc_seed),
            owner_key,
        }
    }

    /// Signing pair.
    pub fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }

    /// Signing public key.
    pub fn sign_public_key(&self) -> VerifyKey {
        self.signing.public_key()
    }

    /// X25519 public key bytes.
    pub fn enc_public_key(&self) -> [u8; 32] {
        EncPublicKey::from(&self.encryption).to_bytes()
    }

    /// Opaque owner key, hex encoded.
    pub fn owner_key(&self) -> String {
        hex::encode(self.owner_key)
    }

    /// Shareable view.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            player_id: self.player_id.clone(),
            sign_public_key: self.sign_public_key().to_hex(),
            enc_public_key: hex::encode(self.enc_public_key()),
        }
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            player_id: self.player_id.clone(),
            sign_public_key: self.sign_public_key().to_hex(),
            sign_private_key: hex::encode(self.signing.to_seed()),
            enc_public_key: hex::encode(self.enc_public_key()),
            enc_private_key: hex::encode(self.encryption.to_bytes()),
            owner_key: self.owner_key(),
        }
    }

    fn from_record(record: IdentityRecord) -> Result<Self, String> {
        let decode32 = |field: &str, value: &str| -> Result<[u8; 32], String> {
            hex::decode(value)
                .map_err(|e| format!("{field}: {e}"))?
                .try_into()
                .map_err(|_| format!("{field}: expected 32 bytes"))
        };

        let signing = SigningKeyPair::from_seed(decode32("signPrivateKey", &record.sign_private_key)?);
        if signing.public_key().to_hex() != record.sign_public_key.to_lowercase() {
            return Err("signPublicKey does not match signPrivateKey".into());
        }
        let encryption = StaticSecret::from(decode32("encPrivateKey", &record.enc_private_key)?);
        let owner_key = decode32("ownerKey", &record.owner_key)?;

        Ok(Self {
            player_id: record.player_id,
            signing,
            encryption,
            owner_key,
        })
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("player_id", &self.player_id)
            .field("sign_public_key", &self.sign_public_key())
            .finish_non_exhaustive()
    }
}

/// Convenience wrapper matching the session identity contract.
pub fn create_identity(seed: Option<&[u8]>) -> SessionIdentity {
    SessionIdentity::create(seed)
}

// =============================================================================
// IDENTITY STORE
// =============================================================================

fn identity_key(session_id: &str) -> String {
    format!("{IDENTITY_KEY_PREFIX}{session_id}")
}

/// Load a persisted identity. Storage failures and corrupt records read as `None`.
pub fn load_session_identity(session_id: &str, storage: &dyn KeyValueStorage) -> Option<SessionIdentity> {
    let key = identity_key(session_id);
    let raw = match storage.get_item(&key) {
        Ok(raw) => raw?,
        Err(error) => {
            warn!(session_id, %error, "identity load failed");
            return None;
        }
    };

    let decoded = serde_json::from_str::<IdentityRecord>(&raw)
        .map_err(|e| e.to_string())
        .and_then(SessionIdentity::from_record);
    match decoded {
        Ok(identity) => Some(identity),
        Err(reason) => {
            let error = StorageError::Corrupt { key, reason };
            warn!(session_id, %error, "discarding corrupt identity record");
            None
        }
    }
}

/// Return the session's identity, creating and persisting one on first use.
///
/// Never fails: when storage is unusable a fresh identity is returned as
/// [`Stored::Ephemeral`].
pub fn get_or_create_session_identity(
    session_id: &str,
    storage: &mut dyn KeyValueStorage,
) -> Stored<SessionIdentity> {
    let key = identity_key(session_id);

    if let Err(error) = storage.get_item(&key) {
        warn!(session_id, %error, "identity storage unavailable, using ephemeral identity");
        return Stored::Ephemeral {
            value: SessionIdentity::create(None),
            error,
        };
    }

    if let Some(identity) = load_session_identity(session_id, storage) {
        return Stored::Persisted(identity);
    }

    let identity = SessionIdentity::create(None);
    let persisted = serde_json::to_string(&identity.to_record())
        .map_err(|e| StorageError::Write(e.to_string()))
        .and_then(|raw| storage.set_item(&key, &raw));

    match persisted {
        Ok(()) => Stored::Persisted(identity),
        Err(error) => {
            warn!(session_id, %error, "identity not persisted");
            Stored::Ephemeral {
                value: identity,
                error,
            }
        }
    }
}

/// Delete the session's persisted identity.
pub fn delete_session_identity(
    session_id: &str,
    storage: &mut dyn KeyValueStorage,
) -> Result<(), StorageError> {
    storage.remove_item(&identity_key(session_id))
}

/// Return the locally persisted client correlation key, creating it if needed.
///
/// Storage failures yield an in-memory key for this call only.
pub fn get_or_create_client_key(storage: &mut dyn KeyValueStorage) -> Stored<String> {
    match storage.get_item(CLIENT_KEY_STORAGE_KEY) {
        Ok(Some(existing)) if !existing.is_empty() => return Stored::Persisted(existing),
        Ok(_) => {}
        Err(error) => {
            return Stored::Ephemeral {
                value: uuid::Uuid::new_v4().to_string(),
                error,
            }
        }
    }

    let key = uuid::Uuid::new_v4().to_string();
    match storage.set_item(CLIENT_KEY_STORAGE_KEY, &key) {
        Ok(()) => Stored::Persisted(key),
        Err(error) => Stored::Ephemeral { value: key, error },
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::tests::{BrokenStorage, ReadOnlyStorage};
    use crate::core::storage::MemoryStorage;
    use serde_json::json;

    #[test]
    fn test_sign_verify() {
        let keys = SigningKeyPair::generate();
        let payload = json!({ "type": "card.tap", "seq": 1 });

        let signature = sign(&payload, &keys).unwrap();
        assert!(verify(&payload, &signature, &keys.public_key()));
    }

    #[test]
    fn test_verify_is_key_order_independent() {
        let keys = SigningKeyPair::generate();
        let a = json!({ "a": 1, "b": 2 });
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();

        let signature = sign(&a, &keys).unwrap();
        assert!(verify(&b, &signature, &keys.public_key()));
    }

    #[test]
    fn test_wrong_payload_fails() {
        let keys = SigningKeyPair::generate();
        let signature = sign(&json!({ "n": 1 }), &keys).unwrap();
        assert!(!verify(&json!({ "n": 2 }), &signature, &keys.public_key()));
    }

    #[test]
    fn test_wrong_key_fails() {
        let keys1 = SigningKeyPair::generate();
        let keys2 = SigningKeyPair::generate();
        let payload = json!("test");

        let signature = sign(&payload, &keys1).unwrap();
        assert!(!verify(&payload, &signature, &keys2.public_key()));
    }

    #[test]
    fn test_hex_roundtrip_of_key_and_signature() {
        let keys = SigningKeyPair::from_seed([7u8; 32]);
        let signature = sign(&json!([1, 2, 3]), &keys).unwrap();

        assert_eq!(VerifyKey::from_hex(&keys.public_key().to_hex()), Some(keys.public_key()));
        assert_eq!(Signature::from_hex(&signature.to_hex()), Some(signature));
        assert_eq!(Signature::from_hex("zz"), None);
        assert_eq!(VerifyKey::from_hex("00"), None);
    }

    #[test]
    fn test_seeded_identity_is_deterministic() {
        let a = create_identity(Some(b"seed-1"));
        let b = create_identity(Some(b"seed-1"));
        let c = create_identity(Some(b"seed-2"));

        assert_eq!(a.player_id, b.player_id);
        assert_eq!(a.sign_public_key(), b.sign_public_key());
        assert_eq!(a.enc_public_key(), b.enc_public_key());
        assert_eq!(a.owner_key(), b.owner_key());
        assert_ne!(a.player_id, c.player_id);
    }

    #[test]
    fn test_random_identities_differ() {
        let a = create_identity(None);
        let b = create_identity(None);
        assert_ne!(a.sign_public_key(), b.sign_public_key());
    }

    #[test]
    fn test_player_id_is_uuid_shaped() {
        let identity = create_identity(Some(b"uuid"));
        assert!(uuid::Uuid::parse_str(identity.player_id.as_str()).is_ok());
        assert_eq!(identity.player_id, player_id_for_key(&identity.sign_public_key()));
    }

    #[test]
    fn test_public_identity_has_no_secret() {
        let identity = create_identity(Some(b"public"));
        let public = serde_json::to_string(&identity.public()).unwrap();
        let secret = hex::encode(identity.signing().to_seed());
        assert!(!public.contains(&secret));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut storage = MemoryStorage::new();

        let first = get_or_create_session_identity("room-1", &mut storage);
        let second = get_or_create_session_identity("room-1", &mut storage);
        assert!(first.is_persisted());
        assert!(second.is_persisted());

        let (first, second) = (first.into_inner(), second.into_inner());
        assert_eq!(first.player_id, second.player_id);
        assert_eq!(first.sign_public_key(), second.sign_public_key());
        assert_eq!(first.enc_public_key(), second.enc_public_key());
        assert_eq!(first.owner_key(), second.owner_key());
    }

    #[test]
    fn test_identities_are_per_session() {
        let mut storage = MemoryStorage::new();
        let a = get_or_create_session_identity("room-a", &mut storage).into_inner();
        let b = get_or_create_session_identity("room-b", &mut storage).into_inner();
        assert_ne!(a.player_id, b.player_id);
    }

    #[test]
    fn test_delete_then_load_is_none() {
        let mut storage = MemoryStorage::new();
        get_or_create_session_identity("room-1", &mut storage);
        assert!(load_session_identity("room-1", &storage).is_some());

        delete_session_identity("room-1", &mut storage).unwrap();
        assert!(load_session_identity("room-1", &storage).is_none());
    }

    #[test]
    fn test_broken_storage_falls_back_to_ephemeral() {
        let mut storage = BrokenStorage;
        let result = get_or_create_session_identity("room-1", &mut storage);
        assert!(matches!(result, Stored::Ephemeral { error: StorageError::Read(_), .. }));
    }

    #[test]
    fn test_unwritable_storage_falls_back_to_ephemeral() {
        let mut storage = ReadOnlyStorage;
        let result = get_or_create_session_identity("room-1", &mut storage);
        assert!(matches!(result, Stored::Ephemeral { error: StorageError::Write(_), .. }));
    }

    #[test]
    fn test_corrupt_record_is_replaced() {
        let mut storage = MemoryStorage::new();
        storage.set_item(&identity_key("room-1"), "{not json").unwrap();

        assert!(load_session_identity("room-1", &storage).is_none());
        let result = get_or_create_session_identity("room-1", &mut storage);
        assert!(result.is_persisted());
        assert!(load_session_identity("room-1", &storage).is_some());
    }

    #[test]
    fn test_client_key_persists() {
        let mut storage = MemoryStorage::new();
        let a = get_or_create_client_key(&mut storage);
        let b = get_or_create_client_key(&mut storage);
        assert!(a.is_persisted());
        assert_eq!(a.value(), b.value());
        assert!(uuid::Uuid::parse_str(a.value()).is_ok());
    }

    #[test]
    fn test_client_key_falls_back_in_memory() {
        let mut storage = BrokenStorage;
        let a = get_or_create_client_key(&mut storage);
        assert!(!a.is_persisted());
        assert!(uuid::Uuid::parse_str(a.value()).is_ok());
    }
}
