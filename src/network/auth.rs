//! Join Tokens
//!
//! Short-lived HS256 tokens authorizing entry to one room. The issuing
//! endpoint checks the request origin against an allow-list, requires a
//! server-held secret, and validates the room id, each with its own
//! rejection. Expiry is carried in epoch milliseconds and verified with a
//! small grace window for clock skew.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{env_list, env_or};

/// Token lifetime (5 minutes).
pub const JOIN_TOKEN_TTL_MS: i64 = 5 * 60 * 1000;

/// Clock-skew grace applied when checking expiry.
pub const JOIN_TOKEN_GRACE_MS: i64 = 5_000;

/// Longest accepted room id.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Malformed input on the join path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Request did not name a room.
    #[error("missing room id")]
    MissingRoomId,
    /// Room id has the wrong length or characters.
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
    /// Base URL is not http(s) or ws(s).
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

/// Authorization failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Request origin is not on the allow-list.
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
    /// Server has no signing secret configured.
    #[error("join token secret not configured")]
    MissingSecret,
    /// Request failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Token has expired.
    #[error("token expired at {exp} (now {now})")]
    Expired {
        /// Token expiry, epoch millis.
        exp: i64,
        /// Verification time, epoch millis.
        now: i64,
    },
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token could not be decoded or encoded.
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Check a room id: 1 to 64 characters of `[A-Za-z0-9_-]`.
pub fn validate_room_id(room_id: &str) -> Result<(), ValidationError> {
    if room_id.is_empty() {
        return Err(ValidationError::MissingRoomId);
    }
    let valid_chars = room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if room_id.len() > MAX_ROOM_ID_LEN || !valid_chars {
        return Err(ValidationError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}

// =============================================================================
// TOKENS
// =============================================================================

/// Claims carried by a join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenClaims {
    /// Room the token admits to.
    pub room_id: String,
    /// Expiry, epoch millis.
    pub exp: i64,
}

/// Sign a join token.
pub fn create_join_token(claims: &JoinTokenClaims, secret: &str) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::MissingSecret);
    }
    let key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::new(Algorithm::HS256), claims, &key).map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Verify a join token's signature and expiry.
///
/// `exp` is in milliseconds, so the library's seconds-based expiry check is
/// disabled and done here instead.
pub fn verify_join_token(
    token: &str,
    secret: &str,
    now_ms: i64,
    grace_ms: i64,
) -> Result<JoinTokenClaims, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::MissingSecret);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_exp = false;

    let key = DecodingKey::from_secret(secret.as_bytes());
    let claims = decode::<JoinTokenClaims>(token, &key, &validation)
        .map_err(map_jwt_error)?
        .claims;

    validate_room_id(&claims.room_id)?;
    if now_ms > claims.exp + grace_ms {
        return Err(AuthError::Expired {
            exp: claims.exp,
            now: now_ms,
        });
    }
    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

// =============================================================================
// ISSUER
// =============================================================================

/// Join token configuration.
#[derive(Clone, Debug)]
pub struct JoinTokenConfig {
    /// HS256 secret. Issuance is refused without one.
    pub secret: Option<String>,
    /// Origins allowed to request tokens.
    pub allowed_origins: Vec<String>,
    /// Token lifetime.
    pub ttl_ms: i64,
    /// Expiry grace.
    pub grace_ms: i64,
}

impl Default for JoinTokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            allowed_origins: Vec::new(),
            ttl_ms: JOIN_TOKEN_TTL_MS,
            grace_ms: JOIN_TOKEN_GRACE_MS,
        }
    }
}

impl JoinTokenConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            secret: std::env::var("JOIN_TOKEN_SECRET").ok().filter(|s| !s.is_empty()),
            allowed_origins: env_list("JOIN_TOKEN_ALLOWED_ORIGINS"),
            ttl_ms: env_or("JOIN_TOKEN_TTL_MS", defaults.ttl_ms),
            grace_ms: env_or("JOIN_TOKEN_GRACE_MS", defaults.grace_ms),
        }
    }
}

/// Body of a token request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenRequest {
    /// Room to join.
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Body of a token response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTokenResponse {
    /// Signed token.
    pub token: String,
    /// Expiry, epoch millis.
    pub exp: i64,
}

/// The join token endpoint's contract.
#[derive(Clone, Debug)]
pub struct JoinTokenIssuer {
    config: JoinTokenConfig,
}

impl JoinTokenIssuer {
    /// Create an issuer.
    pub fn new(config: JoinTokenConfig) -> Self {
        Self { config }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin)
    }

    /// Issue a token. Checks origin, then secret, then room id.
    pub fn issue(
        &self,
        origin: Option<&str>,
        request: &JoinTokenRequest,
        now_ms: i64,
    ) -> Result<JoinTokenResponse, AuthError> {
        let origin = origin.unwrap_or_default();
        if !self.origin_allowed(origin) {
            warn!(origin, "Join token request from disallowed origin");
            return Err(AuthError::OriginNotAllowed(origin.to_string()));
        }

        let secret = self.config.secret.as_deref().ok_or(AuthError::MissingSecret)?;

        let room_id = request.room_id.as_deref().unwrap_or_default();
        validate_room_id(room_id)?;

        let exp = now_ms + self.config.ttl_ms;
        let token = create_join_token(
            &JoinTokenClaims {
                room_id: room_id.to_string(),
                exp,
            },
            secret,
        )?;
        Ok(JoinTokenResponse { token, exp })
    }

    /// Verify a token issued by this endpoint.
    pub fn verify(&self, token: &str, now_ms: i64) -> Result<JoinTokenClaims, AuthError> {
        let secret = self.config.secret.as_deref().ok_or(AuthError::MissingSecret)?;
        verify_join_token(token, secret, now_ms, self.config.grace_ms)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-256-bits-long!!";
    const NOW: i64 = 1_700_000_000_000;

    fn issuer() -> JoinTokenIssuer {
        JoinTokenIssuer::new(JoinTokenConfig {
            secret: Some(SECRET.into()),
            allowed_origins: vec!["https://play.example.com".into()],
            ..Default::default()
        })
    }

    fn request(room: &str) -> JoinTokenRequest {
        JoinTokenRequest {
            room_id: Some(room.into()),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = issuer();
        let response = issuer
            .issue(Some("https://play.example.com"), &request("room-1"), NOW)
            .unwrap();
        assert_eq!(response.exp, NOW + JOIN_TOKEN_TTL_MS);

        let claims = issuer.verify(&response.token, NOW + 1_000).unwrap();
        assert_eq!(claims.room_id, "room-1");
    }

    #[test]
    fn test_disallowed_origin_rejected_before_issuance() {
        let issuer = issuer();
        let err = issuer
            .issue(Some("https://evil.example.com"), &request("room-1"), NOW)
            .unwrap_err();
        assert_eq!(err, AuthError::OriginNotAllowed("https://evil.example.com".into()));

        let err = issuer.issue(None, &request("room-1"), NOW).unwrap_err();
        assert!(matches!(err, AuthError::OriginNotAllowed(_)));
    }

    #[test]
    fn test_trailing_slash_origin_accepted() {
        assert!(issuer()
            .issue(Some("https://play.example.com/"), &request("r"), NOW)
            .is_ok());
    }

    #[test]
    fn test_distinct_rejections() {
        let no_secret = JoinTokenIssuer::new(JoinTokenConfig {
            allowed_origins: vec!["https://play.example.com".into()],
            ..Default::default()
        });
        let origin = Some("https://play.example.com");

        assert_eq!(
            no_secret.issue(origin, &request("room-1"), NOW).unwrap_err(),
            AuthError::MissingSecret
        );
        assert_eq!(
            issuer().issue(origin, &JoinTokenRequest::default(), NOW).unwrap_err(),
            AuthError::Validation(ValidationError::MissingRoomId)
        );
        assert_eq!(
            issuer().issue(origin, &request("bad room!"), NOW).unwrap_err(),
            AuthError::Validation(ValidationError::InvalidRoomId("bad room!".into()))
        );
    }

    #[test]
    fn test_expiry_with_grace() {
        let token = create_join_token(
            &JoinTokenClaims {
                room_id: "room".into(),
                exp: NOW,
            },
            SECRET,
        )
        .unwrap();

        assert!(verify_join_token(&token, SECRET, NOW + JOIN_TOKEN_GRACE_MS, JOIN_TOKEN_GRACE_MS).is_ok());
        let err = verify_join_token(&token, SECRET, NOW + JOIN_TOKEN_GRACE_MS + 1, JOIN_TOKEN_GRACE_MS)
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired { .. }));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = create_join_token(
            &JoinTokenClaims {
                room_id: "room".into(),
                exp: NOW,
            },
            SECRET,
        )
        .unwrap();
        let err = verify_join_token(&token, "another-secret-entirely!!", NOW, 0).unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let err = verify_join_token("not.a.token", SECRET, NOW, 0).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_room_id_rules() {
        assert!(validate_room_id("Room_1-a").is_ok());
        assert_eq!(validate_room_id(""), Err(ValidationError::MissingRoomId));
        assert!(validate_room_id(&"a".repeat(64)).is_ok());
        assert!(validate_room_id(&"a".repeat(65)).is_err());
        assert!(validate_room_id("ünïcode").is_err());
    }
}
