//! Export token: lets the device that activated a session fetch its recordings.
//!
//! HS256 with a service-wide secret.  Claims:
//!
//! ```text
//! { "session_id": <uuid>, "device_id": <str>, "exp": <now + ttl>, "type": "export" }
//! ```

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;
use crate::token::TokenError;

/// Required value of the `type` claim.
pub const EXPORT_TOKEN_TYPE: &str = "export";

/// Default lifetime of an export token.
pub const DEFAULT_EXPORT_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportClaims {
    pub session_id: String,
    pub device_id: String,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

#[derive(Debug, Clone)]
pub struct IssuedExportToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies export tokens with one shared secret.
pub struct ExportTokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl ExportTokenCodec {
    /// # Errors
    ///
    /// Returns [`TokenError::EmptySecret`] if `secret` is empty.
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(
        &self,
        session_id: SessionId,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedExportToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = ExportClaims {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            exp: expires_at.timestamp(),
            token_type: EXPORT_TOKEN_TYPE.to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Signing)?;
        Ok(IssuedExportToken { token, expires_at })
    }

    /// Checks signature, expiry, and `type`.
    ///
    /// Binding to a particular session or device is the caller's job.
    ///
    /// # Errors
    ///
    /// [`TokenError::Expired`], [`TokenError::Invalid`], or [`TokenError::WrongType`].
    pub fn verify(&self, token: &str) -> Result<ExportClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let claims = decode::<ExportClaims>(token, &self.decoding, &validation)?.claims;
        if claims.token_type != EXPORT_TOKEN_TYPE {
            return Err(TokenError::WrongType {
                found: claims.token_type,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn codec() -> ExportTokenCodec {
        ExportTokenCodec::new(b"export-test-secret", Duration::seconds(DEFAULT_EXPORT_TTL_SECS))
            .unwrap()
    }

    #[test]
    fn test_empty_secret_is_rejected() {
        let result = ExportTokenCodec::new(b"", Duration::seconds(600));
        assert!(matches!(result, Err(TokenError::EmptySecret)));
    }

    #[test]
    fn test_issue_then_verify_returns_bound_claims() {
        // Arrange
        let session = Uuid::new_v4();
        let now = Utc::now();

        // Act
        let issued = codec().issue(session, "device-1", now).unwrap();
        let claims = codec().verify(&issued.token).unwrap();

        // Assert
        assert_eq!(claims.session_id, session.to_string());
        assert_eq!(claims.device_id, "device-1");
        assert_eq!(claims.token_type, EXPORT_TOKEN_TYPE);
        assert_eq!(claims.exp, now.timestamp() + 600);
        assert_eq!(issued.expires_at, now + Duration::seconds(600));
    }

    #[test]
    fn test_type_claim_is_serialised_as_type() {
        let issued = codec().issue(Uuid::new_v4(), "d", Utc::now()).unwrap();
        let payload = issued.token.split('.').nth(1).unwrap();
        let bytes = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            payload,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "export");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let issued = codec()
            .issue(Uuid::new_v4(), "d", Utc::now() - Duration::hours(1))
            .unwrap();
        assert!(matches!(codec().verify(&issued.token), Err(TokenError::Expired)));
    }

    #[test]
    fn test_token_from_other_secret_is_rejected() {
        let other = ExportTokenCodec::new(b"another-secret", Duration::seconds(600)).unwrap();
        let issued = other.issue(Uuid::new_v4(), "d", Utc::now()).unwrap();
        assert!(matches!(codec().verify(&issued.token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        // Arrange: correctly signed claims with a different type.
        let claims = ExportClaims {
            session_id: Uuid::new_v4().to_string(),
            device_id: "d".into(),
            exp: Utc::now().timestamp() + 60,
            token_type: "transfer".into(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"export-test-secret"),
        )
        .unwrap();

        // Act
        let result = codec().verify(&token);

        // Assert
        assert!(matches!(result, Err(TokenError::WrongType { found }) if found == "transfer"));
    }
}
