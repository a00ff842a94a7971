//! Transfer token: authorises moving a session from one mirror to another.
//!
//! Claims:
//!
//! ```text
//! { "sub": <session id>, "from": <source mirror id>, "to": <destination mirror id>,
//!   "iat": <now>, "nbf": <now>, "exp": <now + ttl>, "purpose": "session_transfer" }
//! ```
//!
//! The source mirror signs with its private key.  The destination verifies
//! with the issuer's public key, then checks `purpose` and (optionally) that
//! `sub` and `to` are what it expects.  Any mismatch is a hard rejection.
//!
//! A captured token stays valid until `exp`; there is no used-token ledger.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::domain::mirror::MirrorId;
use crate::domain::session::SessionId;
use crate::token::{decoding_key_from_pem, encoding_key_from_pem, read_key_file, TokenError};

/// Required value of the `purpose` claim.
pub const TRANSFER_PURPOSE: &str = "session_transfer";

/// Default lifetime of a transfer token.
pub const DEFAULT_TRANSFER_TTL_SECS: i64 = 120;

/// Claims carried by a transfer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferClaims {
    /// Session id.
    pub sub: String,
    pub from: String,
    pub to: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub purpose: String,
}

impl TransferClaims {
    /// Parses `sub` as a session id.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SessionMismatch`] when `sub` is not a UUID.
    pub fn session_id(&self) -> Result<SessionId, TokenError> {
        self.sub
            .parse()
            .map_err(|_| TokenError::SessionMismatch {
                expected: "a session UUID".to_string(),
                found: self.sub.clone(),
            })
    }

    pub fn from_mirror(&self) -> MirrorId {
        MirrorId::new(self.from.clone())
    }

    pub fn to_mirror(&self) -> MirrorId {
        MirrorId::new(self.to.clone())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

/// A freshly minted transfer token.
#[derive(Debug, Clone)]
pub struct IssuedTransferToken {
    pub token: String,
    pub claims: TransferClaims,
    pub expires_at: DateTime<Utc>,
}

/// Signs transfer tokens with the local mirror's private key.
pub struct TransferTokenIssuer {
    algorithm: Algorithm,
    key: EncodingKey,
    ttl: Duration,
}

impl TransferTokenIssuer {
    /// Creates an issuer from in-memory PEM.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidKey`] if `pem` is not a private key for `algorithm`.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        Ok(Self {
            algorithm,
            key: encoding_key_from_pem(algorithm, pem)?,
            ttl,
        })
    }

    /// Creates an issuer from a PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyIo`] if the file cannot be read, or
    /// [`TokenError::InvalidKey`] if it does not parse.
    pub fn from_pem_file(
        algorithm: Algorithm,
        path: &Path,
        ttl: Duration,
    ) -> Result<Self, TokenError> {
        let pem = read_key_file(path)?;
        Self::from_pem(algorithm, &pem, ttl)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mints a token authorising `from` to hand `session_id` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(
        &self,
        session_id: SessionId,
        from: &MirrorId,
        to: &MirrorId,
        now: DateTime<Utc>,
    ) -> Result<IssuedTransferToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = TransferClaims {
            sub: session_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            purpose: TRANSFER_PURPOSE.to_string(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.key)
            .map_err(TokenError::Signing)?;
        Ok(IssuedTransferToken {
            token,
            claims,
            expires_at,
        })
    }
}

/// Verifies transfer tokens.
///
/// Holds a default public key (the one configured locally) and can also
/// verify against a key supplied per call, typically the public key a peer
/// published through discovery.
pub struct TransferTokenVerifier {
    algorithm: Algorithm,
    default_key: DecodingKey,
}

impl TransferTokenVerifier {
    /// Creates a verifier from in-memory PEM.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidKey`] if `pem` is not a public key for `algorithm`.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self, TokenError> {
        Ok(Self {
            algorithm,
            default_key: decoding_key_from_pem(algorithm, pem)?,
        })
    }

    /// Creates a verifier from a PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyIo`] or [`TokenError::InvalidKey`].
    pub fn from_pem_file(algorithm: Algorithm, path: &Path) -> Result<Self, TokenError> {
        let pem = read_key_file(path)?;
        Self::from_pem(algorithm, &pem)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Builds a key for this verifier's algorithm from a peer's PEM.
    ///
    /// # Errors
    ///
    /// - [`TokenError::SymmetricPeerKey`] for the HS family: anything a peer
    ///   publishes is public, so it cannot serve as an HMAC secret.
    /// - [`TokenError::InvalidKey`] if the PEM does not parse.
    pub fn peer_key(&self, pem: &str) -> Result<DecodingKey, TokenError> {
        if matches!(
            self.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(TokenError::SymmetricPeerKey(self.algorithm));
        }
        decoding_key_from_pem(self.algorithm, pem.as_bytes())
    }

    /// Verifies with the default key.
    ///
    /// # Errors
    ///
    /// See [`TransferTokenVerifier::verify_with_key`].
    pub fn verify(
        &self,
        token: &str,
        expected_session: Option<&str>,
        expected_to: Option<&MirrorId>,
    ) -> Result<TransferClaims, TokenError> {
        self.verify_with_key(token, &self.default_key, expected_session, expected_to)
    }

    /// Verifies signature, time window, purpose, and the optional expectations.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Expired`] / [`TokenError::NotYetValid`] outside `[nbf, exp]`.
    /// - [`TokenError::Invalid`] for a bad signature or malformed token.
    /// - [`TokenError::WrongPurpose`] unless `purpose == "session_transfer"`.
    /// - [`TokenError::SessionMismatch`] / [`TokenError::DestinationMismatch`]
    ///   when an expectation is given and not met.
    pub fn verify_with_key(
        &self,
        token: &str,
        key: &DecodingKey,
        expected_session: Option<&str>,
        expected_to: Option<&MirrorId>,
    ) -> Result<TransferClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        let claims = decode::<TransferClaims>(token, key, &validation)?.claims;

        if claims.purpose != TRANSFER_PURPOSE {
            return Err(TokenError::WrongPurpose {
                found: claims.purpose,
            });
        }
        if let Some(expected) = expected_session {
            if claims.sub != expected {
                return Err(TokenError::SessionMismatch {
                    expected: expected.to_string(),
                    found: claims.sub,
                });
            }
        }
        if let Some(expected) = expected_to {
            if claims.to != expected.as_str() {
                return Err(TokenError::DestinationMismatch {
                    expected: expected.to_string(),
                    found: claims.to,
                });
            }
        }
        Ok(claims)
    }

    /// Reads the `from` claim without checking the signature.
    ///
    /// Only used to choose which public key to verify with; the result must
    /// never be trusted on its own.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Invalid`] if the token is not a decodable JWT.
    pub fn peek_issuer(token: &str) -> Result<MirrorId, TokenError> {
        #[derive(Deserialize)]
        struct Issuer {
            from: String,
        }

        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims::<&str>(&[]);

        let data = decode::<Issuer>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(TokenError::Invalid)?;
        Ok(MirrorId::new(data.claims.from))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
