//! Signed-token protocols.
//!
//! Two independent flows share the JWT machinery from `jsonwebtoken`:
//!
//! - **`transfer`** – Mirror-to-mirror.  The source signs with its private
//!   key (RS256 by default) so any peer holding the public key can verify
//!   without a shared secret.  Short TTL (120s) bounds the replay window.
//!
//! - **`export`** – Mirror-to-device.  HS256 with a service-wide secret; the
//!   token is bound to the device that activated the session.
//!
//! All time checks use zero leeway: a token one second past `exp` is rejected.

use std::path::{Path, PathBuf};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::EncodingKey;
use thiserror::Error;

pub mod export;
pub mod transfer;

pub use jsonwebtoken::{Algorithm, DecodingKey};

pub use export::{
    ExportClaims, ExportTokenCodec, IssuedExportToken, DEFAULT_EXPORT_TTL_SECS, EXPORT_TOKEN_TYPE,
};
pub use transfer::{
    IssuedTransferToken, TransferClaims, TransferTokenIssuer, TransferTokenVerifier,
    DEFAULT_TRANSFER_TTL_SECS, TRANSFER_PURPOSE,
};

/// Error type for token issuance and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// A PEM key file could not be read.
    #[error("failed to read key file {path}: {source}")]
    KeyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The key material does not match the configured algorithm.
    #[error("invalid key material for {algorithm:?}: {source}")]
    InvalidKey {
        algorithm: Algorithm,
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    /// The configured algorithm name is not recognised.
    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// A peer-published key was offered for an HMAC algorithm, where the
    /// "public" key would be the shared secret.
    #[error("{0:?} has no public key; published peer keys cannot be used")]
    SymmetricPeerKey(Algorithm),

    /// The export secret is empty.
    #[error("export token secret must not be empty")]
    EmptySecret,

    /// Encoding the claims failed.
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    /// `exp` is in the past.
    #[error("token has expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("token is not yet valid")]
    NotYetValid,

    /// Bad signature, malformed token, wrong algorithm, or missing claims.
    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),

    /// A transfer token whose `purpose` is not `session_transfer`.
    #[error("token purpose {found:?} is not accepted")]
    WrongPurpose { found: String },

    /// An export token whose `type` is not `export`.
    #[error("token type {found:?} is not accepted")]
    WrongType { found: String },

    /// `sub` does not name the expected session.
    #[error("token is for session {found}, expected {expected}")]
    SessionMismatch { expected: String, found: String },

    /// `to` does not name the expected destination mirror.
    #[error("token is addressed to {found}, expected {expected}")]
    DestinationMismatch { expected: String, found: String },
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            _ => TokenError::Invalid(err),
        }
    }
}

/// Parses an algorithm name such as `"RS256"`.
///
/// # Errors
///
/// Returns [`TokenError::UnsupportedAlgorithm`] for unknown names.
pub fn parse_algorithm(name: &str) -> Result<Algorithm, TokenError> {
    name.trim()
        .parse()
        .map_err(|_| TokenError::UnsupportedAlgorithm(name.to_string()))
}

/// Builds a signing key from PEM (or raw secret bytes for the HMAC family).
///
/// # Errors
///
/// Returns [`TokenError::InvalidKey`] if the material does not parse for `algorithm`.
pub fn encoding_key_from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<EncodingKey, TokenError> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Ok(EncodingKey::from_secret(pem))
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
    };
    key.map_err(|source| TokenError::InvalidKey { algorithm, source })
}

/// Builds a verification key from PEM (or raw secret bytes for the HMAC family).
///
/// # Errors
///
/// Returns [`TokenError::InvalidKey`] if the material does not parse for `algorithm`.
pub fn decoding_key_from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<DecodingKey, TokenError> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Ok(DecodingKey::from_secret(pem))
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
    };
    key.map_err(|source| TokenError::InvalidKey { algorithm, source })
}

/// Reads a key file into memory.
pub(crate) fn read_key_file(path: &Path) -> Result<Vec<u8>, TokenError> {
    std::fs::read(path).map_err(|source| TokenError::KeyIo {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
