//! Session lifecycle: the QR activation state machine.
//!
//! A session is a user's engagement with one mirror.  It moves through three
//! states:
//!
//! ```text
//! Pending  ──activate──►  Active  ──end──►  Ended
//!    │                      ▲                 │
//!    └──────end─────────────┼─────────────────┤
//!                           └─────resume──────┘
//! ```
//!
//! - `Pending`: created with a fresh QR token; waiting for a device to scan it.
//! - `Active`: a device presented the QR token and is now bound to the session.
//! - `Ended`: terminal for QR activation.  A device that was already bound can
//!   still *resume* the session after reconnecting, which keeps the same id.
//!
//! # Pure transitions
//!
//! [`Session::apply`] takes the current session by reference and returns the
//! next one.  It never persists anything; the application layer saves the
//! returned value.  This keeps every rule testable without a store.
//!
//! # QR tokens
//!
//! The raw QR token is shown to anonymous clients inside a URL, so only its
//! SHA-256 digest is ever stored.  Activation looks sessions up by digest
//! equality.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::mirror::{Metadata, MirrorId};

/// Sessions keep their id when they are transferred between mirrors.
pub type SessionId = Uuid;

/// Number of random bytes behind a raw QR token.
const QR_TOKEN_BYTES: usize = 24;

/// Errors produced by [`Session::apply`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The event is not allowed from the session's current state.
    #[error("cannot {event} a session that is {from}")]
    InvalidTransition {
        from: SessionStatus,
        event: &'static str,
    },
    /// `End` was applied to a session that had already ended.
    #[error("session already ended")]
    AlreadyEnded,
    /// `Resume` was applied to a session that no device is bound to.
    #[error("session is not bound to a device")]
    NotBound,
    /// `Activate` was given an empty device id.
    #[error("device id must not be empty")]
    EmptyDeviceId,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

impl SessionStatus {
    /// `Pending` and `Active` sessions count against the one-live-session rule.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Events that drive [`Session::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A device presented the session's QR token.
    Activate {
        device_id: String,
        at: DateTime<Utc>,
    },
    /// The device already bound to this session reconnected.
    Resume { at: DateTime<Utc> },
    /// The session is closed, either explicitly or because a newer one replaced it.
    End { at: DateTime<Utc> },
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Activate { .. } => "activate",
            SessionEvent::Resume { .. } => "resume",
            SessionEvent::End { .. } => "end",
        }
    }
}

/// A freshly generated QR token.
///
/// `raw` goes into the QR code URL and is handed to the caller exactly once;
/// `hash` is what gets persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrToken {
    pub raw: String,
    pub hash: String,
}

impl QrToken {
    /// Generates a URL-safe random token and its digest.
    pub fn generate() -> Self {
        let mut bytes = [0u8; QR_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);
        let hash = hash_qr_token(&raw);
        Self { raw, hash }
    }
}

/// Returns the lowercase hex SHA-256 digest of a raw QR token.
pub fn hash_qr_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// A user session owned by one mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub mirror_id: MirrorId,
    pub status: SessionStatus,
    /// Digest of the QR token; `None` for sessions received by transfer.
    pub qr_token_hash: Option<String>,
    pub qr_url: Option<String>,
    pub device_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub export_used: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Session {
    /// Creates a `Pending` session waiting for `qr_token_hash` to be presented.
    pub fn new_pending(
        mirror_id: MirrorId,
        qr_token_hash: String,
        qr_url: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mirror_id,
            status: SessionStatus::Pending,
            qr_token_hash: Some(qr_token_hash),
            qr_url: Some(qr_url),
            device_id: None,
            started_at: now,
            activated_at: None,
            ended_at: None,
            export_used: false,
            metadata: Metadata::new(),
        }
    }

    /// Materialises a session handed over by another mirror.
    ///
    /// The session keeps its id, starts `Pending` without a QR token, and may
    /// carry the device id forwarded by the source so that device can resume.
    pub fn received(
        id: SessionId,
        mirror_id: MirrorId,
        device_id: Option<String>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mirror_id,
            status: SessionStatus::Pending,
            qr_token_hash: None,
            qr_url: None,
            device_id,
            started_at: now,
            activated_at: None,
            ended_at: None,
            export_used: false,
            metadata,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Returns `true` if `owner` is the mirror this session belongs to.
    pub fn is_owned_by(&self, owner: &MirrorId) -> bool {
        &self.mirror_id == owner
    }

    /// Computes the session that results from applying `event`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the event is not valid from the
    /// current state.  `self` is never modified.
    pub fn apply(&self, event: SessionEvent) -> Result<Session, TransitionError> {
        let mut next = self.clone();
        match (self.status, event) {
            (SessionStatus::Pending, SessionEvent::Activate { device_id, at }) => {
                if device_id.trim().is_empty() {
                    return Err(TransitionError::EmptyDeviceId);
                }
                next.status = SessionStatus::Active;
                next.device_id = Some(device_id);
                next.activated_at = Some(at);
            }
            (_, SessionEvent::Resume { at }) => {
                if self.device_id.is_none() {
                    return Err(TransitionError::NotBound);
                }
                next.status = SessionStatus::Active;
                next.activated_at = Some(at);
            }
            (SessionStatus::Ended, SessionEvent::End { .. }) => {
                return Err(TransitionError::AlreadyEnded);
            }
            (_, SessionEvent::End { at }) => {
                next.status = SessionStatus::Ended;
                next.ended_at = Some(at);
            }
            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from,
                    event: event.name(),
                });
            }
        }
        Ok(next)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
