//! Transfer bookkeeping and media metadata.
//!
//! A [`TransferRequest`] is written by the source mirror when it mints a
//! transfer token and marked completed when the handoff finishes.  It is an
//! audit trail only: a missing row never blocks a transfer.
//!
//! [`VideoRecord`]s describe media recorded during a session.  The bytes
//! themselves travel out-of-band; a transfer only carries the metadata, so the
//! destination creates placeholder records with no file attached.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::mirror::{Metadata, MirrorId};
use crate::domain::session::SessionId;

/// Audit record for one session handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: Uuid,
    pub session_id: SessionId,
    pub from_mirror_id: MirrorId,
    pub to_mirror_id: MirrorId,
    /// The signed transfer token, stored verbatim.
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Append-only log lines.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl TransferRequest {
    pub fn new(
        session_id: SessionId,
        from_mirror_id: MirrorId,
        to_mirror_id: MirrorId,
        token: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            from_mirror_id,
            to_mirror_id,
            token,
            created_at: now,
            expires_at,
            completed: false,
            completed_at: None,
            logs: Vec::new(),
        }
    }

    /// Returns `true` if this request covers the `(session, from, to)` triple.
    pub fn matches(&self, session_id: SessionId, from: &MirrorId, to: &MirrorId) -> bool {
        self.session_id == session_id && &self.from_mirror_id == from && &self.to_mirror_id == to
    }

    pub fn log(&mut self, at: DateTime<Utc>, line: impl AsRef<str>) {
        self.logs.push(format!("{} {}", at.to_rfc3339(), line.as_ref()));
    }

    /// Marks the request completed.  Calling it again only appends a log line.
    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        if !self.completed {
            self.completed = true;
            self.completed_at = Some(at);
        }
        self.log(at, "completed");
    }
}

fn default_codec() -> String {
    "h264".to_string()
}

fn default_encrypted() -> bool {
    true
}

/// Media metadata carried across a transfer.
///
/// Every field is optional on the wire; absent values take the same defaults
/// a freshly recorded video would have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for VideoDescriptor {
    fn default() -> Self {
        Self {
            size_bytes: None,
            duration_seconds: None,
            codec: default_codec(),
            sha256: String::new(),
            encrypted: default_encrypted(),
            metadata: Metadata::new(),
        }
    }
}

/// A media item belonging to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Storage location; `None` until the bytes arrive.
    pub file: Option<PathBuf>,
    #[serde(flatten)]
    pub descriptor: VideoDescriptor,
}

impl VideoRecord {
    /// Creates a record with no file attached, as written on transfer completion.
    pub fn placeholder(
        session_id: SessionId,
        descriptor: VideoDescriptor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            created_at: now,
            file: None,
            descriptor,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
