//! ExportService: lets the phone that activated a session download its media.
//!
//! Issuance requires an `Active` session with a bound device; the token names
//! that device.  Redemption re-reads the session and compares the token's
//! device with the one bound *now*, so a session that moved to another phone
//! invalidates outstanding export links.
//!
//! With `single_use` off (the default) a link can be opened repeatedly until
//! it expires; `export_used` is still recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirror_core::token::ExportTokenCodec;
use mirror_core::{Session, SessionId, SessionStatus, TokenError, VideoRecord};
use thiserror::Error;
use tracing::{info, warn};

use crate::application::repository::{RepositoryError, SessionRepository, VideoRepository};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session is {0}, export requires an active session")]
    NotActive(SessionStatus),

    #[error("session is not bound to a device")]
    NotBound,

    #[error("export token was issued to a different device")]
    DeviceMismatch,

    #[error("export link has already been used")]
    AlreadyUsed,

    #[error("export token names an invalid session id {0:?}")]
    BadSessionClaim(String),

    #[error("invalid export token: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A freshly issued export link.
#[derive(Debug, Clone)]
pub struct ExportGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub export_url: String,
}

/// What a successful redemption hands back.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub session: Session,
    pub videos: Vec<VideoRecord>,
}

pub struct ExportService {
    codec: ExportTokenCodec,
    public_base_url: String,
    single_use: bool,
    sessions: Arc<dyn SessionRepository>,
    videos: Arc<dyn VideoRepository>,
}

impl ExportService {
    pub fn new(
        codec: ExportTokenCodec,
        public_base_url: impl Into<String>,
        single_use: bool,
        sessions: Arc<dyn SessionRepository>,
        videos: Arc<dyn VideoRepository>,
    ) -> Self {
        Self {
            codec,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            single_use,
            sessions,
            videos,
        }
    }

    /// # Errors
    ///
    /// [`ExportError::SessionNotFound`], [`ExportError::NotActive`] or
    /// [`ExportError::NotBound`] before any token is minted.
    pub fn issue(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<ExportGrant, ExportError> {
        let session = self
            .sessions
            .get_session(session_id)?
            .ok_or(ExportError::SessionNotFound(session_id))?;
        if session.status != SessionStatus::Active {
            return Err(ExportError::NotActive(session.status));
        }
        let device_id = session.device_id.as_deref().ok_or(ExportError::NotBound)?;

        let issued = self.codec.issue(session.id, device_id, now)?;
        let export_url = format!("{}/api/export?token={}", self.public_base_url, issued.token);
        info!("issued export link for session {session_id} to device {device_id}");
        Ok(ExportGrant {
            token: issued.token,
            expires_at: issued.expires_at,
            export_url,
        })
    }

    /// # Errors
    ///
    /// [`ExportError::Token`] for a bad, expired or mistyped token,
    /// [`ExportError::SessionNotFound`], [`ExportError::DeviceMismatch`], and
    /// [`ExportError::AlreadyUsed`] when single-use is enforced.
    pub fn redeem(&self, token: &str) -> Result<ExportBundle, ExportError> {
        let claims = self.codec.verify(token)?;
        let session_id: SessionId = claims
            .session_id
            .parse()
            .map_err(|_| ExportError::BadSessionClaim(claims.session_id.clone()))?;

        let mut session = self
            .sessions
            .get_session(session_id)?
            .ok_or(ExportError::SessionNotFound(session_id))?;

        if session.device_id.as_deref() != Some(claims.device_id.as_str()) {
            warn!("export for session {session_id} refused: device mismatch");
            return Err(ExportError::DeviceMismatch);
        }
        if self.single_use && session.export_used {
            return Err(ExportError::AlreadyUsed);
        }

        if !session.export_used {
            session.export_used = true;
            self.sessions.update_session(&session)?;
        }
        let videos = self.videos.videos_for_session(session_id)?;
        info!("export redeemed for session {session_id} ({} video(s))", videos.len());
        Ok(ExportBundle { session, videos })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
