//! Persistence seams.
//!
//! The node never talks to a storage engine directly.  Each record family has
//! a small synchronous trait; `infrastructure::storage::memory::InMemoryStore`
//! implements all four, and a durable backend can be swapped in without
//! touching the use cases.
//!
//! Implementations must be `Send + Sync`: the discovery thread writes mirrors
//! while callers on other threads read sessions.

use mirror_core::{Mirror, MirrorId, Session, SessionId, TransferRequest, VideoRecord};
use thiserror::Error;

/// `RepositoryError::Conflict` entity reported by
/// [`SessionRepository::replace_live_sessions`] when the mirror gained a live
/// session after the caller read its list.
pub const LIVE_SESSION_ENTITY: &str = "live session";

/// Error type shared by every repository trait.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// An insert collided with an existing record.
    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: String },

    /// An update targeted a record that does not exist.
    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: String },

    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable copy of the peer registry.
#[cfg_attr(test, mockall::automock)]
pub trait MirrorRepository: Send + Sync {
    /// Inserts or replaces the row keyed by `mirror.hostname`.
    fn save_mirror(&self, mirror: &Mirror) -> Result<(), RepositoryError>;

    fn list_mirrors(&self) -> Result<Vec<Mirror>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait SessionRepository: Send + Sync {
    fn get_session(&self, id: SessionId) -> Result<Option<Session>, RepositoryError>;

    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if a session with the same id exists.
    fn insert_session(&self, session: &Session) -> Result<(), RepositoryError>;

    /// # Errors
    ///
    /// [`RepositoryError::Missing`] if no session has this id.
    fn update_session(&self, session: &Session) -> Result<(), RepositoryError>;

    /// Saves `ended` and inserts `session` as one unit: either every row is
    /// written or none is.
    ///
    /// This is the only way a new live session enters the store, and it is
    /// what keeps a mirror at one `Pending`/`Active` session even when two
    /// callers race.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::Conflict`] with entity `"session"` if
    ///   `session.id` exists.
    /// - [`RepositoryError::Conflict`] with entity [`LIVE_SESSION_ENTITY`]
    ///   if `mirror_id` has a live session not listed in `ended`.  The caller
    ///   should re-read and try again.
    /// - [`RepositoryError::Missing`] if a row in `ended` does not exist.
    fn replace_live_sessions(
        &self,
        mirror_id: &MirrorId,
        ended: &[Session],
        session: &Session,
    ) -> Result<(), RepositoryError>;

    /// Every session owned by `mirror_id`, any status.
    fn sessions_for_mirror(&self, mirror_id: &MirrorId) -> Result<Vec<Session>, RepositoryError>;

    /// The `Pending` session whose QR digest equals `qr_token_hash`.
    fn find_pending_by_qr_hash(
        &self,
        qr_token_hash: &str,
    ) -> Result<Option<Session>, RepositoryError>;

    /// The most recently started session bound to `device_id`, any status.
    fn latest_for_device(&self, device_id: &str) -> Result<Option<Session>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait VideoRepository: Send + Sync {
    fn insert_video(&self, video: &VideoRecord) -> Result<(), RepositoryError>;

    fn videos_for_session(&self, session_id: SessionId) -> Result<Vec<VideoRecord>, RepositoryError>;

    /// Removes every video of `session_id`.  Returns how many were removed.
    fn delete_videos_for_session(&self, session_id: SessionId) -> Result<usize, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait TransferRepository: Send + Sync {
    fn insert_transfer(&self, request: &TransferRequest) -> Result<(), RepositoryError>;

    /// The first not-yet-completed request for `(session, from, to)`.
    fn find_open_transfer(
        &self,
        session_id: SessionId,
        from: &MirrorId,
        to: &MirrorId,
    ) -> Result<Option<TransferRequest>, RepositoryError>;

    fn update_transfer(&self, request: &TransferRequest) -> Result<(), RepositoryError>;
}
