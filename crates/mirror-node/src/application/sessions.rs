//! SessionService: the QR session lifecycle on one mirror.
//!
//! # Lifecycle
//!
//! ```text
//! create_pending ──► Pending ──activate(qr, device)──► Active ──end──► Ended
//!                                                        ▲               │
//!                                                        └──── resume ───┘
//! ```
//!
//! - `create_pending` always force-ends whatever was live on this mirror, so
//!   there is never more than one `Pending`/`Active` session per mirror.  The
//!   ending and the insert are one [`SessionRepository::replace_live_sessions`]
//!   call; if a concurrent caller slipped a live session in between the read
//!   and the commit, the commit is refused and retried on a fresh read.
//! - A device that already has a session (latest by `started_at`, any status)
//!   gets that session back instead of claiming a new one.  This is how a
//!   phone reconnects, and how it picks up a session transferred to this
//!   mirror.
//! - A QR digest activates at most one session, exactly once: once the
//!   session is `Active` it no longer matches a pending lookup.
//!
//! Transitions are computed by [`Session::apply`]; this service only loads,
//! applies, and saves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirror_core::domain::session::hash_qr_token;
use mirror_core::{
    MirrorId, QrToken, Session, SessionEvent, SessionId, SessionStatus, TransitionError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::repository::{RepositoryError, SessionRepository, LIVE_SESSION_ENTITY};

/// How many times a new session is committed before a live-session race is
/// reported to the caller.
const OPEN_SESSION_ATTEMPTS: usize = 3;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// No pending session carries this QR digest (unknown, or already used).
    #[error("invalid or expired QR token")]
    QrNotFound,

    /// The session belongs to another mirror.
    #[error("session {session_id} is owned by mirror {owner}")]
    NotOwner { session_id: SessionId, owner: MirrorId },

    /// Ending a session that already ended.  Callers usually treat this as
    /// success.
    #[error("session {0} has already ended")]
    AlreadyEnded(SessionId),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A new pending session and the raw token for its QR code.
///
/// The raw token is returned once and never stored.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub session: Session,
    pub raw_token: String,
}

/// Whether an activation claimed a fresh session or reattached a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    New,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub session: Session,
    pub kind: ActivationKind,
}

/// Session use cases for the local mirror.
pub struct SessionService {
    local: MirrorId,
    qr_base_url: String,
    sessions: Arc<dyn SessionRepository>,
}

impl SessionService {
    /// `qr_base_url` is the externally reachable root the phone will open,
    /// e.g. `http://192.168.1.8:8000`.
    pub fn new(
        local: MirrorId,
        qr_base_url: impl Into<String>,
        sessions: Arc<dyn SessionRepository>,
    ) -> Self {
        let qr_base_url = qr_base_url.into().trim_end_matches('/').to_string();
        Self {
            local,
            qr_base_url,
            sessions,
        }
    }

    pub fn local_mirror(&self) -> &MirrorId {
        &self.local
    }

    /// Starts a new session waiting for a QR scan.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Repository`] if any read or write fails.
    pub fn create_pending(&self, now: DateTime<Utc>) -> Result<PendingSession, SessionError> {
        let qr = QrToken::generate();
        let qr_url = format!("{}/api/qr/activate?token={}", self.qr_base_url, qr.raw);
        let session = Session::new_pending(self.local.clone(), qr.hash, qr_url, now);
        let ended: usize = open_session::<SessionError>(self.sessions.as_ref(), &session, now)?;

        info!(
            "created pending session {} on {} (ended {ended} live)",
            session.id, self.local
        );
        Ok(PendingSession {
            session,
            raw_token: qr.raw,
        })
    }

    /// Activates with the raw token from the QR URL.
    ///
    /// # Errors
    ///
    /// See [`SessionService::activate`].
    pub fn activate_with_token(
        &self,
        raw_token: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Activation, SessionError> {
        if raw_token.trim().is_empty() {
            return Err(SessionError::InvalidInput("missing token"));
        }
        self.activate(&hash_qr_token(raw_token), device_id, now)
    }

    /// Binds `device_id` to a session.
    ///
    /// A device that already owns a session resumes it; otherwise the pending
    /// session with this QR digest is activated.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidInput`] for an empty digest or device id.
    /// - [`SessionError::QrNotFound`] when no pending session matches.
    pub fn activate(
        &self,
        qr_token_hash: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Activation, SessionError> {
        if qr_token_hash.trim().is_empty() {
            return Err(SessionError::InvalidInput("missing token"));
        }
        if device_id.trim().is_empty() {
            return Err(SessionError::InvalidInput("missing device_id"));
        }

        if let Some(existing) = self.sessions.latest_for_device(device_id)? {
            let resumed = existing.apply(SessionEvent::Resume { at: now })?;
            end_live_sessions::<SessionError>(
                self.sessions.as_ref(),
                &resumed.mirror_id,
                Some(resumed.id),
                now,
            )?;
            self.sessions.update_session(&resumed)?;
            info!("device {device_id} resumed session {}", resumed.id);
            return Ok(Activation {
                session: resumed,
                kind: ActivationKind::Resumed,
            });
        }

        let pending = self
            .sessions
            .find_pending_by_qr_hash(qr_token_hash)?
            .ok_or(SessionError::QrNotFound)?;
        let active = pending.apply(SessionEvent::Activate {
            device_id: device_id.to_string(),
            at: now,
        })?;
        self.sessions.update_session(&active)?;
        info!("device {device_id} activated session {}", active.id);
        Ok(Activation {
            session: active,
            kind: ActivationKind::New,
        })
    }

    /// Ends a session owned by this mirror.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] for an unknown id.
    /// - [`SessionError::NotOwner`] when another mirror owns it (no change is made).
    /// - [`SessionError::AlreadyEnded`] when it had already ended.
    pub fn end(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_session(session_id)?
            .ok_or(SessionError::NotFound(session_id))?;

        if !session.is_owned_by(&self.local) {
            warn!(
                "refusing to end session {session_id}: owned by {}",
                session.mirror_id
            );
            return Err(SessionError::NotOwner {
                session_id,
                owner: session.mirror_id,
            });
        }

        let ended = session.apply(SessionEvent::End { at: now }).map_err(|e| match e {
            TransitionError::AlreadyEnded => SessionError::AlreadyEnded(session_id),
            other => SessionError::Transition(other),
        })?;
        self.sessions.update_session(&ended)?;
        info!("ended session {session_id}");
        Ok(ended)
    }

    /// The session a status screen should show: the active one, else the
    /// newest pending one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Repository`] if the lookup fails.
    pub fn current(&self) -> Result<Option<Session>, SessionError> {
        let mine = self.sessions.sessions_for_mirror(&self.local)?;
        if let Some(active) = mine.iter().find(|s| s.status == SessionStatus::Active) {
            return Ok(Some(active.clone()));
        }
        Ok(mine
            .into_iter()
            .filter(|s| s.status == SessionStatus::Pending)
            .max_by_key(|s| s.started_at))
    }

    /// All `Active` sessions of this mirror, for peers listing what can be
    /// transferred.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Repository`] if the lookup fails.
    pub fn active_sessions(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self
            .sessions
            .sessions_for_mirror(&self.local)?
            .into_iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect())
    }
}

/// Ends every live session in `sessions` except `keep`, through the session
/// state machine.  Returns the ended copies; nothing is saved.
pub(crate) fn close_live_sessions(
    sessions: Vec<Session>,
    keep: Option<SessionId>,
    now: DateTime<Utc>,
) -> Result<Vec<Session>, TransitionError> {
    sessions
        .into_iter()
        .filter(|s| s.is_live() && Some(s.id) != keep)
        .map(|s| s.apply(SessionEvent::End { at: now }))
        .collect()
}

/// Ends every live session of `mirror_id` except `keep`.  Returns how many
/// were ended.
pub(crate) fn end_live_sessions<E>(
    sessions: &dyn SessionRepository,
    mirror_id: &MirrorId,
    keep: Option<SessionId>,
    now: DateTime<Utc>,
) -> Result<usize, E>
where
    E: From<RepositoryError> + From<TransitionError>,
{
    let closed = close_live_sessions(sessions.sessions_for_mirror(mirror_id)?, keep, now)?;
    for session in &closed {
        sessions.update_session(session)?;
    }
    Ok(closed.len())
}

/// Stores `session` as the one live session of its mirror, ending whatever
/// was live before in the same commit.  Returns how many were ended.
pub(crate) fn open_session<E>(
    sessions: &dyn SessionRepository,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<usize, E>
where
    E: From<RepositoryError> + From<TransitionError>,
{
    let mirror_id = &session.mirror_id;
    let mut attempt = 1;
    loop {
        let closed = close_live_sessions(sessions.sessions_for_mirror(mirror_id)?, None, now)?;
        match sessions.replace_live_sessions(mirror_id, &closed, session) {
            Ok(()) => return Ok(closed.len()),
            Err(RepositoryError::Conflict { entity, id })
                if entity == LIVE_SESSION_ENTITY && attempt < OPEN_SESSION_ATTEMPTS =>
            {
                debug!("session {id} went live on {mirror_id} concurrently; retrying");
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repository::MockSessionRepository;
    use crate::infrastructure::storage::memory::InMemoryStore;

    fn service(store: &Arc<InMemoryStore>) -> SessionService {
        SessionService::new(
            MirrorId::from("mirror-a"),
            "http://192.168.1.8:8000/",
            store.clone(),
        )
    }

    fn statuses(store: &InMemoryStore) -> Vec<SessionStatus> {
        store
            .sessions_for_mirror(&MirrorId::from("mirror-a"))
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect()
    }

    #[test]
    fn test_create_pending_builds_qr_url_and_stores_only_digest() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());

        // Act
        let pending = service(&store).create_pending(Utc::now()).unwrap();

        // Assert
        let s = &pending.session;
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(
            s.qr_url.as_deref(),
            Some(
                format!(
                    "http://192.168.1.8:8000/api/qr/activate?token={}",
                    pending.raw_token
                )
                .as_str()
            )
        );
        assert_eq!(s.qr_token_hash.as_deref(), Some(hash_qr_token(&pending.raw_token).as_str()));
        assert_ne!(s.qr_token_hash.as_deref(), Some(pending.raw_token.as_str()));
    }

    #[test]
    fn test_create_pending_force_ends_previous_live_sessions() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let first = svc.create_pending(Utc::now()).unwrap();
        svc.activate_with_token(&first.raw_token, "phone-1", Utc::now())
            .unwrap();

        // Act
        let second = svc.create_pending(Utc::now()).unwrap();

        // Assert
        let old = store.get_session(first.session.id).unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Ended);
        assert!(old.ended_at.is_some());
        let live = statuses(&store).into_iter().filter(|s| s.is_live()).count();
        assert_eq!(live, 1);
        assert_eq!(svc.current().unwrap().unwrap().id, second.session.id);
    }

    #[test]
    fn test_activate_binds_device_once() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let pending = svc.create_pending(Utc::now()).unwrap();

        // Act
        let first = svc
            .activate_with_token(&pending.raw_token, "phone-1", Utc::now())
            .unwrap();
        let replay = svc.activate_with_token(&pending.raw_token, "phone-2", Utc::now());

        // Assert
        assert_eq!(first.kind, ActivationKind::New);
        assert_eq!(first.session.device_id.as_deref(), Some("phone-1"));
        assert!(matches!(replay, Err(SessionError::QrNotFound)));
    }

    #[test]
    fn test_known_device_resumes_same_session() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let pending = svc.create_pending(Utc::now()).unwrap();
        let first = svc
            .activate_with_token(&pending.raw_token, "phone-1", Utc::now())
            .unwrap();
        svc.end(first.session.id, Utc::now()).unwrap();

        // Act: the phone rescans any QR.
        let again = svc
            .activate_with_token("whatever-token", "phone-1", Utc::now())
            .unwrap();

        // Assert
        assert_eq!(again.kind, ActivationKind::Resumed);
        assert_eq!(again.session.id, first.session.id);
        assert_eq!(again.session.status, SessionStatus::Active);
    }

    #[test]
    fn test_resume_ends_other_live_session() {
        // Arrange: phone-1 owns an ended session, then a new QR is shown.
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let p1 = svc.create_pending(Utc::now()).unwrap();
        let a1 = svc
            .activate_with_token(&p1.raw_token, "phone-1", Utc::now())
            .unwrap();
        let p2 = svc.create_pending(Utc::now()).unwrap();

        // Act
        svc.activate_with_token(&p2.raw_token, "phone-1", Utc::now())
            .unwrap();

        // Assert
        let pending_now = store.get_session(p2.session.id).unwrap().unwrap();
        assert_eq!(pending_now.status, SessionStatus::Ended);
        assert_eq!(svc.current().unwrap().unwrap().id, a1.session.id);
    }

    #[test]
    fn test_unknown_token_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let result = service(&store).activate_with_token("nope", "phone-1", Utc::now());
        assert!(matches!(result, Err(SessionError::QrNotFound)));
    }

    #[test]
    fn test_empty_inputs_are_invalid() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        assert!(matches!(
            svc.activate_with_token("", "phone", Utc::now()),
            Err(SessionError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.activate("abc", "  ", Utc::now()),
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_end_rejects_foreign_session_without_mutation() {
        // Arrange: a session owned by mirror-b in the same store.
        let store = Arc::new(InMemoryStore::new());
        let other = SessionService::new(MirrorId::from("mirror-b"), "http://b", store.clone());
        let foreign = other.create_pending(Utc::now()).unwrap().session;

        // Act
        let result = service(&store).end(foreign.id, Utc::now());

        // Assert
        assert!(matches!(result, Err(SessionError::NotOwner { .. })));
        let unchanged = store.get_session(foreign.id).unwrap().unwrap();
        assert_eq!(unchanged.status, SessionStatus::Pending);
    }

    #[test]
    fn test_end_twice_reports_already_ended() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let pending = svc.create_pending(Utc::now()).unwrap();
        svc.end(pending.session.id, Utc::now()).unwrap();

        let result = svc.end(pending.session.id, Utc::now());

        assert!(matches!(result, Err(SessionError::AlreadyEnded(id)) if id == pending.session.id));
    }

    #[test]
    fn test_end_unknown_session_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            service(&store).end(id, Utc::now()),
            Err(SessionError::NotFound(found)) if found == id
        ));
    }

    #[test]
    fn test_current_is_none_without_sessions() {
        let store = Arc::new(InMemoryStore::new());
        assert!(service(&store).current().unwrap().is_none());
    }

    #[test]
    fn test_active_sessions_lists_only_active() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let pending = svc.create_pending(Utc::now()).unwrap();
        assert!(svc.active_sessions().unwrap().is_empty());

        svc.activate_with_token(&pending.raw_token, "phone-1", Utc::now())
            .unwrap();

        assert_eq!(svc.active_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_end_live_sessions_uses_state_machine_and_keeps_ended_rows() {
        // Arrange: one already-ended session and one active session.
        let store = Arc::new(InMemoryStore::new());
        let svc = service(&store);
        let old = svc.create_pending(Utc::now()).unwrap().session;
        let old_ended = svc.end(old.id, Utc::now()).unwrap();
        let live = svc.create_pending(Utc::now()).unwrap();
        svc.activate_with_token(&live.raw_token, "phone-1", Utc::now())
            .unwrap();
        let at = Utc::now() + chrono::Duration::seconds(5);

        // Act
        let ended = end_live_sessions::<SessionError>(
            store.as_ref(),
            &MirrorId::from("mirror-a"),
            None,
            at,
        )
        .unwrap();

        // Assert
        assert_eq!(ended, 1);
        let closed = store.get_session(live.session.id).unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Ended);
        assert_eq!(closed.ended_at, Some(at));
        assert_eq!(closed.device_id.as_deref(), Some("phone-1"));
        assert_eq!(store.get_session(old.id).unwrap().unwrap(), old_ended);
    }

    #[test]
    fn test_close_live_sessions_skips_kept_session() {
        let a = Session::new_pending(MirrorId::from("mirror-a"), "h1".into(), "u".into(), Utc::now());
        let b = Session::new_pending(MirrorId::from("mirror-a"), "h2".into(), "u".into(), Utc::now());

        let closed = close_live_sessions(vec![a.clone(), b.clone()], Some(a.id), Utc::now()).unwrap();

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, b.id);
        assert_eq!(closed[0].status, SessionStatus::Ended);
    }

    #[test]
    fn test_concurrent_create_pending_leaves_one_live_session() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let svc = Arc::new(service(&store));

        // Act
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let svc = Arc::clone(&svc);
                std::thread::spawn(move || svc.create_pending(Utc::now()).is_ok())
            })
            .collect();
        let succeeded = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // Assert
        assert!(succeeded >= 1);
        let live = statuses(&store).into_iter().filter(|s| s.is_live()).count();
        assert_eq!(live, 1);
    }

    #[test]
    fn test_create_pending_retries_after_live_session_race() {
        // Arrange: the first two commits lose a race, the third lands.
        let mut repo = MockSessionRepository::new();
        repo.expect_sessions_for_mirror().returning(|_| Ok(Vec::new()));
        let mut calls = 0;
        repo.expect_replace_live_sessions()
            .times(3)
            .returning(move |_, _, _| {
                calls += 1;
                if calls < 3 {
                    Err(RepositoryError::Conflict {
                        entity: LIVE_SESSION_ENTITY,
                        id: "other".into(),
                    })
                } else {
                    Ok(())
                }
            });
        let svc = SessionService::new(MirrorId::from("mirror-a"), "http://a", Arc::new(repo));

        // Act
        let result = svc.create_pending(Utc::now());

        // Assert
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_pending_gives_up_after_repeated_races() {
        let mut repo = MockSessionRepository::new();
        repo.expect_sessions_for_mirror().returning(|_| Ok(Vec::new()));
        repo.expect_replace_live_sessions()
            .times(OPEN_SESSION_ATTEMPTS)
            .returning(|_, _, _| {
                Err(RepositoryError::Conflict {
                    entity: LIVE_SESSION_ENTITY,
                    id: "other".into(),
                })
            });
        let svc = SessionService::new(MirrorId::from("mirror-a"), "http://a", Arc::new(repo));

        let result = svc.create_pending(Utc::now());

        assert!(matches!(
            result,
            Err(SessionError::Repository(RepositoryError::Conflict { .. }))
        ));
    }

    #[test]
    fn test_repository_failure_surfaces_as_error() {
        // Arrange
        let mut repo = MockSessionRepository::new();
        repo.expect_sessions_for_mirror()
            .returning(|_| Err(RepositoryError::Backend("offline".into())));
        let svc = SessionService::new(MirrorId::from("mirror-a"), "http://a", Arc::new(repo));

        // Act
        let result = svc.create_pending(Utc::now());

        // Assert
        assert!(matches!(result, Err(SessionError::Repository(_))));
    }
}
