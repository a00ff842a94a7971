//! In-memory implementation of every repository trait.
//!
//! Each record family lives in its own `parking_lot::RwLock`, so a discovery
//! write to `mirrors` never blocks a session read.  Records are cloned in and
//! out; callers never hold a reference into the store.
//!
//! `replace_live_sessions` does its checks and writes under one write lock,
//! which is what makes it atomic.

use std::collections::HashMap;

use mirror_core::{Mirror, MirrorId, Session, SessionId, SessionStatus, TransferRequest, VideoRecord};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::application::repository::{
    MirrorRepository, RepositoryError, SessionRepository, TransferRepository, VideoRepository,
    LIVE_SESSION_ENTITY,
};

#[derive(Default)]
pub struct InMemoryStore {
    mirrors: RwLock<HashMap<String, Mirror>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    videos: RwLock<Vec<VideoRecord>>,
    transfers: RwLock<Vec<TransferRequest>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MirrorRepository for InMemoryStore {
    fn save_mirror(&self, mirror: &Mirror) -> Result<(), RepositoryError> {
        self.mirrors
            .write()
            .insert(mirror.hostname.clone(), mirror.clone());
        Ok(())
    }

    fn list_mirrors(&self) -> Result<Vec<Mirror>, RepositoryError> {
        Ok(self.mirrors.read().values().cloned().collect())
    }
}

impl SessionRepository for InMemoryStore {
    fn get_session(&self, id: SessionId) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    fn insert_session(&self, session: &Session) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(RepositoryError::Conflict {
                entity: "session",
                id: session.id.to_string(),
            });
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), RepositoryError> {
        match self.sessions.write().get_mut(&session.id) {
            Some(row) => {
                *row = session.clone();
                Ok(())
            }
            None => Err(RepositoryError::Missing {
                entity: "session",
                id: session.id.to_string(),
            }),
        }
    }

    fn replace_live_sessions(
        &self,
        mirror_id: &MirrorId,
        ended: &[Session],
        session: &Session,
    ) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(RepositoryError::Conflict {
                entity: "session",
                id: session.id.to_string(),
            });
        }
        let unexpected = sessions.values().find(|s| {
            &s.mirror_id == mirror_id && s.is_live() && !ended.iter().any(|e| e.id == s.id)
        });
        if let Some(live) = unexpected {
            return Err(RepositoryError::Conflict {
                entity: LIVE_SESSION_ENTITY,
                id: live.id.to_string(),
            });
        }
        if let Some(gone) = ended.iter().find(|e| !sessions.contains_key(&e.id)) {
            return Err(RepositoryError::Missing {
                entity: "session",
                id: gone.id.to_string(),
            });
        }

        for closed in ended {
            sessions.insert(closed.id, closed.clone());
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn sessions_for_mirror(&self, mirror_id: &MirrorId) -> Result<Vec<Session>, RepositoryError> {
        let mut found: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| &s.mirror_id == mirror_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.started_at);
        Ok(found)
    }

    fn find_pending_by_qr_hash(
        &self,
        qr_token_hash: &str,
    ) -> Result<Option<Session>, RepositoryError> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| {
                s.status == SessionStatus::Pending
                    && s.qr_token_hash.as_deref() == Some(qr_token_hash)
            })
            .cloned())
    }

    fn latest_for_device(&self, device_id: &str) -> Result<Option<Session>, RepositoryError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.device_id.as_deref() == Some(device_id))
            .max_by_key(|s| s.started_at)
            .cloned())
    }
}

impl VideoRepository for InMemoryStore {
    fn insert_video(&self, video: &VideoRecord) -> Result<(), RepositoryError> {
        self.videos.write().push(video.clone());
        Ok(())
    }

    fn videos_for_session(&self, session_id: SessionId) -> Result<Vec<VideoRecord>, RepositoryError> {
        Ok(self
            .videos
            .read()
            .iter()
            .filter(|v| v.session_id == session_id)
            .cloned()
            .collect())
    }

    fn delete_videos_for_session(&self, session_id: SessionId) -> Result<usize, RepositoryError> {
        let mut videos = self.videos.write();
        let before = videos.len();
        videos.retain(|v| v.session_id != session_id);
        Ok(before - videos.len())
    }
}

impl TransferRepository for InMemoryStore {
    fn insert_transfer(&self, request: &TransferRequest) -> Result<(), RepositoryError> {
        self.transfers.write().push(request.clone());
        Ok(())
    }

    fn find_open_transfer(
        &self,
        session_id: SessionId,
        from: &MirrorId,
        to: &MirrorId,
    ) -> Result<Option<TransferRequest>, RepositoryError> {
        Ok(self
            .transfers
            .read()
            .iter()
            .find(|t| !t.completed && t.matches(session_id, from, to))
            .cloned())
    }

    fn update_transfer(&self, request: &TransferRequest) -> Result<(), RepositoryError> {
        let mut transfers = self.transfers.write();
        let row = transfers
            .iter_mut()
            .find(|t| t.id == request.id)
            .ok_or_else(|| missing_transfer(request.id))?;
        *row = request.clone();
        Ok(())
    }
}

fn missing_transfer(id: Uuid) -> RepositoryError {
    RepositoryError::Missing {
        entity: "transfer request",
        id: id.to_string(),
    }
}
