//! TransferOrchestrator: moves a session from one mirror to another.
//!
//! # Protocol (for beginners)
//!
//! ```text
//!   source mirror (A)                            destination mirror (B)
//!   ─────────────────                            ──────────────────────
//!   request(session, "B")
//!     ├─ session exists and A owns it?
//!     ├─ resolve B through the peer registry
//!     ├─ mint transfer token {sub, from=A, to=B, exp=now+120s}
//!     └─ store TransferRequest (audit)
//!                    ── token + metadata (out of band) ──►
//!                                                complete(token, metadata)
//!                                                  ├─ verify with A's key
//!                                                  ├─ token addressed to B?
//!                                                  ├─ session id unused on B?
//!                                                  ├─ placeholder video rows
//!                                                  └─ end B's live sessions and
//!                                                     create Pending session,
//!                                                     same id (one commit)
//! ```
//!
//! Every check happens before the first write, so a rejected transfer leaves
//! no trace on either side.  The placeholders are written first and removed
//! again if anything after them fails; the session commit is the last write,
//! so a failed `complete` never leaves a session behind and can be retried
//! with the same token.  Marking the source's `TransferRequest` completed is
//! best effort: it only works when both mirrors share a store, and a missing
//! row is not an error.
//!
//! # Keys
//!
//! Tokens are verified with the configured public key.  Only when
//! [`TransferOrchestrator::trust_published_keys`] is on does the key pinned
//! in the [`PeerRegistry`] for the issuer take over; HMAC algorithms never
//! use a published key.
//!
//! A captured token can be replayed until it expires, but only once per
//! destination: the second attempt finds the session id already taken.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirror_core::token::{
    DecodingKey, TransferClaims, TransferTokenIssuer, TransferTokenVerifier,
};
use mirror_core::{
    Metadata, Mirror, MirrorId, Session, SessionId, TokenError, TransferRequest, TransitionError,
    VideoDescriptor, VideoRecord,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::peer_registry::PeerRegistry;
use crate::application::repository::{
    RepositoryError, SessionRepository, TransferRepository, VideoRepository,
};
use crate::application::sessions::open_session;

/// Error type for transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {session_id} is owned by mirror {owner}")]
    NotOwner { session_id: SessionId, owner: MirrorId },

    /// No mirror in the registry has this id or hostname.
    #[error("destination mirror {0:?} is not known")]
    DestinationNotFound(String),

    #[error("cannot transfer a session to the mirror that owns it")]
    SelfTransfer,

    /// A session with the token's id already exists here.
    #[error("session {0} already exists on this mirror")]
    AlreadyExists(SessionId),

    #[error("invalid transfer token: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a transfer request on the source mirror.
#[derive(Debug, Clone)]
pub struct TransferTicket {
    pub request_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub destination: Mirror,
}

/// What the destination receives from the source.
#[derive(Debug, Clone, Default)]
pub struct IncomingTransfer {
    pub token: String,
    pub session_metadata: Metadata,
    pub video_metadata: Vec<VideoDescriptor>,
    /// Device bound on the source, forwarded so it can resume here.
    pub device_id: Option<String>,
}

/// Result of a completed transfer on the destination mirror.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub session: Session,
    pub videos: Vec<VideoRecord>,
    pub from: MirrorId,
    /// Whether a matching `TransferRequest` was found and marked completed.
    pub request_marked: bool,
}

/// Repositories the orchestrator writes to.
pub struct TransferStores {
    pub sessions: Arc<dyn SessionRepository>,
    pub videos: Arc<dyn VideoRepository>,
    pub transfers: Arc<dyn TransferRepository>,
}

pub struct TransferOrchestrator {
    local: MirrorId,
    registry: Arc<PeerRegistry>,
    issuer: TransferTokenIssuer,
    verifier: TransferTokenVerifier,
    stores: TransferStores,
    trust_published_keys: bool,
}

impl TransferOrchestrator {
    pub fn new(
        local: MirrorId,
        registry: Arc<PeerRegistry>,
        issuer: TransferTokenIssuer,
        verifier: TransferTokenVerifier,
        stores: TransferStores,
    ) -> Self {
        Self {
            local,
            registry,
            issuer,
            verifier,
            stores,
            trust_published_keys: false,
        }
    }

    /// Verify tokens with the key the issuer published through discovery
    /// (pinned on first sight) instead of the configured key.  Off by default.
    pub fn trust_published_keys(mut self, trust: bool) -> Self {
        self.trust_published_keys = trust;
        self
    }

    /// Source side: authorise handing `session_id` to `destination`
    /// (mirror id or hostname).
    ///
    /// # Errors
    ///
    /// [`TransferError::SessionNotFound`], [`TransferError::NotOwner`],
    /// [`TransferError::DestinationNotFound`], [`TransferError::SelfTransfer`],
    /// or token/repository failures.
    pub fn request(
        &self,
        session_id: SessionId,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<TransferTicket, TransferError> {
        let session = self
            .stores
            .sessions
            .get_session(session_id)?
            .ok_or(TransferError::SessionNotFound(session_id))?;
        if !session.is_owned_by(&self.local) {
            return Err(TransferError::NotOwner {
                session_id,
                owner: session.mirror_id,
            });
        }

        let target = self
            .registry
            .find(destination)
            .ok_or_else(|| TransferError::DestinationNotFound(destination.to_string()))?;
        if target.mirror_id == self.local {
            return Err(TransferError::SelfTransfer);
        }

        let issued = self
            .issuer
            .issue(session_id, &self.local, &target.mirror_id, now)?;

        let mut request = TransferRequest::new(
            session_id,
            self.local.clone(),
            target.mirror_id.clone(),
            issued.token.clone(),
            now,
            issued.expires_at,
        );
        request.log(now, format!("requested transfer to {}", target.mirror_id));
        self.stores.transfers.insert_transfer(&request)?;

        info!(
            "issued transfer token for session {session_id} to {} (expires {})",
            target.mirror_id, issued.expires_at
        );
        Ok(TransferTicket {
            request_id: request.id,
            token: issued.token,
            expires_at: issued.expires_at,
            destination: target,
        })
    }

    /// Destination side: accept a session handed over by a peer.
    ///
    /// # Errors
    ///
    /// [`TransferError::Token`] for any verification failure (including a
    /// token addressed to another mirror), [`TransferError::AlreadyExists`]
    /// if the session id is taken here, or repository failures.
    pub fn complete(
        &self,
        incoming: IncomingTransfer,
        now: DateTime<Utc>,
    ) -> Result<CompletedTransfer, TransferError> {
        let claims = self.verify(&incoming.token)?;
        let session_id = claims.session_id()?;
        let from = claims.from_mirror();

        if self.stores.sessions.get_session(session_id)?.is_some() {
            warn!("rejecting transfer of session {session_id}: id already in use");
            return Err(TransferError::AlreadyExists(session_id));
        }

        let device_id = incoming
            .device_id
            .filter(|d| !d.trim().is_empty());
        let session = Session::received(
            session_id,
            self.local.clone(),
            device_id,
            incoming.session_metadata,
            now,
        );
        let videos: Vec<VideoRecord> = incoming
            .video_metadata
            .into_iter()
            .map(|descriptor| VideoRecord::placeholder(session_id, descriptor, now))
            .collect();

        self.store_placeholders(session_id, &videos)?;
        let ended = match open_session::<TransferError>(
            self.stores.sessions.as_ref(),
            &session,
            now,
        ) {
            Ok(ended) => ended,
            // Another completion of the same token got there first; the
            // placeholders now belong to it.
            Err(TransferError::Repository(RepositoryError::Conflict { entity: "session", .. })) => {
                warn!("rejecting transfer of session {session_id}: id already in use");
                return Err(TransferError::AlreadyExists(session_id));
            }
            Err(e) => {
                self.discard_placeholders(session_id);
                return Err(e);
            }
        };

        let request_marked = self.mark_request_completed(session_id, &from, now);

        info!(
            "received session {session_id} from {from} with {} video(s), ended {ended} live",
            videos.len()
        );
        Ok(CompletedTransfer {
            session,
            videos,
            from,
            request_marked,
        })
    }

    /// Verifies against this mirror as destination, with the issuer's pinned
    /// key when published keys are trusted, else with the configured key.
    fn verify(&self, token: &str) -> Result<TransferClaims, TokenError> {
        let issuer = TransferTokenVerifier::peek_issuer(token)?;
        let peer_key = if self.trust_published_keys {
            self.published_key(&issuer)
        } else {
            None
        };

        let result = match &peer_key {
            Some(key) => self
                .verifier
                .verify_with_key(token, key, None, Some(&self.local)),
            None => self.verifier.verify(token, None, Some(&self.local)),
        };
        if let Err(e) = &result {
            warn!("rejected transfer token from {issuer}: {e}");
        }
        result
    }

    fn published_key(&self, issuer: &MirrorId) -> Option<DecodingKey> {
        let pem = self.registry.public_key_for(issuer)?;
        match self.verifier.peer_key(&pem) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("ignoring public key published by {issuer}: {e}");
                None
            }
        }
    }

    /// Writes the placeholder rows for a session that does not exist here
    /// yet.  Rows left by an earlier failed attempt are cleared first; on
    /// failure the rows written so far are removed again.
    fn store_placeholders(
        &self,
        session_id: SessionId,
        videos: &[VideoRecord],
    ) -> Result<(), RepositoryError> {
        let stale = self.stores.videos.delete_videos_for_session(session_id)?;
        if stale > 0 {
            warn!("cleared {stale} leftover placeholder(s) for session {session_id}");
        }
        for video in videos {
            if let Err(e) = self.stores.videos.insert_video(video) {
                self.discard_placeholders(session_id);
                return Err(e);
            }
        }
        Ok(())
    }

    fn discard_placeholders(&self, session_id: SessionId) {
        if let Err(e) = self.stores.videos.delete_videos_for_session(session_id) {
            warn!("could not remove placeholders of session {session_id}: {e}");
        }
    }

    fn mark_request_completed(
        &self,
        session_id: SessionId,
        from: &MirrorId,
        now: DateTime<Utc>,
    ) -> bool {
        let lookup = self
            .stores
            .transfers
            .find_open_transfer(session_id, from, &self.local);
        let mut request = match lookup {
            Ok(Some(request)) => request,
            Ok(None) => return false,
            Err(e) => {
                warn!("could not look up transfer request for {session_id}: {e}");
                return false;
            }
        };
        request.mark_completed(now);
        match self.stores.transfers.update_transfer(&request) {
            Ok(()) => true,
            Err(e) => {
                warn!("could not mark transfer request {} completed: {e}", request.id);
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
