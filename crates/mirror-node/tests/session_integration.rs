//! Integration tests for the QR session lifecycle on a single mirror.
//!
//! These tests drive `SessionService` and `ExportService` through the
//! `NodeState` wiring, exactly as the binary builds them:
//!
//! ```text
//! create_pending()          → Pending  (QR URL shown on screen)
//! activate_with_token(raw)  → Active   (phone scanned the QR)
//! create_pending() again    → previous session Ended
//! activate_with_token(...)  → Resumed  (same phone comes back)
//! end()                     → Ended
//! ```

use chrono::{Duration, Utc};
use mirror_core::SessionStatus;
use mirror_node::application::sessions::{ActivationKind, SessionError};
use mirror_node::infrastructure::node::NodeState;
use mirror_node::infrastructure::storage::config::AppConfig;

fn node() -> NodeState {
    let mut config = AppConfig::default();
    config.identity.hostname = "mirror-lobby".into();
    config.network.public_base_url = "http://192.168.1.8:8000/".into();
    config.export.secret = "integration-secret".into();
    NodeState::new(config)
}

// ── Activation ────────────────────────────────────────────────────────────────

#[test]
fn test_qr_scan_activates_pending_session() {
    // Arrange
    let node = node();
    let pending = node.sessions.create_pending(Utc::now()).unwrap();

    // Act
    let activation = node
        .sessions
        .activate_with_token(&pending.raw_token, "phone-1", Utc::now())
        .unwrap();

    // Assert
    assert_eq!(activation.kind, ActivationKind::New);
    assert_eq!(activation.session.id, pending.session.id);
    assert_eq!(activation.session.status, SessionStatus::Active);
    assert_eq!(activation.session.device_id.as_deref(), Some("phone-1"));
    assert_eq!(
        node.sessions.current().unwrap().map(|s| s.id),
        Some(pending.session.id)
    );
}

#[test]
fn test_qr_url_points_at_public_root() {
    let node = node();

    let pending = node.sessions.create_pending(Utc::now()).unwrap();

    assert_eq!(
        pending.session.qr_url.as_deref(),
        Some(format!("http://192.168.1.8:8000/api/qr/activate?token={}", pending.raw_token).as_str())
    );
    assert_ne!(
        pending.session.qr_token_hash.as_deref(),
        Some(pending.raw_token.as_str()),
        "only the digest is stored"
    );
}

#[test]
fn test_unknown_token_is_rejected() {
    let node = node();
    node.sessions.create_pending(Utc::now()).unwrap();

    let result = node
        .sessions
        .activate_with_token("not-the-token", "phone-1", Utc::now());

    assert!(matches!(result, Err(SessionError::QrNotFound)));
}

#[test]
fn test_new_pending_session_ends_the_previous_one() {
    // Arrange
    let node = node();
    let first = node.sessions.create_pending(Utc::now()).unwrap();
    node.sessions
        .activate_with_token(&first.raw_token, "phone-1", Utc::now())
        .unwrap();

    // Act
    let second = node
        .sessions
        .create_pending(Utc::now() + Duration::seconds(1))
        .unwrap();

    // Assert
    assert!(node.sessions.active_sessions().unwrap().is_empty());
    assert_eq!(
        node.sessions.current().unwrap().map(|s| s.id),
        Some(second.session.id)
    );
}

#[test]
fn test_returning_device_resumes_its_session() {
    // Arrange: phone-1 activates, then a new QR is put on screen.
    let node = node();
    let first = node.sessions.create_pending(Utc::now()).unwrap();
    node.sessions
        .activate_with_token(&first.raw_token, "phone-1", Utc::now())
        .unwrap();
    let second = node
        .sessions
        .create_pending(Utc::now() + Duration::seconds(1))
        .unwrap();

    // Act: phone-1 scans the new QR.
    let activation = node
        .sessions
        .activate_with_token(&second.raw_token, "phone-1", Utc::now() + Duration::seconds(2))
        .unwrap();

    // Assert: the old session comes back and the new pending one is closed.
    assert_eq!(activation.kind, ActivationKind::Resumed);
    assert_eq!(activation.session.id, first.session.id);
    let active = node.sessions.active_sessions().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first.session.id);
    assert!(node.sessions.current().unwrap().is_some_and(|s| s.id == first.session.id));
}

#[test]
fn test_end_twice_reports_already_ended() {
    let node = node();
    let pending = node.sessions.create_pending(Utc::now()).unwrap();

    node.sessions.end(pending.session.id, Utc::now()).unwrap();
    let again = node.sessions.end(pending.session.id, Utc::now());

    assert!(matches!(again, Err(SessionError::AlreadyEnded(id)) if id == pending.session.id));
    assert!(node.sessions.current().unwrap().is_none());
}

// ── Export ────────────────────────────────────────────────────────────────────

#[test]
fn test_activated_device_can_redeem_export_link() {
    // Arrange
    let node = node();
    let exports = node.exports.as_ref().expect("secret configured");
    let pending = node.sessions.create_pending(Utc::now()).unwrap();
    node.sessions
        .activate_with_token(&pending.raw_token, "phone-1", Utc::now())
        .unwrap();

    // Act
    let grant = exports.issue(pending.session.id, Utc::now()).unwrap();
    let bundle = exports.redeem(&grant.token).unwrap();

    // Assert
    assert!(grant.export_url.starts_with("http://192.168.1.8:8000/api/export?token="));
    assert_eq!(bundle.session.id, pending.session.id);
    assert!(bundle.session.export_used);
}

#[test]
fn test_export_requires_activation() {
    let node = node();
    let exports = node.exports.as_ref().expect("secret configured");
    let pending = node.sessions.create_pending(Utc::now()).unwrap();

    assert!(exports.issue(pending.session.id, Utc::now()).is_err());
}
