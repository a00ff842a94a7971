//! Peer mirror descriptor.
//!
//! A [`Mirror`] is one device participating in discovery and transfer.  Rows
//! are created the first time a peer is sighted on the network (or when the
//! local node registers itself) and afterwards only refreshed by discovery
//! announcements.  Nothing deletes them automatically.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form JSON object attached to mirrors, sessions, and videos.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Stable identifier a mirror advertises for itself.
///
/// Mirrors that do not configure an explicit id use their hostname, so the
/// value is an opaque string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MirrorId(String);

impl MirrorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MirrorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MirrorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A peer (or the local) mirror as known to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub mirror_id: MirrorId,
    /// Globally unique; the peer registry is keyed by this.
    pub hostname: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Normalised API base URL the peer advertised, e.g. `http://10.0.0.4:8000/api`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// PEM public key used to verify transfer tokens this peer issues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Mirror {
    /// Builds a fresh row with no network location.
    pub fn new(
        mirror_id: MirrorId,
        hostname: impl Into<String>,
        port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            mirror_id,
            hostname: hostname.into(),
            ip: None,
            port,
            base_url: None,
            public_key: None,
            last_seen: now,
            metadata: Metadata::new(),
        }
    }

    /// Returns `true` when `key` names this mirror by id or by hostname.
    pub fn is_named(&self, key: &str) -> bool {
        self.mirror_id.as_str() == key || self.hostname == key
    }

    /// Merges `incoming` into the stored metadata; incoming keys win.
    pub fn merge_metadata(&mut self, incoming: Metadata) {
        for (key, value) in incoming {
            self.metadata.insert(key, value);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_mirror() -> Mirror {
        Mirror::new(MirrorId::from("mirror-a"), "mirror-a.local", 8000, Utc::now())
    }

    #[test]
    fn test_new_mirror_has_no_location_or_key() {
        // Arrange / Act
        let mirror = make_mirror();

        // Assert
        assert!(mirror.ip.is_none());
        assert!(mirror.public_key.is_none());
        assert!(mirror.metadata.is_empty());
        assert_eq!(mirror.port, 8000);
    }

    #[test]
    fn test_is_named_matches_id_and_hostname() {
        let mirror = make_mirror();
        assert!(mirror.is_named("mirror-a"));
        assert!(mirror.is_named("mirror-a.local"));
        assert!(!mirror.is_named("mirror-b"));
    }

    #[test]
    fn test_merge_metadata_keeps_existing_and_overrides_conflicts() {
        // Arrange
        let mut mirror = make_mirror();
        mirror.metadata.insert("room".into(), json!("lobby"));
        mirror.metadata.insert("model".into(), json!("rk3568"));
        let mut incoming = Metadata::new();
        incoming.insert("room".into(), json!("studio"));
        incoming.insert("mirror_id".into(), json!("mirror-a"));

        // Act
        mirror.merge_metadata(incoming);

        // Assert
        assert_eq!(mirror.metadata["room"], json!("studio"));
        assert_eq!(mirror.metadata["model"], json!("rk3568"));
        assert_eq!(mirror.metadata["mirror_id"], json!("mirror-a"));
    }

    #[test]
    fn test_mirror_id_serializes_as_plain_string() {
        let id = MirrorId::from("kiosk-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"kiosk-7\"");
    }
}
