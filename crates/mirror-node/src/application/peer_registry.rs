//! PeerRegistry: every mirror this node has seen on the LAN.
//!
//! The registry is keyed by hostname, which is globally unique across the
//! fleet.  Rows are created on the first sighting (or by local
//! self-registration) and refreshed by every later announce.  Nothing is ever
//! removed; a mirror that goes quiet simply keeps an old `last_seen`.
//!
//! # Concurrency
//!
//! One writer (the discovery thread) and many readers (transfer requests,
//! status queries).  The map sits behind a `parking_lot::RwLock`; an upsert
//! replaces the whole row under the write lock, so readers never see a
//! half-updated peer.  Readers get cloned snapshots and never hold the lock
//! across calls.
//!
//! # Published keys
//!
//! The first public key announced for a mirror id is pinned.  A later
//! announce (from the same hostname or any other) cannot replace it; it is
//! logged and dropped.  [`PeerRegistry::public_key_for`] reads only the
//! pinned key.
//!
//! # Persistence
//!
//! When built with [`PeerRegistry::with_repository`], every change is also
//! written through to the [`MirrorRepository`].  A failed write is logged and
//! the in-memory row is kept: discovery must not stall on a storage hiccup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirror_core::{Metadata, Mirror, MirrorId};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::repository::{MirrorRepository, RepositoryError};

/// Metadata key under which a peer publishes its PEM public key.
pub const PUBLIC_KEY_METADATA_KEY: &str = "public_key";

/// What discovery learned about a peer from one announce.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSighting {
    /// Registry key: the announced hostname, or the mirror id when absent.
    pub hostname: String,
    pub mirror_id: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub base_url: Option<String>,
    pub metadata: Metadata,
}

impl PeerSighting {
    /// The PEM key the peer published in its metadata, if any.
    pub fn public_key(&self) -> Option<&str> {
        match self.metadata.get(PUBLIC_KEY_METADATA_KEY) {
            Some(Value::String(pem)) if !pem.trim().is_empty() => Some(pem),
            _ => None,
        }
    }
}

/// In-memory registry of all known mirrors.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Mirror>>,
    /// First key seen per mirror id.  Locked after `peers` when both are held.
    pinned_keys: RwLock<HashMap<MirrorId, String>>,
    store: Option<Arc<dyn MirrorRepository>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that writes every change through to `store`.
    pub fn with_repository(store: Arc<dyn MirrorRepository>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            pinned_keys: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Loads persisted rows into memory.  Returns how many were loaded.
    ///
    /// Keys are pinned oldest row first (by `last_seen`, then hostname), so a
    /// restart pins the same key regardless of storage order.
    ///
    /// # Errors
    ///
    /// Propagates the repository error; the in-memory map is left untouched.
    pub fn hydrate(&self) -> Result<usize, RepositoryError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut rows = store.list_mirrors()?;
        rows.sort_by(|a, b| {
            a.last_seen
                .cmp(&b.last_seen)
                .then_with(|| a.hostname.cmp(&b.hostname))
        });
        let count = rows.len();
        let mut peers = self.peers.write();
        let mut pinned = self.pinned_keys.write();
        for mirror in rows {
            if let Some(pem) = &mirror.public_key {
                pinned
                    .entry(mirror.mirror_id.clone())
                    .or_insert_with(|| pem.clone());
            }
            peers.insert(mirror.hostname.clone(), mirror);
        }
        Ok(count)
    }

    /// Returns the row for `hostname`, creating a bare one if it is missing.
    ///
    /// Used for local self-registration.  An existing row is returned as-is.
    pub fn get_or_create(
        &self,
        hostname: &str,
        mirror_id: &MirrorId,
        port: u16,
        now: DateTime<Utc>,
    ) -> Mirror {
        let (mirror, created) = {
            let mut peers = self.peers.write();
            match peers.get(hostname) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let mirror = Mirror::new(mirror_id.clone(), hostname, port, now);
                    peers.insert(hostname.to_string(), mirror.clone());
                    (mirror, true)
                }
            }
        };
        if created {
            debug!("registered mirror {hostname} ({mirror_id})");
            self.persist(&mirror);
        }
        mirror
    }

    /// Inserts or refreshes the row for `sighting.hostname`.
    ///
    /// Network location and `last_seen` are overwritten.  Metadata is merged
    /// (incoming keys win) and the announced mirror id is folded in under
    /// `"mirror_id"`.  A published public key is stored only if it is the
    /// first key seen for the mirror id, or equal to it.
    pub fn upsert(&self, sighting: PeerSighting, now: DateTime<Utc>) -> Mirror {
        let public_key = sighting.public_key().map(str::to_string);
        let PeerSighting {
            hostname,
            mirror_id,
            ip,
            port,
            base_url,
            mut metadata,
        } = sighting;

        if let Some(id) = &mirror_id {
            metadata.insert("mirror_id".to_string(), Value::String(id.clone()));
        }
        metadata.remove(PUBLIC_KEY_METADATA_KEY);

        let mirror = {
            let mut peers = self.peers.write();
            let row = peers.entry(hostname.clone()).or_insert_with(|| {
                let id = mirror_id.clone().unwrap_or_else(|| hostname.clone());
                Mirror::new(MirrorId::new(id), hostname.clone(), port, now)
            });
            if let Some(id) = mirror_id {
                row.mirror_id = MirrorId::new(id);
            }
            row.ip = ip;
            row.port = port;
            row.last_seen = now;
            if base_url.is_some() {
                row.base_url = base_url;
            }
            if let Some(pem) = public_key {
                let mut pinned = self.pinned_keys.write();
                let accepted = pinned.entry(row.mirror_id.clone()).or_insert_with(|| pem.clone());
                if *accepted == pem {
                    row.public_key = Some(pem);
                } else {
                    warn!(
                        "ignoring new public key for {} announced by {hostname}: a different key is pinned",
                        row.mirror_id
                    );
                }
            }
            row.merge_metadata(metadata);
            row.clone()
        };

        self.persist(&mirror);
        mirror
    }

    /// Returns a snapshot of all mirrors, sorted by hostname.
    pub fn list(&self) -> Vec<Mirror> {
        let mut all: Vec<Mirror> = self.peers.read().values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        all
    }

    /// Returns the row for `hostname`.
    pub fn get(&self, hostname: &str) -> Option<Mirror> {
        self.peers.read().get(hostname).cloned()
    }

    /// Finds a mirror by id or hostname.  An id match wins over a hostname
    /// match on a different row.
    pub fn find(&self, key: &str) -> Option<Mirror> {
        let peers = self.peers.read();
        peers
            .values()
            .find(|m| m.mirror_id.as_str() == key)
            .or_else(|| peers.get(key))
            .cloned()
    }

    /// The key pinned for this mirror id: the first one it published.
    pub fn public_key_for(&self, mirror_id: &MirrorId) -> Option<String> {
        self.pinned_keys.read().get(mirror_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn persist(&self, mirror: &Mirror) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_mirror(mirror) {
                warn!("failed to persist mirror {}: {e}", mirror.hostname);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repository::MockMirrorRepository;
    use chrono::Duration;
    use serde_json::json;

    fn sighting(hostname: &str, mirror_id: Option<&str>) -> PeerSighting {
        PeerSighting {
            hostname: hostname.to_string(),
            mirror_id: mirror_id.map(str::to_string),
            ip: Some("192.168.1.20".parse().unwrap()),
            port: 8000,
            base_url: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_upsert_adds_peer_keyed_by_hostname() {
        // Arrange
        let registry = PeerRegistry::new();

        // Act
        let mirror = registry.upsert(sighting("mirror-b.local", Some("mirror-b")), Utc::now());

        // Assert
        assert_eq!(mirror.mirror_id.as_str(), "mirror-b");
        assert_eq!(registry.get("mirror-b.local").unwrap(), mirror);
        assert_eq!(mirror.metadata["mirror_id"], json!("mirror-b"));
    }

    #[test]
    fn test_upsert_without_mirror_id_uses_hostname_as_id() {
        let registry = PeerRegistry::new();
        let mirror = registry.upsert(sighting("mirror-c", None), Utc::now());
        assert_eq!(mirror.mirror_id.as_str(), "mirror-c");
        assert!(!mirror.metadata.contains_key("mirror_id"));
    }

    #[test]
    fn test_upsert_refreshes_location_and_merges_metadata() {
        // Arrange
        let registry = PeerRegistry::new();
        let t0 = Utc::now();
        let mut first = sighting("mirror-b", Some("mirror-b"));
        first.metadata.insert("room".into(), json!("lobby"));
        first.metadata.insert("floor".into(), json!(1));
        first.base_url = Some("http://192.168.1.20:8000/api".into());
        registry.upsert(first, t0);

        // Act
        let mut second = sighting("mirror-b", Some("mirror-b"));
        second.ip = Some("192.168.1.99".parse().unwrap());
        second.port = 9000;
        second.metadata.insert("floor".into(), json!(2));
        let t1 = t0 + Duration::seconds(10);
        let mirror = registry.upsert(second, t1);

        // Assert
        assert_eq!(registry.len(), 1);
        assert_eq!(mirror.ip, Some("192.168.1.99".parse().unwrap()));
        assert_eq!(mirror.port, 9000);
        assert_eq!(mirror.last_seen, t1);
        assert_eq!(mirror.metadata["room"], json!("lobby"));
        assert_eq!(mirror.metadata["floor"], json!(2));
        assert_eq!(
            mirror.base_url.as_deref(),
            Some("http://192.168.1.20:8000/api"),
            "absent base_url keeps the stored one"
        );
    }

    #[test]
    fn test_upsert_extracts_published_public_key() {
        let registry = PeerRegistry::new();
        let mut s = sighting("mirror-b", Some("mirror-b"));
        s.metadata
            .insert(PUBLIC_KEY_METADATA_KEY.into(), json!("-----BEGIN PUBLIC KEY-----"));

        let mirror = registry.upsert(s, Utc::now());

        assert_eq!(mirror.public_key.as_deref(), Some("-----BEGIN PUBLIC KEY-----"));
        assert!(!mirror.metadata.contains_key(PUBLIC_KEY_METADATA_KEY));
        assert_eq!(
            registry.public_key_for(&MirrorId::from("mirror-b")).as_deref(),
            Some("-----BEGIN PUBLIC KEY-----")
        );
    }

    #[test]
    fn test_first_published_key_is_pinned_per_mirror_id() {
        // Arrange: mirror-a publishes its key.
        let registry = PeerRegistry::new();
        let mut genuine = sighting("mirror-a", Some("mirror-a"));
        genuine
            .metadata
            .insert(PUBLIC_KEY_METADATA_KEY.into(), json!("genuine-key"));
        registry.upsert(genuine, Utc::now());

        // Act: another host claims the same id with its own key, and the
        // real host's row is re-announced with a swapped key.
        let mut impostor = sighting("evil-host", Some("mirror-a"));
        impostor
            .metadata
            .insert(PUBLIC_KEY_METADATA_KEY.into(), json!("rogue-key"));
        let impostor_row = registry.upsert(impostor, Utc::now());
        let mut swapped = sighting("mirror-a", Some("mirror-a"));
        swapped
            .metadata
            .insert(PUBLIC_KEY_METADATA_KEY.into(), json!("rogue-key"));
        let genuine_row = registry.upsert(swapped, Utc::now());

        // Assert
        assert_eq!(
            registry.public_key_for(&MirrorId::from("mirror-a")).as_deref(),
            Some("genuine-key")
        );
        assert_eq!(impostor_row.public_key, None);
        assert_eq!(genuine_row.public_key.as_deref(), Some("genuine-key"));
    }

    #[test]
    fn test_public_key_lookup_ignores_rows_without_pinned_key() {
        // Many rows share the id; only the pinned key is ever returned.
        let registry = PeerRegistry::new();
        for host in ["a1", "a2", "a3", "a4"] {
            registry.upsert(sighting(host, Some("mirror-a")), Utc::now());
        }
        let mut keyed = sighting("a5", Some("mirror-a"));
        keyed.metadata.insert(PUBLIC_KEY_METADATA_KEY.into(), json!("k5"));
        registry.upsert(keyed, Utc::now());

        for _ in 0..10 {
            assert_eq!(
                registry.public_key_for(&MirrorId::from("mirror-a")).as_deref(),
                Some("k5")
            );
        }
    }

    #[test]
    fn test_hydrate_pins_key_of_oldest_row() {
        // Arrange: two persisted rows claim mirror-a; the older one wins.
        let now = Utc::now();
        let mut older = Mirror::new(MirrorId::from("mirror-a"), "mirror-a", 8000, now - Duration::hours(1));
        older.public_key = Some("older-key".into());
        let mut newer = Mirror::new(MirrorId::from("mirror-a"), "evil-host", 8000, now);
        newer.public_key = Some("newer-key".into());
        let mut store = MockMirrorRepository::new();
        store
            .expect_list_mirrors()
            .returning(move || Ok(vec![newer.clone(), older.clone()]));
        let registry = PeerRegistry::with_repository(Arc::new(store));

        // Act
        registry.hydrate().unwrap();

        // Assert
        assert_eq!(
            registry.public_key_for(&MirrorId::from("mirror-a")).as_deref(),
            Some("older-key")
        );
    }

    #[test]
    fn test_find_matches_id_or_hostname() {
        let registry = PeerRegistry::new();
        registry.upsert(sighting("mirror-b.local", Some("mirror-b")), Utc::now());

        assert!(registry.find("mirror-b").is_some());
        assert!(registry.find("mirror-b.local").is_some());
        assert!(registry.find("mirror-z").is_none());
    }

    #[test]
    fn test_get_or_create_keeps_existing_row() {
        // Arrange
        let registry = PeerRegistry::new();
        let id = MirrorId::from("local");
        let created = registry.get_or_create("local", &id, 8000, Utc::now());

        // Act
        let again = registry.get_or_create("local", &id, 9999, Utc::now());

        // Assert
        assert_eq!(created, again);
        assert_eq!(again.port, 8000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_is_sorted_by_hostname() {
        let registry = PeerRegistry::new();
        registry.upsert(sighting("zeta", None), Utc::now());
        registry.upsert(sighting("alpha", None), Utc::now());
        let names: Vec<String> = registry.list().into_iter().map(|m| m.hostname).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_upsert_writes_through_to_repository() {
        // Arrange
        let mut store = MockMirrorRepository::new();
        store
            .expect_save_mirror()
            .withf(|m| m.hostname == "mirror-b")
            .times(1)
            .returning(|_| Ok(()));
        let registry = PeerRegistry::with_repository(Arc::new(store));

        // Act / Assert: expectation checked on drop
        registry.upsert(sighting("mirror-b", None), Utc::now());
    }

    #[test]
    fn test_persistence_failure_keeps_in_memory_row() {
        let mut store = MockMirrorRepository::new();
        store
            .expect_save_mirror()
            .returning(|_| Err(RepositoryError::Backend("disk full".into())));
        let registry = PeerRegistry::with_repository(Arc::new(store));

        registry.upsert(sighting("mirror-b", None), Utc::now());

        assert!(registry.get("mirror-b").is_some());
    }

    #[test]
    fn test_hydrate_loads_persisted_rows() {
        // Arrange
        let mut store = MockMirrorRepository::new();
        store.expect_list_mirrors().returning(|| {
            Ok(vec![Mirror::new(MirrorId::from("m1"), "m1.local", 8000, Utc::now())])
        });
        let registry = PeerRegistry::with_repository(Arc::new(store));

        // Act
        let loaded = registry.hydrate().unwrap();

        // Assert
        assert_eq!(loaded, 1);
        assert!(registry.get("m1.local").is_some());
    }

    #[test]
    fn test_hydrate_without_repository_is_noop() {
        assert_eq!(PeerRegistry::new().hydrate().unwrap(), 0);
    }
}
