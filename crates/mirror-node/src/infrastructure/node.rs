//! Wiring: turns an [`AppConfig`] into the running set of services.
//!
//! [`NodeState`] owns the record store and one instance of every application
//! service.  Optional capabilities degrade instead of failing start-up:
//!
//! - Transfers need both PEM key files.  If either cannot be loaded the
//!   orchestrator is left out and an error is logged.
//! - Export needs a non-empty secret.  Without one, export is disabled.
//!
//! Discovery is started separately through [`NodeState::start_discovery`]
//! so callers decide whether (and where) to bind the UDP socket.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{Duration, Utc};
use mirror_core::token::{
    parse_algorithm, ExportTokenCodec, TransferTokenIssuer, TransferTokenVerifier,
};
use mirror_core::{Metadata, MirrorId, TokenError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::application::export::ExportService;
use crate::application::peer_registry::{PeerRegistry, PUBLIC_KEY_METADATA_KEY};
use crate::application::sessions::SessionService;
use crate::application::transfer::{TransferOrchestrator, TransferStores};
use crate::infrastructure::network::advertise::Advertisement;
use crate::infrastructure::network::discovery::{
    DiscoveryError, DiscoveryHandle, DiscoveryOptions, DiscoveryService,
};
use crate::infrastructure::storage::config::{AppConfig, ConfigError};
use crate::infrastructure::storage::memory::InMemoryStore;

/// Longest token lifetime accepted from configuration (one year).
const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Everything a running mirror node holds.
pub struct NodeState {
    pub config: AppConfig,
    pub mirror_id: MirrorId,
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<PeerRegistry>,
    pub sessions: SessionService,
    pub transfers: Option<TransferOrchestrator>,
    pub exports: Option<ExportService>,
}

impl NodeState {
    /// Builds the services and registers this mirror in its own registry.
    pub fn new(config: AppConfig) -> Self {
        let mirror_id = config.identity.mirror_id();
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(PeerRegistry::with_repository(store.clone()));

        let advertisement = Advertisement::resolve(&config);
        registry.get_or_create(
            &config.identity.hostname,
            &mirror_id,
            advertisement.port,
            Utc::now(),
        );

        let public_root = config.network.public_root();
        let sessions = SessionService::new(mirror_id.clone(), public_root.clone(), store.clone());

        let transfers = match load_transfer_keys(&config) {
            Ok((issuer, verifier)) => Some(TransferOrchestrator::new(
                mirror_id.clone(),
                Arc::clone(&registry),
                issuer,
                verifier,
                TransferStores {
                    sessions: store.clone(),
                    videos: store.clone(),
                    transfers: store.clone(),
                },
            )
            .trust_published_keys(config.transfer.trust_published_keys)),
            Err(e) => {
                error!("session transfer disabled: {e}");
                None
            }
        };

        let exports = match ExportTokenCodec::new(
            config.export.secret.as_bytes(),
            ttl(config.export.ttl_secs),
        ) {
            Ok(codec) => Some(ExportService::new(
                codec,
                public_root,
                config.export.single_use,
                store.clone(),
                store.clone(),
            )),
            Err(e) => {
                warn!("export disabled: {e}");
                None
            }
        };

        info!(
            "mirror {} ({mirror_id}) ready; transfers {}, export {}",
            config.identity.hostname,
            enabled(transfers.is_some()),
            enabled(exports.is_some()),
        );

        Self {
            config,
            mirror_id,
            store,
            registry,
            sessions,
            transfers,
            exports,
        }
    }

    /// Starts discovery on the configured announce port and broadcast
    /// address.
    ///
    /// # Errors
    ///
    /// [`NodeError::Config`] for a bad broadcast address,
    /// [`NodeError::Discovery`] if the socket cannot be bound.
    pub fn start_discovery(&self, running: Arc<AtomicBool>) -> Result<DiscoveryHandle, NodeError> {
        let options = DiscoveryOptions::from_config(&self.config.discovery)?;
        self.start_discovery_with(options, running)
    }

    /// Starts discovery with explicit socket addresses.
    ///
    /// # Errors
    ///
    /// [`NodeError::Discovery`] if the socket cannot be bound.
    pub fn start_discovery_with(
        &self,
        options: DiscoveryOptions,
        running: Arc<AtomicBool>,
    ) -> Result<DiscoveryHandle, NodeError> {
        let service = DiscoveryService::new(
            options,
            self.mirror_id.clone(),
            self.config.identity.hostname.clone(),
            Advertisement::resolve(&self.config),
            Arc::clone(&self.registry),
        )
        .with_metadata(self.announce_metadata());
        Ok(service.start(running)?)
    }

    /// Extra announce metadata: the transfer public key, when publishing
    /// is enabled and the key file is readable.
    fn announce_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        if !self.config.discovery.publish_public_key {
            return metadata;
        }
        let path = &self.config.transfer.public_key_path;
        match std::fs::read_to_string(path) {
            Ok(pem) => {
                metadata.insert(PUBLIC_KEY_METADATA_KEY.to_string(), pem.into());
            }
            Err(e) => warn!("not publishing public key: cannot read {}: {e}", path.display()),
        }
        metadata
    }
}

fn load_transfer_keys(
    config: &AppConfig,
) -> Result<(TransferTokenIssuer, TransferTokenVerifier), TokenError> {
    let algorithm = parse_algorithm(&config.transfer.algorithm)?;
    let issuer = TransferTokenIssuer::from_pem_file(
        algorithm,
        &config.transfer.private_key_path,
        ttl(config.transfer.ttl_secs),
    )?;
    let verifier = TransferTokenVerifier::from_pem_file(algorithm, &config.transfer.public_key_path)?;
    Ok((issuer, verifier))
}

fn ttl(secs: u64) -> Duration {
    // Bounded above, so the cast cannot wrap.
    Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

fn enabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../mirror-core/tests/fixtures")
            .join(name)
    }

    fn config_with_keys() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.identity.hostname = "mirror-a".into();
        cfg.identity.mirror_id = "mirror-a-id".into();
        cfg.network.public_base_url = "http://10.0.0.5:8000".into();
        cfg.transfer.private_key_path = fixture("transfer_private.pem");
        cfg.transfer.public_key_path = fixture("transfer_public.pem");
        cfg.export.secret = "s3cret".into();
        cfg
    }

    #[test]
    fn test_defaults_without_keys_or_secret_disable_optional_services() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.transfer.private_key_path = PathBuf::from("/nonexistent/private.pem");

        // Act
        let node = NodeState::new(cfg);

        // Assert
        assert!(node.transfers.is_none());
        assert!(node.exports.is_none());
        assert!(node.registry.get("local-mirror").is_some(), "self is registered");
    }

    #[test]
    fn test_keys_and_secret_enable_transfer_and_export() {
        let node = NodeState::new(config_with_keys());

        assert!(node.transfers.is_some());
        assert!(node.exports.is_some());
        assert_eq!(node.mirror_id, MirrorId::from("mirror-a-id"));
    }

    #[test]
    fn test_unknown_algorithm_disables_transfer() {
        let mut cfg = config_with_keys();
        cfg.transfer.algorithm = "none".into();

        assert!(NodeState::new(cfg).transfers.is_none());
    }

    #[test]
    fn test_published_public_key_goes_into_announce_metadata() {
        // Arrange
        let mut cfg = config_with_keys();
        cfg.discovery.publish_public_key = true;
        let node = NodeState::new(cfg);

        // Act
        let metadata = node.announce_metadata();

        // Assert
        let pem = metadata[PUBLIC_KEY_METADATA_KEY].as_str().unwrap();
        assert!(pem.contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn test_announce_metadata_empty_when_not_publishing() {
        assert!(NodeState::new(config_with_keys()).announce_metadata().is_empty());
    }

    #[test]
    fn test_ttl_is_clamped() {
        assert_eq!(ttl(120), Duration::seconds(120));
        assert_eq!(ttl(u64::MAX), Duration::seconds(MAX_TTL_SECS as i64));
    }
}
