//! JSON datagrams used for LAN peer discovery.
//!
//! Wire format (one JSON object per UDP datagram):
//!
//! ```text
//! { "type": "announce" | "discover",
//!   "mirror_id": str, "hostname": str, "ip": str, "port": int,
//!   "base_url": str, "timestamp": int, "metadata": {...} }
//! ```
//!
//! - `announce` is broadcast periodically by every mirror and sent as a
//!   unicast reply to a probe.  It describes the sender.
//! - `discover` is a probe.  Any mirror that receives it answers with exactly
//!   one unicast `announce`.
//!
//! Decoding is strict about the shape (a JSON object with a known `type`) and
//! lenient about individual fields: every field except `type` is optional,
//! and a `port` or `timestamp` that is not a number is treated as absent
//! rather than failing the whole datagram.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::domain::mirror::Metadata;

/// Default UDP port for announce broadcasts and probes.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 5005;

/// Receive buffer size; larger datagrams are truncated by the OS and then
/// fail to parse.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Errors produced while encoding or decoding a discovery datagram.
#[derive(Debug, Error)]
pub enum DiscoveryCodecError {
    /// The bytes are not a JSON object with a recognised `type`.
    #[error("malformed discovery datagram: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Serialising an outbound message failed.
    #[error("failed to encode discovery datagram: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A discovery datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    /// "Here I am": a mirror describing itself.
    Announce(Announcement),
    /// "Who is out there?": asks every listener to reply with an `announce`.
    Discover(Probe),
}

/// Self-description carried by an `announce` datagram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Announcement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Advertised IP; validated by the receiver, which falls back to the
    /// datagram's source address when this is not an IP literal.
    #[serde(
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub ip: Option<String>,
    #[serde(
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,
    /// Seconds since the Unix epoch at the sender.
    #[serde(
        deserialize_with = "lenient_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    #[serde(deserialize_with = "lenient_metadata", skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Announcement {
    /// The registry key for the announcing mirror: its hostname, or its
    /// mirror id when no hostname was sent.  Blank values count as absent.
    pub fn registry_hostname(&self) -> Option<&str> {
        non_blank(self.hostname.as_deref()).or_else(|| non_blank(self.mirror_id.as_deref()))
    }

    pub fn mirror_id(&self) -> Option<&str> {
        non_blank(self.mirror_id.as_deref())
    }
}

/// Body of a `discover` probe.  Receivers ignore the contents; the fields
/// exist so probes from peers that describe themselves still parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Encodes a message as a UTF-8 JSON datagram.
///
/// # Errors
///
/// Returns [`DiscoveryCodecError::Encode`] if serialisation fails.
pub fn encode_datagram(msg: &DiscoveryMessage) -> Result<Vec<u8>, DiscoveryCodecError> {
    serde_json::to_vec(msg).map_err(DiscoveryCodecError::Encode)
}

/// Decodes one datagram.
///
/// # Errors
///
/// Returns [`DiscoveryCodecError::Malformed`] for invalid UTF-8/JSON, non-object
/// payloads, a missing or unknown `type`, or fields of the wrong shape.
pub fn decode_datagram(bytes: &[u8]) -> Result<DiscoveryMessage, DiscoveryCodecError> {
    serde_json::from_slice(bytes).map_err(DiscoveryCodecError::Malformed)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

// ── Lenient field decoders ────────────────────────────────────────────────────

fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|p| u16::try_from(p).ok()),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_metadata<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
