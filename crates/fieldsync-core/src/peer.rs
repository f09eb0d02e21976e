//! Peer identity and discovery records
//!
//! Defines how remote nodes are identified and what the sync engine reports
//! when it discovers one. The raw connection handle stays opaque and is never
//! serialized.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a remote node
///
/// Stable for the lifetime of a connection. Directly-dialed targets get an
/// identifier derived from their address (see [`SyncTarget::peer_key`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of device a peer (or this node) announces itself as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "mobile" => Ok(DeviceType::Mobile),
            "unknown" => Ok(DeviceType::Unknown),
            other => Err(format!(
                "unknown device type '{}' (expected desktop, mobile or unknown)",
                other
            )),
        }
    }
}

/// Engine-owned connection handle
///
/// The orchestrator carries it around but never looks inside. Engines wrap
/// whatever their transport uses and downcast it back when needed.
#[derive(Clone)]
pub struct Connection(Arc<dyn Any + Send + Sync>);

impl Connection {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection(..)")
    }
}

/// A peer as reported by the sync engine
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Human readable device name, if the peer announced one
    pub name: Option<String>,
    pub device_type: DeviceType,
    pub connection: Option<Connection>,
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: None,
            device_type,
            connection: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }
}

/// Where to replicate to
///
/// Every field is optional; the sync engine decides what combination is
/// valid and rejects the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Identity of an already discovered peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
    /// Sync file on disk (USB stick, shared folder)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
}

impl SyncTarget {
    pub fn address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn peer(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: Some(peer_id.into()),
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(path.into()),
            ..Self::default()
        }
    }

    /// Registry key for this target, when one can be derived
    ///
    /// Explicit peer ids win, then `host:port`, then the sync file path.
    pub fn peer_key(&self) -> Option<PeerId> {
        if let Some(ref id) = self.peer_id {
            return Some(id.clone());
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => return Some(PeerId(format!("{}:{}", host, port))),
            (Some(_), None) | (None, Some(_)) => return None,
            (None, None) => {}
        }
        self.filename
            .as_ref()
            .map(|path| PeerId(format!("file:{}", path.display())))
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_key() {
            Some(key) => write!(f, "{}", key),
            None => f.write_str("(incomplete target)"),
        }
    }
}

/// Shared project key scoping swarm membership
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First four characters, safe to put in logs
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(4)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupKey({}..)", self.short())
    }
}
