//! Sync engine interface
//!
//! The sync engine owns the dataset, swarm membership and the replication
//! protocol. The orchestrator only consumes the primitives defined here:
//!
//! 1. `listen` binds the network listener
//! 2. `subscribe` yields peer lifecycle events (`peer`, `sync-start`, `down`)
//! 3. `replicate` opens a session whose events arrive on a [`Subscription`]
//! 4. `destroy` tears everything down
//!
//! [`memory::MemoryEngine`] is an in-process implementation used by the tests
//! and the `fieldsync serve` control surface.

pub mod memory;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::{DeviceType, GroupKey, PeerId, PeerInfo, SyncTarget};
use crate::session::{ProgressSample, SessionEvent};

/// Errors reported by a sync engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network listener could not be bound
    #[error("Failed to bind sync listener: {0}")]
    Bind(String),

    /// Replication target was rejected by the engine
    #[error("Invalid sync target: {0}")]
    InvalidTarget(String),

    #[error("Replication error: {0}")]
    Replication(String),

    /// Joining or leaving the swarm failed
    #[error("Group membership error: {0}")]
    Group(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sync engine is closed")]
    Closed,
}

/// Lifecycle events for the swarm as a whole
#[derive(Debug)]
pub enum EngineEvent {
    /// A peer was discovered (or re-announced itself)
    PeerDiscovered(PeerInfo),
    /// A peer started replicating with us
    SyncStarted {
        peer_id: PeerId,
        session: ReplicationSession,
    },
    /// A peer disconnected
    PeerDown(PeerId),
}

/// Stream of [`EngineEvent`]s
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

/// Options passed with every replication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateOptions {
    /// Device type we announce to the remote side
    pub device_type: DeviceType,
    pub group_key: Option<GroupKey>,
}

/// Dataset export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Geojson,
    Shapefile,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Geojson => f.write_str("geojson"),
            ExportFormat::Shapefile => f.write_str("shapefile"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Preset definitions used to label exported features
    pub presets: serde_json::Value,
}

/// The set of listeners attached to one replication session
///
/// Dropping or closing it detaches the listeners: the engine can no longer
/// deliver events for the session.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    /// Next event, or `None` once the engine dropped its side
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Detach from the engine
    pub fn close(mut self) {
        self.rx.close();
    }
}

/// Engine side of a session: where lifecycle events are pushed
#[derive(Debug, Clone)]
pub struct SessionEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEmitter {
    /// Push an event. Returns `false` when nobody is listening anymore.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn progress(&self, transferred: u64, total: impl Into<Option<u64>>) -> bool {
        self.emit(SessionEvent::Progress(ProgressSample::new(transferred, total)))
    }

    pub fn error(&self, error: impl Into<String>) -> bool {
        self.emit(SessionEvent::Error(error.into()))
    }

    pub fn end(&self, error: Option<String>) -> bool {
        self.emit(SessionEvent::End(error))
    }

    /// Whether the session's listeners are still attached
    pub fn is_attached(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A live replication session handed out by the engine
#[derive(Debug)]
pub struct ReplicationSession {
    pub peer_id: PeerId,
    /// Set for locally initiated sessions
    pub target: Option<SyncTarget>,
    pub listeners: Subscription,
}

impl ReplicationSession {
    /// Create a session and the emitter the engine drives it with
    pub fn channel(peer_id: PeerId, target: Option<SyncTarget>) -> (Self, SessionEmitter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            peer_id,
            target,
            listeners: Subscription { rx },
        };
        (session, SessionEmitter { tx })
    }
}

/// Primitives the orchestrator needs from a sync engine
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Bind the network listener
    async fn listen(&self) -> Result<(), EngineError>;

    /// Name this node announces to peers
    fn set_name(&self, name: &str);

    /// Subscribe to swarm lifecycle events
    fn subscribe(&self) -> EngineEvents;

    fn join(&self, key: &GroupKey) -> Result<(), EngineError>;

    fn leave(&self, key: &GroupKey) -> Result<(), EngineError>;

    /// Peers currently known to the engine
    fn peers(&self) -> Vec<PeerInfo>;

    /// Start replicating with `target`
    fn replicate(
        &self,
        target: &SyncTarget,
        options: &ReplicateOptions,
    ) -> Result<ReplicationSession, EngineError>;

    async fn export_data(
        &self,
        destination: &Path,
        options: &ExportOptions,
    ) -> Result<(), EngineError>;

    /// Close the listener and release every resource
    async fn destroy(&self) -> Result<(), EngineError>;
}
