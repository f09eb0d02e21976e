//! FieldSync Core Library
//!
//! This crate coordinates peer-to-peer replication for a desktop
//! data-collection node: it tracks discovered peers, runs concurrent
//! replication sessions, throttles progress updates and drains running
//! sessions on shutdown.
//!
//! # Architecture
//!
//! - **Sync engine**: owns the dataset and the replication protocol,
//!   consumed through the [`SyncEngine`] trait
//! - **Orchestrator**: a single dispatch task owning all state, driven by
//!   messages from an [`OrchestratorHandle`]
//!
//! # Quick Start
//!
//! ```text
//! let engine = Arc::new(MemoryEngine::new());
//! let (tx, mut notifications) = mpsc::unbounded_channel();
//! let orchestrator = Orchestrator::new(engine, Arc::new(tx), config);
//!
//! let handle = orchestrator.start_listening().await?;
//! handle.start_sync(SyncTarget::address("10.0.0.5", 1234)).await?;
//!
//! while let Some(notification) = notifications.recv().await { ... }
//! handle.shutdown().await;
//! ```
//!
//! # Modules
//!
//! - `orchestrator`: Commands, dispatch loop and graceful shutdown (main entry point)
//! - `engine`: Sync engine trait and the in-memory engine
//! - `registry`: Known peers and their sessions
//! - `session`: Replication session state machine
//! - `throttle`: Trailing-edge rate limiting for peer updates
//! - `watcher`: Per-session event forwarding
//! - `notify`: Notifications and sinks
//! - `config`: Application configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod peer;
pub mod registry;
pub mod session;
pub mod throttle;
pub mod watcher;

pub use config::Config;
pub use engine::memory::{MemoryEngine, Simulation};
pub use engine::{EngineError, EngineEvent, ExportFormat, SyncEngine};
pub use error::{OrchestratorError, OrchestratorResult};
pub use notify::{GroupAction, Notification, NotificationSink};
pub use orchestrator::{
    ExportRequest, Orchestrator, OrchestratorConfig, OrchestratorHandle, ShutdownReport,
};
pub use peer::{DeviceType, GroupKey, PeerId, PeerInfo, SyncTarget};
pub use registry::{PeerRegistry, PeerSnapshot};
pub use session::{SessionId, SessionPhase};
