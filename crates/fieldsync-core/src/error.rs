//! Orchestrator errors

use thiserror::Error;

use crate::engine::EngineError;
use crate::peer::PeerId;
use crate::registry::RegistryError;

/// Errors returned to callers of the orchestrator handle
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Sync engine refused the request (bind failure, bad target)
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Peer {0} already has an active replication session")]
    SessionActive(PeerId),

    /// Shutdown has started; no new commands are accepted
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// The dispatch task is no longer running
    #[error("Orchestrator has stopped")]
    Stopped,
}

impl From<RegistryError> for OrchestratorError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::SessionActive(peer_id) => OrchestratorError::SessionActive(peer_id),
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
