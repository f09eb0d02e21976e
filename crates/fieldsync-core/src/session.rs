//! Replication session state machine
//!
//! ```text
//! Idle -> Started -> InProgress -> Completed
//!            \           \-------> Failed
//!             \--------------------^ (error / end)
//! ```
//!
//! Terminal phases accept no further events. A new replication with the same
//! peer gets a fresh [`Session`] with a new [`SessionId`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::peer::{PeerId, SyncTarget};

/// Unique identifier for one replication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Phase of a replication session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Idle,
    Started,
    InProgress,
    Completed,
    Failed,
}

impl SessionPhase {
    /// Still replicating (what shutdown waits for)
    pub fn is_active(self) -> bool {
        matches!(self, SessionPhase::Started | SessionPhase::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }
}

/// Amount of data transferred so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Records or bytes, whichever the engine counts
    pub transferred: u64,
    /// Total estimate, if the engine knows it
    pub total: Option<u64>,
}

impl ProgressSample {
    pub fn new(transferred: u64, total: impl Into<Option<u64>>) -> Self {
        Self {
            transferred,
            total: total.into(),
        }
    }
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{}/{}", self.transferred, total),
            None => write!(f, "{}/?", self.transferred),
        }
    }
}

/// Lifecycle events emitted by the sync engine for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress(ProgressSample),
    Error(String),
    /// Replication finished; the error is set when it ended badly
    End(Option<String>),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Progress(_))
    }
}

/// Result of feeding an event to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Progress recorded; `first` is set on the Started -> InProgress step
    Progress { first: bool },
    /// Aborted by an `error` event
    Failed { error: String },
    /// Reached `end`, cleanly when `error` is `None`
    Ended { error: Option<String> },
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Transition::Progress { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session {0} has not started")]
    NotStarted(SessionId),

    #[error("session {0} already started")]
    AlreadyStarted(SessionId),

    #[error("session {id} already finished ({phase:?})")]
    Finished { id: SessionId, phase: SessionPhase },
}

/// One replication attempt with a peer or a directly-dialed target
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    peer_id: PeerId,
    target: Option<SyncTarget>,
    phase: SessionPhase,
    started_at: DateTime<Utc>,
    started: Instant,
    progress: Option<ProgressSample>,
    error: Option<String>,
}

impl Session {
    pub fn new(peer_id: PeerId, target: Option<SyncTarget>) -> Self {
        Self {
            id: SessionId::new(),
            peer_id,
            target,
            phase: SessionPhase::Idle,
            started_at: Utc::now(),
            started: Instant::now(),
            progress: None,
            error: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn target(&self) -> Option<&SyncTarget> {
        self.target.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn progress(&self) -> Option<ProgressSample> {
        self.progress
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Time since the session was started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Idle -> Started
    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            SessionPhase::Idle => {
                self.phase = SessionPhase::Started;
                self.started_at = Utc::now();
                self.started = Instant::now();
                Ok(())
            }
            phase if phase.is_terminal() => Err(TransitionError::Finished { id: self.id, phase }),
            _ => Err(TransitionError::AlreadyStarted(self.id)),
        }
    }

    /// Apply an engine event
    pub fn apply(&mut self, event: &SessionEvent) -> Result<Transition, TransitionError> {
        match self.phase {
            SessionPhase::Idle => return Err(TransitionError::NotStarted(self.id)),
            phase if phase.is_terminal() => {
                return Err(TransitionError::Finished { id: self.id, phase })
            }
            _ => {}
        }

        let transition = match event {
            SessionEvent::Progress(sample) => {
                let first = self.phase == SessionPhase::Started;
                self.phase = SessionPhase::InProgress;
                self.progress = Some(*sample);
                Transition::Progress { first }
            }
            SessionEvent::Error(error) => {
                self.phase = SessionPhase::Failed;
                self.error = Some(error.clone());
                Transition::Failed {
                    error: error.clone(),
                }
            }
            SessionEvent::End(None) => {
                self.phase = SessionPhase::Completed;
                Transition::Ended { error: None }
            }
            SessionEvent::End(Some(error)) => {
                self.phase = SessionPhase::Failed;
                self.error = Some(error.clone());
                Transition::Ended {
                    error: Some(error.clone()),
                }
            }
        };

        Ok(transition)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            phase: self.phase,
            started_at: self.started_at,
            progress: self.progress,
            target: self.target.clone(),
        }
    }
}

/// Serializable view of a session, embedded in peer snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SyncTarget>,
}
