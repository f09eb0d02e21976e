//! Replication session watcher
//!
//! One watcher task per session. It owns the session's listeners, forwards
//! every event to the orchestrator's dispatch loop and detaches the listeners
//! as soon as a terminal event (`error` or `end`) went through. Whatever
//! follows a terminal event is never read.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::{ReplicationSession, Subscription};
use crate::peer::PeerId;
use crate::session::{SessionEvent, SessionId};

/// Session event tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub event: SessionEvent,
}

pub(crate) struct SessionWatcher {
    session_id: SessionId,
    peer_id: PeerId,
    listeners: Option<Subscription>,
    dispatch: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionWatcher {
    pub(crate) fn new(
        session_id: SessionId,
        session: ReplicationSession,
        dispatch: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        Self {
            session_id,
            peer_id: session.peer_id,
            listeners: Some(session.listeners),
            dispatch,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(listeners) = self.listeners.as_mut() {
            let event = match listeners.recv().await {
                Some(event) => event,
                None => SessionEvent::Error("session stream closed".to_string()),
            };
            let terminal = event.is_terminal();

            let message = SessionMessage {
                session_id: self.session_id,
                event,
            };
            if self.dispatch.send(message).is_err() {
                debug!("Orchestrator gone, dropping session {}", self.session_id);
                self.detach();
                break;
            }
            if terminal {
                self.detach();
            }
        }
    }

    /// Remove the listeners; only the first call does anything
    fn detach(&mut self) -> bool {
        match self.listeners.take() {
            Some(listeners) => {
                listeners.close();
                debug!(
                    "Detached listeners for session {} with {}",
                    self.session_id, self.peer_id
                );
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.detach();
    }
}
