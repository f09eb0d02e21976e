//! Peer registry
//!
//! In-memory view of every peer the engine told us about and the session
//! each one is running. Owned by the orchestrator's dispatch task; nothing
//! else writes to it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;
use tracing::debug;

use crate::peer::{DeviceType, PeerId, PeerInfo, SyncTarget};
use crate::session::{Session, SessionEvent, SessionId, SessionView, Transition};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} already has an active replication session")]
    SessionActive(PeerId),
}

/// Serializable view of a peer; the connection handle is left out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub device_type: DeviceType,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
}

#[derive(Debug)]
struct PeerRecord {
    info: PeerInfo,
    connected: bool,
    session: Option<Session>,
}

impl PeerRecord {
    fn has_active_session(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.phase().is_active())
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.info.id.clone(),
            name: self.info.name.clone(),
            device_type: self.info.device_type,
            connected: self.connected,
            session: self.session.as_ref().map(Session::view),
        }
    }
}

/// What happened when a session event was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub peer_id: PeerId,
    pub transition: Transition,
    /// Time since the session started
    pub elapsed: Duration,
    /// The peer record was dropped along with the finished session
    pub peer_removed: bool,
}

/// Known peers in first-seen order
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.peers.iter().position(|record| &record.info.id == peer_id)
    }

    fn position_of_session(&self, session_id: SessionId) -> Option<usize> {
        self.peers.iter().position(|record| {
            record
                .session
                .as_ref()
                .is_some_and(|session| session.id() == session_id)
        })
    }

    /// Add a discovered peer, or refresh an existing one
    pub fn upsert(&mut self, info: PeerInfo) {
        match self.position(&info.id) {
            Some(index) => {
                let record = &mut self.peers[index];
                record.info = info;
                record.connected = true;
            }
            None => self.peers.push(PeerRecord {
                info,
                connected: true,
                session: None,
            }),
        }
    }

    /// Handle a `down` event
    ///
    /// Peers without an active session are forgotten. Peers still
    /// replicating are kept, marked disconnected, until the session ends.
    /// Returns `true` when the peer was removed.
    pub fn mark_down(&mut self, peer_id: &PeerId) -> bool {
        let Some(index) = self.position(peer_id) else {
            return false;
        };
        if self.peers[index].has_active_session() {
            self.peers[index].connected = false;
            false
        } else {
            self.peers.remove(index);
            true
        }
    }

    /// Start a new session for a peer
    ///
    /// Directly-dialed targets have no record yet; one is created for them.
    pub fn begin_session(
        &mut self,
        peer_id: PeerId,
        target: Option<SyncTarget>,
    ) -> Result<SessionId, RegistryError> {
        let index = match self.position(&peer_id) {
            Some(index) if self.peers[index].has_active_session() => {
                return Err(RegistryError::SessionActive(peer_id));
            }
            Some(index) => index,
            None => {
                self.peers.push(PeerRecord {
                    info: PeerInfo::new(peer_id.clone(), DeviceType::Unknown),
                    connected: true,
                    session: None,
                });
                self.peers.len() - 1
            }
        };

        let mut session = Session::new(peer_id, target);
        // A fresh session is always Idle
        let _ = session.start();
        let id = session.id();
        self.peers[index].session = Some(session);
        Ok(id)
    }

    /// Feed a session event to the session it belongs to
    ///
    /// Returns `None` when the session is unknown or already finished; such
    /// events are dropped. Finished sessions are cleared from their peer.
    pub fn apply(&mut self, session_id: SessionId, event: &SessionEvent) -> Option<Applied> {
        let index = self.position_of_session(session_id)?;
        let record = &mut self.peers[index];
        let session = record.session.as_mut()?;

        let transition = match session.apply(event) {
            Ok(transition) => transition,
            Err(e) => {
                debug!("Ignoring session event: {}", e);
                return None;
            }
        };
        let elapsed = session.elapsed();
        let peer_id = record.info.id.clone();

        let mut peer_removed = false;
        if transition.is_terminal() {
            record.session = None;
            if !record.connected {
                self.peers.remove(index);
                peer_removed = true;
            }
        }

        Some(Applied {
            peer_id,
            transition,
            elapsed,
            peer_removed,
        })
    }

    /// Peer owning a session, if the session is still tracked
    pub fn peer_for_session(&self, session_id: SessionId) -> Option<&PeerId> {
        self.position_of_session(session_id)
            .map(|index| &self.peers[index].info.id)
    }

    pub fn has_active_session(&self, peer_id: &PeerId) -> bool {
        self.position(peer_id)
            .is_some_and(|index| self.peers[index].has_active_session())
    }

    /// Peers whose session is Started or InProgress
    pub fn active_sessions(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|record| record.has_active_session())
            .map(|record| record.info.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers.iter().map(PeerRecord::snapshot).collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerSnapshot> {
        self.position(peer_id)
            .map(|index| self.peers[index].snapshot())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
