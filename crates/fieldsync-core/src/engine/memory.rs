//! In-process sync engine
//!
//! Keeps peers, group membership and sessions in memory. Tests script it
//! directly (discover peers, push session events, inject failures); the
//! `serve` command runs it with a [`Simulation`] so replications progress on
//! their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    EngineError, EngineEvent, EngineEvents, ExportFormat, ExportOptions, ReplicateOptions,
    ReplicationSession, SessionEmitter, SyncEngine,
};
use crate::peer::{GroupKey, PeerId, PeerInfo, SyncTarget};

/// Replays a fixed replication for every session
#[derive(Debug, Clone, Copy)]
pub struct Simulation {
    /// Number of progress events before `end`
    pub steps: u64,
    /// Delay between two progress events
    pub step_delay: Duration,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            steps: 20,
            step_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct Failures {
    bind: Option<String>,
    join: Option<String>,
    leave: Option<String>,
    export: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    listening: bool,
    destroyed: bool,
    name: Option<String>,
    groups: Vec<GroupKey>,
    peers: Vec<PeerInfo>,
    subscribers: Vec<mpsc::UnboundedSender<EngineEvent>>,
    sessions: HashMap<PeerId, SessionEmitter>,
    replications: Vec<(SyncTarget, ReplicateOptions)>,
    exports: Vec<(PathBuf, ExportOptions)>,
    failures: Failures,
}

/// Sync engine that lives entirely in memory
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    simulation: Option<Simulation>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replications progress and end on their own
    pub fn with_simulation(simulation: Simulation) -> Self {
        Self {
            state: Mutex::default(),
            simulation: Some(simulation),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `listen` fail
    pub fn fail_bind(&self, error: impl Into<String>) {
        self.state().failures.bind = Some(error.into());
    }

    pub fn fail_join(&self, error: impl Into<String>) {
        self.state().failures.join = Some(error.into());
    }

    pub fn fail_leave(&self, error: impl Into<String>) {
        self.state().failures.leave = Some(error.into());
    }

    pub fn fail_export(&self, error: impl Into<String>) {
        self.state().failures.export = Some(error.into());
    }

    /// Announce a peer to every subscriber
    pub fn discover(&self, peer: PeerInfo) {
        let mut state = self.state();
        state.peers.retain(|known| known.id != peer.id);
        state.peers.push(peer.clone());
        state
            .subscribers
            .retain(|tx| tx.send(EngineEvent::PeerDiscovered(peer.clone())).is_ok());
    }

    /// Drop a peer's connection
    pub fn disconnect(&self, peer_id: &PeerId) {
        let mut state = self.state();
        state.peers.retain(|known| &known.id != peer_id);
        state
            .subscribers
            .retain(|tx| tx.send(EngineEvent::PeerDown(peer_id.clone())).is_ok());
    }

    /// A remote peer starts replicating with us
    ///
    /// The session goes to the first live subscriber only, since a session
    /// can be watched once.
    pub fn announce_sync(&self, peer_id: &PeerId) -> SessionEmitter {
        let (session, emitter) = ReplicationSession::channel(peer_id.clone(), None);
        let mut state = self.state();
        state.sessions.insert(peer_id.clone(), emitter.clone());

        let mut event = Some(EngineEvent::SyncStarted {
            peer_id: peer_id.clone(),
            session,
        });
        state.subscribers.retain(|tx| match event.take() {
            Some(ev) => match tx.send(ev) {
                Ok(()) => true,
                Err(mpsc::error::SendError(ev)) => {
                    event = Some(ev);
                    false
                }
            },
            None => true,
        });

        emitter
    }

    /// Emitter for the most recent session with a peer
    pub fn session(&self, peer_id: &PeerId) -> Option<SessionEmitter> {
        self.state().sessions.get(peer_id).cloned()
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub fn name(&self) -> Option<String> {
        self.state().name.clone()
    }

    pub fn joined_groups(&self) -> Vec<GroupKey> {
        self.state().groups.clone()
    }

    /// Every replication request received so far
    pub fn replications(&self) -> Vec<(SyncTarget, ReplicateOptions)> {
        self.state().replications.clone()
    }

    pub fn exports(&self) -> Vec<(PathBuf, ExportOptions)> {
        self.state().exports.clone()
    }
}

#[async_trait]
impl SyncEngine for MemoryEngine {
    async fn listen(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        if let Some(error) = state.failures.bind.take() {
            return Err(EngineError::Bind(error));
        }
        state.listening = true;
        Ok(())
    }

    fn set_name(&self, name: &str) {
        self.state().name = Some(name.to_string());
    }

    fn subscribe(&self) -> EngineEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }

    fn join(&self, key: &GroupKey) -> Result<(), EngineError> {
        let mut state = self.state();
        if let Some(ref error) = state.failures.join {
            return Err(EngineError::Group(error.clone()));
        }
        if !state.groups.contains(key) {
            state.groups.push(key.clone());
        }
        Ok(())
    }

    fn leave(&self, key: &GroupKey) -> Result<(), EngineError> {
        let mut state = self.state();
        if let Some(ref error) = state.failures.leave {
            return Err(EngineError::Group(error.clone()));
        }
        state.groups.retain(|joined| joined != key);
        Ok(())
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.state().peers.clone()
    }

    fn replicate(
        &self,
        target: &SyncTarget,
        options: &ReplicateOptions,
    ) -> Result<ReplicationSession, EngineError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(EngineError::Closed);
        }
        let peer_id = target.peer_key().ok_or_else(|| {
            EngineError::InvalidTarget(
                "expected a host and port, a peer id or a sync file".to_string(),
            )
        })?;

        let (session, emitter) = ReplicationSession::channel(peer_id.clone(), Some(target.clone()));
        state.sessions.insert(peer_id, emitter.clone());
        state.replications.push((target.clone(), options.clone()));
        drop(state);

        if let Some(simulation) = self.simulation {
            tokio::spawn(simulate(emitter, simulation));
        }

        Ok(session)
    }

    async fn export_data(
        &self,
        destination: &Path,
        options: &ExportOptions,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.state();
            if let Some(ref error) = state.failures.export {
                return Err(EngineError::Export(error.clone()));
            }
            state
                .exports
                .push((destination.to_path_buf(), options.clone()));
        }

        // The in-memory dataset is always empty
        match options.format {
            ExportFormat::Geojson => {
                tokio::fs::write(destination, r#"{"type":"FeatureCollection","features":[]}"#)
                    .await?;
                Ok(())
            }
            ExportFormat::Shapefile => Err(EngineError::Export(
                "shapefile export needs an on-disk dataset".to_string(),
            )),
        }
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        state.destroyed = true;
        state.listening = false;
        state.subscribers.clear();
        state.sessions.clear();
        Ok(())
    }
}

async fn simulate(emitter: SessionEmitter, simulation: Simulation) {
    for step in 1..=simulation.steps {
        tokio::time::sleep(simulation.step_delay).await;
        if !emitter.progress(step, simulation.steps) {
            debug!("Simulated session detached at step {}", step);
            return;
        }
    }
    emitter.end(None);
}
