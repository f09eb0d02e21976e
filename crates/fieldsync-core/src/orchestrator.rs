//! Replication session orchestrator
//!
//! [`Orchestrator::start_listening`] binds the sync engine and spawns one
//! dispatch task that owns all orchestration state: the peer registry, the
//! per-peer update throttles and the table of watched sessions. Everything
//! reaches that task as a message:
//!
//! - commands from [`OrchestratorHandle`]
//! - engine lifecycle events (`peer`, `sync-start`, `down`)
//! - session events forwarded by one watcher task per session
//! - throttle and drain deadlines
//!
//! Shutdown stops taking commands, keeps processing events until no
//! replication is running or the deadline passes, then destroys the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{
    EngineEvent, EngineEvents, ExportFormat, ExportOptions, ReplicateOptions, ReplicationSession,
    SyncEngine,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notify::{GroupAction, Notification, NotificationSink};
use crate::peer::{DeviceType, GroupKey, PeerId, SyncTarget};
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::session::{SessionId, Transition};
use crate::throttle::{deadline_after, ThrottleSet, DEFAULT_INTERVAL};
use crate::watcher::{SessionMessage, SessionWatcher};

/// Pending commands before callers have to wait
const COMMAND_BUFFER: usize = 32;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name announced to peers
    pub device_name: String,
    /// Device type declared on outgoing replications
    pub device_type: DeviceType,
    pub group_key: Option<GroupKey>,
    /// Minimum spacing between peer-list updates caused by one source
    pub progress_interval: Duration,
    /// Default drain deadline for [`OrchestratorHandle::shutdown`]
    pub shutdown_timeout: Duration,
    /// Send [`Notification::GroupMembershipFailed`] on join/leave errors
    pub report_group_errors: bool,
    /// Presets attached to exports that don't bring their own
    pub presets_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            device_name: "FieldSync Desktop".to_string(),
            device_type: DeviceType::Mobile,
            group_key: None,
            progress_interval: DEFAULT_INTERVAL,
            shutdown_timeout: Duration::from_secs(5 * 60),
            report_group_errors: false,
            presets_path: None,
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            device_name: config.device_name.clone(),
            device_type: config.device_type,
            group_key: config.group_key(),
            progress_interval: config.progress_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            report_group_errors: config.report_group_errors,
            presets_path: Some(config.presets_path()),
        }
    }
}

/// A dataset export, correlated with its result by `request_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub destination: PathBuf,
    pub format: ExportFormat,
    /// Falls back to the configured presets file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets: Option<serde_json::Value>,
    pub request_id: String,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Peers still replicating when the engine was destroyed
    pub abandoned: Vec<PeerId>,
    /// The drain deadline passed before every replication finished
    pub timed_out: bool,
}

type Reply<T> = oneshot::Sender<OrchestratorResult<T>>;

enum Command {
    StartSync {
        target: SyncTarget,
        reply: Reply<SessionId>,
    },
    Group {
        action: GroupAction,
        key: Option<GroupKey>,
        reply: Reply<()>,
    },
    Export {
        request: ExportRequest,
        reply: Reply<()>,
    },
    Peers {
        reply: Reply<Vec<PeerSnapshot>>,
    },
    Shutdown {
        timeout: Option<Duration>,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

impl Command {
    /// Answer a command that arrived after shutdown began
    fn reject(self) {
        match self {
            Command::StartSync { reply, .. } => {
                let _ = reply.send(Err(OrchestratorError::ShuttingDown));
            }
            Command::Group { reply, .. } | Command::Export { reply, .. } => {
                let _ = reply.send(Err(OrchestratorError::ShuttingDown));
            }
            Command::Peers { reply } => {
                let _ = reply.send(Err(OrchestratorError::ShuttingDown));
            }
            // Shutdown requests are never rejected, they join the drain
            Command::Shutdown { .. } => {}
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::StartSync { .. } => "StartSync",
            Command::Group { .. } => "Group",
            Command::Export { .. } => "Export",
            Command::Peers { .. } => "Peers",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Not yet listening
pub struct Orchestrator {
    engine: Arc<dyn SyncEngine>,
    sink: Arc<dyn NotificationSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn SyncEngine>,
        sink: Arc<dyn NotificationSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            sink,
            config,
        }
    }

    /// Bind the engine listener and start dispatching
    ///
    /// Nothing is subscribed or spawned unless binding succeeds, so a bind
    /// error leaves the engine untouched.
    pub async fn start_listening(self) -> OrchestratorResult<OrchestratorHandle> {
        self.engine.listen().await?;
        self.engine.set_name(&self.config.device_name);
        let events = self.engine.subscribe();

        let mut registry = PeerRegistry::new();
        for peer in self.engine.peers() {
            registry.upsert(peer);
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();

        info!(
            "Sync listener ready as {:?} ({} known peers)",
            self.config.device_name,
            registry.len()
        );

        let dispatcher = Dispatcher {
            throttles: ThrottleSet::new(self.config.progress_interval),
            engine: self.engine,
            sink: self.sink,
            config: self.config,
            registry,
            sessions_tx,
            watchers: HashMap::new(),
            exports: JoinSet::new(),
            drain: None,
        };
        tokio::spawn(dispatcher.run(commands_rx, events, sessions_rx));

        Ok(OrchestratorHandle {
            commands: commands_tx,
        })
    }
}

/// Handle to a running orchestrator
///
/// Cheap to clone. When the last handle is dropped the orchestrator shuts
/// down with the configured deadline.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> OrchestratorResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        reply.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Start replicating with `target`
    ///
    /// The target is handed to the engine as is; its validation error comes
    /// back here.
    pub async fn start_sync(&self, target: SyncTarget) -> OrchestratorResult<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartSync { target, reply }, rx).await?
    }

    /// Join the swarm with the configured group key
    ///
    /// Engine failures are logged, not returned.
    pub async fn join_group(&self) -> OrchestratorResult<()> {
        self.group(GroupAction::Join, None).await
    }

    pub async fn join_group_with(&self, key: GroupKey) -> OrchestratorResult<()> {
        self.group(GroupAction::Join, Some(key)).await
    }

    pub async fn leave_group(&self) -> OrchestratorResult<()> {
        self.group(GroupAction::Leave, None).await
    }

    pub async fn leave_group_with(&self, key: GroupKey) -> OrchestratorResult<()> {
        self.group(GroupAction::Leave, Some(key)).await
    }

    async fn group(&self, action: GroupAction, key: Option<GroupKey>) -> OrchestratorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Group { action, key, reply }, rx).await?
    }

    /// Queue an export; the result arrives as [`Notification::ExportFinished`]
    pub async fn export_data(&self, request: ExportRequest) -> OrchestratorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Export { request, reply }, rx).await?
    }

    pub async fn peers(&self) -> OrchestratorResult<Vec<PeerSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Peers { reply }, rx).await?
    }

    /// Drain with the configured deadline, then destroy the engine
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_inner(None).await
    }

    pub async fn shutdown_within(&self, timeout: Duration) -> ShutdownReport {
        self.shutdown_inner(Some(timeout)).await
    }

    async fn shutdown_inner(&self, timeout: Option<Duration>) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        // Already stopped counts as a clean shutdown
        self.request(Command::Shutdown { timeout, reply }, rx)
            .await
            .unwrap_or_default()
    }
}

/// Throttle sources
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UpdateKey {
    /// Discovery and disconnects
    Registry,
    /// Progress of one peer's session
    Peer(PeerId),
}

/// Why the last update for a source was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateReason {
    Discovered,
    Down,
    SyncStarted,
    Progress,
}

struct Drain {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<ShutdownReport>>,
    /// Last logged number of running replications
    remaining: usize,
}

struct Dispatcher {
    engine: Arc<dyn SyncEngine>,
    sink: Arc<dyn NotificationSink>,
    config: OrchestratorConfig,
    registry: PeerRegistry,
    throttles: ThrottleSet<UpdateKey, UpdateReason>,
    sessions_tx: mpsc::UnboundedSender<SessionMessage>,
    watchers: HashMap<SessionId, JoinHandle<()>>,
    /// Running exports; shutdown waits for them so every request gets its result
    exports: JoinSet<()>,
    drain: Option<Drain>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: EngineEvents,
        mut sessions: mpsc::UnboundedReceiver<SessionMessage>,
    ) {
        let mut commands_open = true;
        let mut events_open = true;

        loop {
            if self.drain_finished() {
                break;
            }

            let throttle_deadline = self.throttles.next_deadline();
            let drain_deadline = self.drain.as_ref().map(|drain| drain.deadline);

            // Events queued before a command are handled before it
            tokio::select! {
                biased;

                Some(message) = sessions.recv() => self.handle_session_message(message),
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_engine_event(event),
                    None => {
                        debug!("Sync engine event stream closed");
                        events_open = false;
                    }
                },
                _ = wait_until(throttle_deadline) => self.deliver_due(Instant::now()),
                Some(result) = self.exports.join_next(), if !self.exports.is_empty() => {
                    if let Err(e) = result {
                        warn!("Export task failed: {}", e);
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All orchestrator handles dropped");
                        commands_open = false;
                        self.begin_drain(None, None);
                    }
                },
                // The next iteration notices the deadline
                _ = wait_until(drain_deadline) => {}
            }
        }

        self.finish().await;
    }

    fn handle_command(&mut self, command: Command) {
        if self.drain.is_some() {
            match command {
                Command::Shutdown { timeout, reply } => self.begin_drain(timeout, Some(reply)),
                command => {
                    debug!("Rejecting {:?} during shutdown", command);
                    command.reject();
                }
            }
            return;
        }

        match command {
            Command::StartSync { target, reply } => {
                let _ = reply.send(self.start_sync(target));
            }
            Command::Group { action, key, reply } => {
                self.change_group(action, key);
                let _ = reply.send(Ok(()));
            }
            Command::Export { request, reply } => {
                self.export(request);
                let _ = reply.send(Ok(()));
            }
            Command::Peers { reply } => {
                let _ = reply.send(Ok(self.registry.snapshot()));
            }
            Command::Shutdown { timeout, reply } => self.begin_drain(timeout, Some(reply)),
        }
    }

    /// Busy peers are detected by the target's own key before the engine is
    /// asked. When the engine resolves the target to a different peer that is
    /// already busy, the fresh session is dropped, which detaches it.
    fn start_sync(&mut self, target: SyncTarget) -> OrchestratorResult<SessionId> {
        info!("Sync start request: {}", target);

        let peer_key = target.peer_key();
        if let Some(ref peer_id) = peer_key {
            if self.registry.has_active_session(peer_id) {
                return Err(OrchestratorError::SessionActive(peer_id.clone()));
            }
        }

        let options = ReplicateOptions {
            device_type: self.config.device_type,
            group_key: self.config.group_key.clone(),
        };
        let session = self.engine.replicate(&target, &options).map_err(|e| {
            warn!("Sync engine rejected {}: {}", target, e);
            e
        })?;

        if peer_key.as_ref() != Some(&session.peer_id) {
            debug!("Target {} resolved to peer {}", target, session.peer_id);
        }
        // Dropping the session on error detaches it
        let session_id = self
            .registry
            .begin_session(session.peer_id.clone(), Some(target))
            .map_err(|e| {
                warn!("Dropping replication the engine already started: {}", e);
                e
            })?;
        self.notify_peers();
        self.watch(session_id, session);
        Ok(session_id)
    }

    fn watch(&mut self, session_id: SessionId, session: ReplicationSession) {
        let watcher = SessionWatcher::new(session_id, session, self.sessions_tx.clone());
        self.watchers.insert(session_id, watcher.spawn());
    }

    fn change_group(&mut self, action: GroupAction, key: Option<GroupKey>) {
        let Some(key) = key.or_else(|| self.config.group_key.clone()) else {
            self.group_failed(action, "no group key configured".to_string());
            return;
        };

        info!("Sync {} swarm {}", action, key.short());
        let result = match action {
            GroupAction::Join => self.engine.join(&key),
            GroupAction::Leave => self.engine.leave(&key),
        };
        if let Err(e) = result {
            self.group_failed(action, e.to_string());
        }
    }

    fn group_failed(&self, action: GroupAction, error: String) {
        warn!("Sync {} error: {}", action, error);
        if self.config.report_group_errors {
            self.sink
                .notify(Notification::GroupMembershipFailed { action, error });
        }
    }

    fn export(&mut self, request: ExportRequest) {
        let engine = Arc::clone(&self.engine);
        let sink = Arc::clone(&self.sink);
        let presets_path = self.config.presets_path.clone();

        self.exports.spawn(async move {
            let ExportRequest {
                destination,
                format,
                presets,
                request_id,
            } = request;

            let presets = match presets {
                Some(presets) => presets,
                None => load_presets(presets_path.as_deref()).await,
            };
            let options = ExportOptions { format, presets };

            let error = match engine.export_data(&destination, &options).await {
                Ok(()) => {
                    info!("Exported {} to {:?}", format, destination);
                    None
                }
                Err(e) => {
                    warn!("Export {} failed: {}", request_id, e);
                    Some(e.to_string())
                }
            };
            sink.notify(Notification::ExportFinished { request_id, error });
        });
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::PeerDiscovered(peer) => {
                if self.drain.is_some() {
                    debug!("Ignoring discovery of {} during shutdown", peer.id);
                    return;
                }
                debug!("Discovered peer {} ({})", peer.id, peer.device_type);
                self.registry.upsert(peer);
                self.offer_update(UpdateKey::Registry, UpdateReason::Discovered);
            }
            EngineEvent::SyncStarted { peer_id, session } => {
                if self.drain.is_some() {
                    debug!("Refusing replication from {} during shutdown", peer_id);
                    return;
                }
                match self.registry.begin_session(peer_id.clone(), None) {
                    Ok(session_id) => {
                        info!("{} started replicating (session {})", peer_id, session_id);
                        self.watch(session_id, session);
                        self.offer_update(UpdateKey::Peer(peer_id), UpdateReason::SyncStarted);
                    }
                    Err(e) => warn!("Ignoring inbound replication: {}", e),
                }
            }
            EngineEvent::PeerDown(peer_id) => {
                if self.registry.mark_down(&peer_id) {
                    debug!("Peer {} went down", peer_id);
                    self.throttles.remove(&UpdateKey::Peer(peer_id));
                } else {
                    debug!("Peer {} went down while replicating", peer_id);
                }
                self.offer_update(UpdateKey::Registry, UpdateReason::Down);
            }
        }
    }

    fn handle_session_message(&mut self, message: SessionMessage) {
        let SessionMessage { session_id, event } = message;

        // Whatever progress is still waiting goes out before the outcome
        if event.is_terminal() {
            if let Some(peer_id) = self.registry.peer_for_session(session_id).cloned() {
                if self.throttles.flush(&UpdateKey::Peer(peer_id)).is_some() {
                    self.notify_peers();
                }
            }
        }

        let Some(applied) = self.registry.apply(session_id, &event) else {
            debug!("Dropping event for finished session {}", session_id);
            return;
        };
        let peer_id = applied.peer_id;

        match applied.transition {
            Transition::Progress { first } => {
                if first {
                    debug!("Replication with {} in progress", peer_id);
                }
                self.offer_update(UpdateKey::Peer(peer_id.clone()), UpdateReason::Progress);
            }
            Transition::Failed { error } => {
                warn!("Sync with {} failed: {}", peer_id, error);
                self.forget_session(session_id, &peer_id);
                self.sink.notify(Notification::SyncFailed {
                    peer_id: peer_id.clone(),
                    error,
                });
                self.notify_peers();
            }
            Transition::Ended { error } => {
                if let Some(error) = error {
                    warn!("Sync with {} ended with error: {}", peer_id, error);
                }
                info!(
                    "Sync with {} completed in {:.2} seconds",
                    peer_id,
                    applied.elapsed.as_secs_f64()
                );
                self.forget_session(session_id, &peer_id);
                self.sink.notify(Notification::SyncComplete {
                    peer_id: peer_id.clone(),
                });
                self.notify_peers();
            }
        }

        if applied.peer_removed {
            debug!("Forgot disconnected peer {}", peer_id);
        }
    }

    fn forget_session(&mut self, session_id: SessionId, peer_id: &PeerId) {
        self.watchers.remove(&session_id);
        self.throttles.remove(&UpdateKey::Peer(peer_id.clone()));
    }

    fn offer_update(&mut self, key: UpdateKey, reason: UpdateReason) {
        self.throttles.offer(key, reason, Instant::now());
    }

    fn deliver_due(&mut self, now: Instant) {
        for (key, reason) in self.throttles.poll(now) {
            debug!("Peer update for {:?} ({:?})", key, reason);
            self.notify_peers();
        }
    }

    fn notify_peers(&self) {
        self.sink.notify(Notification::PeerUpdate {
            peers: self.registry.snapshot(),
        });
    }

    fn begin_drain(
        &mut self,
        timeout: Option<Duration>,
        reply: Option<oneshot::Sender<ShutdownReport>>,
    ) {
        if let Some(drain) = self.drain.as_mut() {
            drain.waiters.extend(reply);
            return;
        }

        let timeout = timeout.unwrap_or(self.config.shutdown_timeout);
        let remaining = self.registry.active_sessions().len();
        info!(
            "Shutting down: {} peers still replicating, waiting up to {:?}",
            remaining, timeout
        );
        self.drain = Some(Drain {
            deadline: deadline_after(Instant::now(), timeout),
            waiters: reply.into_iter().collect(),
            remaining,
        });
    }

    /// Whether a drain is running and has nothing left to wait for
    fn drain_finished(&mut self) -> bool {
        let remaining = self.registry.active_sessions().len();
        let Some(drain) = self.drain.as_mut() else {
            return false;
        };

        if remaining != drain.remaining {
            info!("{} peers still replicating", remaining);
            drain.remaining = remaining;
        }
        remaining == 0 || Instant::now() >= drain.deadline
    }

    async fn finish(mut self) {
        let waiters = self
            .drain
            .take()
            .map(|drain| drain.waiters)
            .unwrap_or_default();

        // Last state of every source still waiting on its window
        if !self.throttles.flush_all().is_empty() {
            self.notify_peers();
        }

        let abandoned = self.registry.active_sessions();
        let timed_out = !abandoned.is_empty();
        if timed_out {
            warn!(
                "Shutdown deadline passed, abandoning {} replications",
                abandoned.len()
            );
        }

        if !self.exports.is_empty() {
            info!("Waiting for {} exports", self.exports.len());
        }
        while let Some(result) = self.exports.join_next().await {
            if let Err(e) = result {
                warn!("Export task failed: {}", e);
            }
        }

        if let Err(e) = self.engine.destroy().await {
            warn!("Failed to destroy sync engine: {}", e);
        }
        info!("Sync engine closed");

        // Abandoned sessions lose their listeners
        for (session_id, watcher) in self.watchers.drain() {
            debug!("Detaching abandoned session {}", session_id);
            watcher.abort();
        }

        let report = ShutdownReport {
            abandoned,
            timed_out,
        };
        for waiter in waiters {
            let _ = waiter.send(report.clone());
        }
    }
}

/// Sleep until `deadline`, or forever without one
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Presets from disk; an empty object when there are none
async fn load_presets(path: Option<&Path>) -> serde_json::Value {
    let empty = || serde_json::Value::Object(serde_json::Map::new());
    let Some(path) = path else {
        return empty();
    };

    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring unreadable presets {:?}: {}", path, e);
            empty()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => empty(),
        Err(e) => {
            warn!("Failed to read presets {:?}: {}", path, e);
            empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::EngineError;
    use crate::peer::PeerInfo;
    use crate::session::{ProgressSample, SessionPhase};
    use tempfile::TempDir;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Harness {
        engine: Arc<MemoryEngine>,
        handle: OrchestratorHandle,
        notifications: mpsc::UnboundedReceiver<Notification>,
    }

    async fn start_with(engine: Arc<MemoryEngine>, config: OrchestratorConfig) -> Harness {
        let (tx, notifications) = mpsc::unbounded_channel();
        let handle = Orchestrator::new(engine.clone(), Arc::new(tx), config)
            .start_listening()
            .await
            .unwrap();
        Harness {
            engine,
            handle,
            notifications,
        }
    }

    async fn start() -> Harness {
        start_with(Arc::new(MemoryEngine::new()), OrchestratorConfig::default()).await
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Let every task run without crossing a throttle window
    async fn settle() {
        tokio::time::sleep(ms(1)).await;
    }

    async fn next_peer_update(h: &mut Harness) -> Vec<PeerSnapshot> {
        match h.notifications.recv().await {
            Some(Notification::PeerUpdate { peers }) => peers,
            other => panic!("expected peer-update, got {:?}", other),
        }
    }

    fn assert_quiet(h: &mut Harness) {
        assert_eq!(h.notifications.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_listening_wires_engine() {
        let engine = Arc::new(MemoryEngine::new());
        engine.discover(PeerInfo::new("phone-1", DeviceType::Mobile).with_name("Ana's phone"));

        let config = OrchestratorConfig {
            device_name: "Base camp".to_string(),
            ..OrchestratorConfig::default()
        };
        let h = start_with(engine, config).await;

        assert!(h.engine.is_listening());
        assert_eq!(h.engine.name().as_deref(), Some("Base camp"));

        let peers = h.handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name.as_deref(), Some("Ana's phone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_failure_is_returned() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_bind("address in use");
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = Orchestrator::new(engine.clone(), Arc::new(tx), OrchestratorConfig::default())
            .start_listening()
            .await;

        assert!(matches!(
            result,
            Err(OrchestratorError::Engine(EngineError::Bind(_)))
        ));
        assert!(!engine.is_listening());
        assert_eq!(engine.name(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_direct_target() {
        let mut h = start().await;
        let peer_id = PeerId::from("10.0.0.5:1234");

        h.handle
            .start_sync(SyncTarget::address("10.0.0.5", 1234))
            .await
            .unwrap();

        // Immediate refresh from start-sync
        let peers = next_peer_update(&mut h).await;
        assert_eq!(peers[0].id, peer_id);
        assert_eq!(peers[0].session.as_ref().unwrap().phase, SessionPhase::Started);

        let (target, options) = h.engine.replications().remove(0);
        assert_eq!(target, SyncTarget::address("10.0.0.5", 1234));
        assert_eq!(options.device_type, DeviceType::Mobile);

        let emitter = h.engine.session(&peer_id).unwrap();
        emitter.progress(50, 100);
        tokio::time::sleep(ms(5)).await;
        emitter.progress(100, 100);
        tokio::time::sleep(ms(5)).await;
        emitter.end(None);

        let peers = next_peer_update(&mut h).await;
        let session = peers[0].session.as_ref().unwrap();
        assert_eq!(session.phase, SessionPhase::InProgress);
        assert_eq!(session.progress, Some(ProgressSample::new(100, 100)));

        assert_eq!(
            h.notifications.recv().await,
            Some(Notification::SyncComplete {
                peer_id: peer_id.clone()
            })
        );

        let peers = next_peer_update(&mut h).await;
        assert_eq!(peers[0].id, peer_id);
        assert!(peers[0].session.is_none());

        tokio::time::sleep(ms(200)).await;
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_burst_delivers_last_sample_once() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        next_peer_update(&mut h).await;

        let emitter = h.engine.session(&peer_id).unwrap();
        for i in 1..=10 {
            emitter.progress(i, 10);
        }

        settle().await;
        assert_quiet(&mut h);

        tokio::time::sleep(ms(60)).await;
        let peers = next_peer_update(&mut h).await;
        assert_eq!(
            peers[0].session.as_ref().unwrap().progress,
            Some(ProgressSample::new(10, 10))
        );
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_throttle_independently() {
        let mut h = start().await;
        h.handle.start_sync(SyncTarget::peer("phone-a")).await.unwrap();
        h.handle.start_sync(SyncTarget::peer("phone-b")).await.unwrap();
        next_peer_update(&mut h).await;
        next_peer_update(&mut h).await;

        let a = h.engine.session(&PeerId::from("phone-a")).unwrap();
        let b = h.engine.session(&PeerId::from("phone-b")).unwrap();
        a.progress(1, 10);
        tokio::time::sleep(ms(20)).await;
        b.progress(1, 10);

        // A's window closes at 50 ms, B's at 70 ms
        tokio::time::sleep(ms(35)).await;
        next_peer_update(&mut h).await;
        assert_quiet(&mut h);

        tokio::time::sleep(ms(20)).await;
        next_peer_update(&mut h).await;
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_terminal_are_not_delivered() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        next_peer_update(&mut h).await;

        let emitter = h.engine.session(&peer_id).unwrap();
        emitter.end(None);
        settle().await;

        assert!(matches!(
            h.notifications.try_recv(),
            Ok(Notification::SyncComplete { .. })
        ));
        assert!(matches!(
            h.notifications.try_recv(),
            Ok(Notification::PeerUpdate { .. })
        ));

        // Listeners are gone
        assert!(!emitter.is_attached());
        assert!(!emitter.progress(1, 1));
        assert!(!emitter.end(None));

        tokio::time::sleep(ms(100)).await;
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_end_notifies_failure_once() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        next_peer_update(&mut h).await;

        let emitter = h.engine.session(&peer_id).unwrap();
        emitter.error("checksum mismatch");
        emitter.end(None);
        settle().await;

        assert_eq!(
            h.notifications.try_recv(),
            Ok(Notification::SyncFailed {
                peer_id: peer_id.clone(),
                error: "checksum mismatch".to_string(),
            })
        );
        let peers = next_peer_update(&mut h).await;
        assert!(peers[0].session.is_none());

        // Failed sessions lose their listeners too
        assert!(!emitter.is_attached());
        assert!(!emitter.progress(1, 1));

        tokio::time::sleep(ms(100)).await;
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_with_error_still_completes() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        next_peer_update(&mut h).await;

        h.engine
            .session(&peer_id)
            .unwrap()
            .end(Some("remote closed early".to_string()));

        assert_eq!(
            h.notifications.recv().await,
            Some(Notification::SyncComplete { peer_id })
        );
        next_peer_update(&mut h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_of_one_peer_does_not_affect_another() {
        let mut h = start().await;
        let a = PeerId::from("phone-a");
        let b = PeerId::from("phone-b");
        h.handle.start_sync(SyncTarget::peer("phone-a")).await.unwrap();
        h.handle.start_sync(SyncTarget::peer("phone-b")).await.unwrap();

        let emitter_a = h.engine.session(&a).unwrap();
        let emitter_b = h.engine.session(&b).unwrap();
        emitter_a.progress(10, 100);
        emitter_b.progress(10, 100);
        settle().await;

        emitter_a.error("connection reset");
        emitter_b.progress(100, 100);
        emitter_b.end(None);

        let mut failed = Vec::new();
        let mut completed = Vec::new();
        while completed.is_empty() {
            match h.notifications.recv().await.unwrap() {
                Notification::SyncFailed { peer_id, .. } => failed.push(peer_id),
                Notification::SyncComplete { peer_id } => completed.push(peer_id),
                _ => {}
            }
        }
        settle().await;
        while let Ok(notification) = h.notifications.try_recv() {
            match notification {
                Notification::SyncFailed { peer_id, .. } => failed.push(peer_id),
                Notification::SyncComplete { peer_id } => completed.push(peer_id),
                _ => {}
            }
        }

        assert_eq!(failed, vec![a]);
        assert_eq!(completed, vec![b]);
        assert!(h.handle.peers().await.unwrap().iter().all(|p| p.session.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_target_error_reaches_caller() {
        let mut h = start().await;

        let result = h.handle.start_sync(SyncTarget::default()).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::Engine(EngineError::InvalidTarget(_)))
        ));
        settle().await;
        assert_quiet(&mut h);
        assert!(h.handle.peers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sync_with_busy_peer_rejected() {
        let h = start().await;
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();

        let result = h.handle.start_sync(SyncTarget::peer("phone-1")).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::SessionActive(ref id)) if id.as_str() == "phone-1"
        ));
        assert_eq!(h.engine.replications().len(), 1);
    }

    /// Resolves every target to the same peer, like an engine matching an
    /// address against a peer it already discovered
    struct SinglePeerEngine {
        inner: MemoryEngine,
    }

    #[async_trait::async_trait]
    impl SyncEngine for SinglePeerEngine {
        async fn listen(&self) -> Result<(), EngineError> {
            self.inner.listen().await
        }

        fn set_name(&self, name: &str) {
            self.inner.set_name(name);
        }

        fn subscribe(&self) -> EngineEvents {
            self.inner.subscribe()
        }

        fn join(&self, key: &GroupKey) -> Result<(), EngineError> {
            self.inner.join(key)
        }

        fn leave(&self, key: &GroupKey) -> Result<(), EngineError> {
            self.inner.leave(key)
        }

        fn peers(&self) -> Vec<PeerInfo> {
            self.inner.peers()
        }

        fn replicate(
            &self,
            target: &SyncTarget,
            options: &ReplicateOptions,
        ) -> Result<ReplicationSession, EngineError> {
            let mut session = self.inner.replicate(target, options)?;
            session.peer_id = PeerId::from("phone-1");
            Ok(session)
        }

        async fn export_data(
            &self,
            destination: &Path,
            options: &ExportOptions,
        ) -> Result<(), EngineError> {
            self.inner.export_data(destination, options).await
        }

        async fn destroy(&self) -> Result<(), EngineError> {
            self.inner.destroy().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_resolving_to_busy_peer_drops_new_session() {
        let engine = Arc::new(SinglePeerEngine {
            inner: MemoryEngine::new(),
        });
        let (tx, _notifications) = mpsc::unbounded_channel();
        let handle = Orchestrator::new(engine.clone(), Arc::new(tx), OrchestratorConfig::default())
            .start_listening()
            .await
            .unwrap();

        handle
            .start_sync(SyncTarget::address("10.0.0.5", 1234))
            .await
            .unwrap();
        let result = handle.start_sync(SyncTarget::address("10.0.0.6", 1234)).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::SessionActive(ref id)) if id.as_str() == "phone-1"
        ));
        // The engine had already started it; dropping detaches the listeners
        let second = engine.inner.session(&PeerId::from("10.0.0.6:1234")).unwrap();
        assert!(!second.is_attached());
        let first = engine.inner.session(&PeerId::from("10.0.0.5:1234")).unwrap();
        assert!(first.is_attached());

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, PeerId::from("phone-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_after_previous_finished() {
        let h = start().await;
        let peer_id = PeerId::from("phone-1");
        let first = h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        h.engine.session(&peer_id).unwrap().end(None);
        settle().await;

        let second = h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_sync_is_watched() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.engine
            .discover(PeerInfo::new("phone-1", DeviceType::Mobile));

        let emitter = h.engine.announce_sync(&peer_id);
        settle().await;
        assert!(emitter.is_attached());

        emitter.progress(5, 5);
        emitter.end(None);

        let mut saw_complete = false;
        while let Some(notification) = h.notifications.recv().await {
            if notification == (Notification::SyncComplete { peer_id: peer_id.clone() }) {
                saw_complete = true;
                break;
            }
        }
        assert!(saw_complete);
        let peers = next_peer_update(&mut h).await;
        assert_eq!(peers[0].device_type, DeviceType::Mobile);
        assert!(peers[0].session.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discoveries_coalesce_into_one_update() {
        let mut h = start().await;
        for id in ["phone-1", "phone-2", "tablet-1"] {
            h.engine.discover(PeerInfo::new(id, DeviceType::Mobile));
        }

        settle().await;
        assert_quiet(&mut h);

        tokio::time::sleep(ms(60)).await;
        let ids: Vec<_> = next_peer_update(&mut h)
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                PeerId::from("phone-1"),
                PeerId::from("phone-2"),
                PeerId::from("tablet-1")
            ]
        );
        assert_quiet(&mut h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_down_during_sync_removed_when_session_ends() {
        let mut h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.engine.discover(PeerInfo::new("phone-1", DeviceType::Mobile));
        settle().await;
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();

        h.engine.disconnect(&peer_id);
        settle().await;
        let peers = h.handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(!peers[0].connected);

        h.engine.session(&peer_id).unwrap().end(None);
        settle().await;
        assert!(h.handle.peers().await.unwrap().is_empty());

        // Last notification is the refresh without the peer
        let mut last = None;
        while let Ok(notification) = h.notifications.try_recv() {
            last = Some(notification);
        }
        assert_eq!(last, Some(Notification::PeerUpdate { peers: Vec::new() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_failure_is_swallowed() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_join("swarm unreachable");
        let config = OrchestratorConfig {
            group_key: Some(GroupKey::new("c0ffee1234")),
            ..OrchestratorConfig::default()
        };
        let mut h = start_with(engine, config).await;

        h.handle.join_group().await.unwrap();
        settle().await;
        assert_quiet(&mut h);

        // Later commands still run
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        assert_eq!(h.engine.replications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_errors_reported_when_enabled() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_leave("not a member");
        let config = OrchestratorConfig {
            report_group_errors: true,
            ..OrchestratorConfig::default()
        };
        let mut h = start_with(engine, config).await;

        h.handle.leave_group_with(GroupKey::new("c0ffee1234")).await.unwrap();
        assert!(matches!(
            h.notifications.recv().await,
            Some(Notification::GroupMembershipFailed {
                action: GroupAction::Leave,
                ref error,
            }) if error.contains("not a member")
        ));

        // Missing key counts as a failure too
        h.handle.join_group().await.unwrap();
        assert!(matches!(
            h.notifications.recv().await,
            Some(Notification::GroupMembershipFailed {
                action: GroupAction::Join,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_and_leave_group() {
        let config = OrchestratorConfig {
            group_key: Some(GroupKey::new("c0ffee1234")),
            ..OrchestratorConfig::default()
        };
        let h = start_with(Arc::new(MemoryEngine::new()), config).await;

        h.handle.join_group().await.unwrap();
        assert_eq!(h.engine.joined_groups(), vec![GroupKey::new("c0ffee1234")]);

        h.handle.leave_group().await.unwrap();
        assert!(h.engine.joined_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_carries_group_key_and_device_type() {
        let config = OrchestratorConfig {
            group_key: Some(GroupKey::new("c0ffee1234")),
            device_type: DeviceType::Desktop,
            ..OrchestratorConfig::default()
        };
        let h = start_with(Arc::new(MemoryEngine::new()), config).await;

        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();

        let (_, options) = h.engine.replications().remove(0);
        assert_eq!(options.group_key, Some(GroupKey::new("c0ffee1234")));
        assert_eq!(options.device_type, DeviceType::Desktop);
    }

    #[tokio::test]
    async fn test_export_uses_configured_presets() {
        let temp_dir = TempDir::new().unwrap();
        let presets_path = temp_dir.path().join("presets.json");
        std::fs::write(&presets_path, r#"{"presets":{"tree":{"name":"Tree"}}}"#).unwrap();
        let config = OrchestratorConfig {
            presets_path: Some(presets_path),
            ..OrchestratorConfig::default()
        };
        let mut h = start_with(Arc::new(MemoryEngine::new()), config).await;

        let destination = temp_dir.path().join("observations.geojson");
        h.handle
            .export_data(ExportRequest {
                destination: destination.clone(),
                format: ExportFormat::Geojson,
                presets: None,
                request_id: "7".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            h.notifications.recv().await,
            Some(Notification::ExportFinished {
                request_id: "7".to_string(),
                error: None,
            })
        );
        assert!(destination.exists());
        let (_, options) = h.engine.exports().remove(0);
        assert_eq!(options.presets["presets"]["tree"]["name"], "Tree");
    }

    #[tokio::test]
    async fn test_export_errors_tagged_by_request() {
        let temp_dir = TempDir::new().unwrap();
        let mut h = start().await;

        for (id, format) in [("a", ExportFormat::Shapefile), ("b", ExportFormat::Geojson)] {
            h.handle
                .export_data(ExportRequest {
                    destination: temp_dir.path().join(format!("{}.out", id)),
                    format,
                    presets: Some(serde_json::json!({})),
                    request_id: id.to_string(),
                })
                .await
                .unwrap();
        }

        let mut results = HashMap::new();
        for _ in 0..2 {
            match h.notifications.recv().await {
                Some(Notification::ExportFinished { request_id, error }) => {
                    results.insert(request_id, error);
                }
                other => panic!("unexpected notification: {:?}", other),
            }
        }
        assert!(results["a"].as_deref().unwrap().contains("shapefile"));
        assert_eq!(results["b"], None);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_exports() {
        let temp_dir = TempDir::new().unwrap();
        let mut h = start().await;
        let destination = temp_dir.path().join("observations.geojson");

        h.handle
            .export_data(ExportRequest {
                destination: destination.clone(),
                format: ExportFormat::Geojson,
                presets: None,
                request_id: "42".to_string(),
            })
            .await
            .unwrap();
        h.handle.shutdown().await;

        // The result was delivered before the engine went away
        assert_eq!(
            h.notifications.try_recv(),
            Ok(Notification::ExportFinished {
                request_id: "42".to_string(),
                error: None,
            })
        );
        assert!(destination.exists());
        assert!(h.engine.is_destroyed());
    }

    #[tokio::test]
    async fn test_load_presets_defaults_to_empty_object() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("presets.json");
        std::fs::write(&broken, "not json").unwrap();

        assert_eq!(load_presets(None).await, serde_json::json!({}));
        assert_eq!(
            load_presets(Some(temp_dir.path().join("missing.json").as_path())).await,
            serde_json::json!({})
        );
        assert_eq!(load_presets(Some(broken.as_path())).await, serde_json::json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_sessions_returns_immediately() {
        let h = start().await;
        let started = Instant::now();

        let report = h.handle.shutdown().await;

        assert_eq!(report, ShutdownReport::default());
        assert!(started.elapsed() < ms(1));
        assert!(h.engine.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_stuck_session_waits_for_deadline() {
        let h = start().await;
        let peer_id = PeerId::from("10.0.0.5:1234");
        h.handle
            .start_sync(SyncTarget::address("10.0.0.5", 1234))
            .await
            .unwrap();
        h.engine.session(&peer_id).unwrap().progress(1, 100);
        settle().await;

        let started = Instant::now();
        let report = h.handle.shutdown().await;

        assert!(started.elapsed() >= Duration::from_secs(5 * 60));
        assert!(report.timed_out);
        assert_eq!(report.abandoned, vec![peer_id]);
        assert!(h.engine.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_session_listeners_detached() {
        let h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        let emitter = h.engine.session(&peer_id).unwrap();

        let report = h.handle.shutdown_within(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(report.abandoned, vec![peer_id]);
        assert!(!emitter.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_shutdown_timeout_still_destroys_engine() {
        let h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        let emitter = h.engine.session(&peer_id).unwrap();

        let shutdown = tokio::spawn({
            let handle = h.handle.clone();
            async move { handle.shutdown_within(Duration::from_secs(u64::MAX)).await }
        });
        settle().await;
        assert!(matches!(
            h.handle.peers().await,
            Err(OrchestratorError::ShuttingDown)
        ));

        emitter.end(None);
        let report = shutdown.await.unwrap();

        assert!(!report.timed_out);
        assert!(report.abandoned.is_empty());
        assert!(h.engine.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_progress_interval_does_not_stop_dispatch() {
        let config = OrchestratorConfig {
            progress_interval: Duration::MAX,
            ..OrchestratorConfig::default()
        };
        let h = start_with(Arc::new(MemoryEngine::new()), config).await;
        h.engine.discover(PeerInfo::new("phone-1", DeviceType::Mobile));
        settle().await;

        assert_eq!(h.handle.peers().await.unwrap().len(), 1);
        h.handle.shutdown().await;
        assert!(h.engine.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_session() {
        let h = start().await;
        let peer_id = PeerId::from("phone-1");
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();
        let emitter = h.engine.session(&peer_id).unwrap();

        let handle = h.handle.clone();
        let shutdown =
            tokio::spawn(async move { handle.shutdown_within(Duration::from_secs(60)).await });
        settle().await;

        // Commands are refused, events still flow
        assert!(matches!(
            h.handle.peers().await,
            Err(OrchestratorError::ShuttingDown)
        ));
        assert!(matches!(
            h.handle.start_sync(SyncTarget::peer("phone-2")).await,
            Err(OrchestratorError::ShuttingDown)
        ));
        assert!(!h.engine.is_destroyed());

        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(2)).await;
        emitter.progress(10, 10);
        emitter.end(None);

        let report = shutdown.await.unwrap();
        assert!(!report.timed_out);
        assert!(report.abandoned.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(h.engine.is_destroyed());

        // Dispatcher is gone
        assert!(matches!(
            h.handle.peers().await,
            Err(OrchestratorError::Stopped)
        ));
        assert_eq!(h.handle.shutdown().await, ShutdownReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_requests_share_report() {
        let h = start().await;
        h.handle.start_sync(SyncTarget::peer("phone-1")).await.unwrap();

        let first = tokio::spawn({
            let handle = h.handle.clone();
            async move { handle.shutdown_within(Duration::from_secs(10)).await }
        });
        let second = tokio::spawn({
            let handle = h.handle.clone();
            async move { handle.shutdown_within(Duration::from_secs(600)).await }
        });

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(first.timed_out);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_shuts_down() {
        let h = start().await;
        let engine = h.engine.clone();

        drop(h);
        settle().await;

        assert!(engine.is_destroyed());
    }
}
