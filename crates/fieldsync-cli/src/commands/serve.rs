//! Serve command
//!
//! Runs the orchestrator over the in-memory engine and exposes it as a
//! line protocol: one JSON command per line on stdin, one JSON object per
//! line on stdout (notifications, replies, and a final shutdown report).
//!
//! ```text
//! {"command":"start-sync","target":{"host":"10.0.0.5","port":1234}}
//! {"command":"join-group"}
//! {"command":"export-data","destination":"out.geojson","format":"geojson","request_id":"1"}
//! {"command":"shutdown","timeout_secs":30}
//! ```
//!
//! EOF behaves like `shutdown` with the configured deadline.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use fieldsync_core::config::MAX_SHUTDOWN_TIMEOUT_SECS;
use fieldsync_core::{
    Config, DeviceType, ExportRequest, GroupKey, MemoryEngine, Orchestrator, OrchestratorConfig,
    OrchestratorHandle, PeerId, PeerInfo, ShutdownReport, Simulation, SyncTarget,
};

/// Options for `fieldsync serve`
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub simulation: Simulation,
    /// Join the swarm right after listening
    pub join: bool,
}

/// One line of input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    StartSync {
        #[serde(default)]
        target: SyncTarget,
    },
    JoinGroup {
        #[serde(default)]
        group_key: Option<String>,
    },
    LeaveGroup {
        #[serde(default)]
        group_key: Option<String>,
    },
    ExportData(ExportRequest),
    Peers,
    Shutdown {
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Simulate a peer appearing on the network
    Discover {
        peer_id: PeerId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        device_type: DeviceType,
    },
    /// Simulate a peer dropping off
    Disconnect { peer_id: PeerId },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::StartSync { .. } => "start-sync",
            Request::JoinGroup { .. } => "join-group",
            Request::LeaveGroup { .. } => "leave-group",
            Request::ExportData(_) => "export-data",
            Request::Peers => "peers",
            Request::Shutdown { .. } => "shutdown",
            Request::Discover { .. } => "discover",
            Request::Disconnect { .. } => "disconnect",
        }
    }
}

/// What the input loop does after a line
#[derive(Debug)]
enum Step {
    Reply(Value),
    Shutdown(Option<Duration>),
}

/// Run `serve` on stdin/stdout
pub async fn run(config: &Config, options: ServeOptions) -> Result<()> {
    let engine = Arc::new(MemoryEngine::with_simulation(options.simulation));
    let input = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();

    let report = serve(
        engine,
        OrchestratorConfig::from(config),
        options.join,
        input,
        &mut stdout,
    )
    .await?;

    info!(
        "Stopped ({} abandoned replications)",
        report.abandoned.len()
    );
    Ok(())
}

/// Drive an orchestrator from `input` until shutdown or EOF
pub async fn serve<R, W>(
    engine: Arc<MemoryEngine>,
    config: OrchestratorConfig,
    join: bool,
    input: R,
    out: &mut W,
) -> Result<ShutdownReport>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let (tx, mut notifications) = mpsc::unbounded_channel();
    let handle = Orchestrator::new(engine.clone(), Arc::new(tx), config)
        .start_listening()
        .await
        .context("Failed to start sync listener")?;

    if join {
        handle.join_group().await?;
    }

    let mut lines = input.lines();
    let timeout = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read command")? else {
                    debug!("Input closed");
                    break None;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match execute_line(&handle, &engine, &line).await {
                    Step::Reply(reply) => write_line(out, &reply)?,
                    Step::Shutdown(timeout) => break timeout,
                }
            }
            Some(notification) = notifications.recv() => write_line(out, &notification)?,
        }
    };

    // Keep reporting while the drain runs
    let report = {
        let shutdown = async {
            match timeout {
                Some(timeout) => handle.shutdown_within(timeout).await,
                None => handle.shutdown().await,
            }
        };
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                report = &mut shutdown => break report,
                Some(notification) = notifications.recv() => write_line(out, &notification)?,
            }
        }
    };

    while let Ok(notification) = notifications.try_recv() {
        write_line(out, &notification)?;
    }
    write_line(
        out,
        &json!({
            "type": "shutdown",
            "abandoned": report.abandoned,
            "timed_out": report.timed_out,
        }),
    )?;

    Ok(report)
}

async fn execute_line(handle: &OrchestratorHandle, engine: &MemoryEngine, line: &str) -> Step {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => execute(handle, engine, request).await,
        Err(e) => Step::Reply(json!({
            "type": "error",
            "error": format!("Invalid command: {}", e),
        })),
    }
}

async fn execute(handle: &OrchestratorHandle, engine: &MemoryEngine, request: Request) -> Step {
    let command = request.name();
    debug!("Command {}", command);

    let result: Result<Value, String> = match request {
        Request::StartSync { target } => handle
            .start_sync(target)
            .await
            .map(|session_id| json!({ "session_id": session_id }))
            .map_err(|e| e.to_string()),
        Request::JoinGroup { group_key } => {
            let result = match group_key {
                Some(key) => handle.join_group_with(GroupKey::new(key)).await,
                None => handle.join_group().await,
            };
            result.map(|()| json!({})).map_err(|e| e.to_string())
        }
        Request::LeaveGroup { group_key } => {
            let result = match group_key {
                Some(key) => handle.leave_group_with(GroupKey::new(key)).await,
                None => handle.leave_group().await,
            };
            result.map(|()| json!({})).map_err(|e| e.to_string())
        }
        Request::ExportData(export) => {
            let request_id = export.request_id.clone();
            handle
                .export_data(export)
                .await
                .map(|()| json!({ "request_id": request_id }))
                .map_err(|e| e.to_string())
        }
        Request::Peers => handle
            .peers()
            .await
            .map(|peers| json!({ "peers": peers }))
            .map_err(|e| e.to_string()),
        Request::Shutdown { timeout_secs } => {
            let timeout = timeout_secs.map(|secs| secs.min(MAX_SHUTDOWN_TIMEOUT_SECS));
            return Step::Shutdown(timeout.map(Duration::from_secs));
        }
        Request::Discover {
            peer_id,
            name,
            device_type,
        } => {
            let mut peer = PeerInfo::new(peer_id, device_type);
            peer.name = name;
            engine.discover(peer);
            Ok(json!({}))
        }
        Request::Disconnect { peer_id } => {
            engine.disconnect(&peer_id);
            Ok(json!({}))
        }
    };

    Step::Reply(reply(command, result))
}

fn reply(command: &str, result: Result<Value, String>) -> Value {
    match result {
        Ok(mut body) => {
            if let Value::Object(ref mut fields) = body {
                fields.insert("type".to_string(), json!("reply"));
                fields.insert("command".to_string(), json!(command));
            }
            body
        }
        Err(error) => json!({
            "type": "error",
            "command": command,
            "error": error,
        }),
    }
}

fn write_line<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to serialize output")?;
    writeln!(out, "{}", line).context("Failed to write output")?;
    out.flush().context("Failed to flush output")?;
    Ok(())
}
