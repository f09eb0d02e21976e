//! Notifications for the human-facing layer
//!
//! The orchestrator pushes [`Notification`]s into a [`NotificationSink`]. The
//! sink decides how they travel (UI bridge, log, JSON lines on stdout).

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::registry::PeerSnapshot;

/// Which group command failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupAction {
    Join,
    Leave,
}

impl fmt::Display for GroupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupAction::Join => f.write_str("join"),
            GroupAction::Leave => f.write_str("leave"),
        }
    }
}

/// Updates delivered to the notification sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// Current peer list; throttled while replications are running
    PeerUpdate { peers: Vec<PeerSnapshot> },

    /// A session reached `end`
    SyncComplete { peer_id: PeerId },

    /// A session aborted with an `error` event
    SyncFailed { peer_id: PeerId, error: String },

    /// An export request finished, correlated by the caller's id
    #[serde(rename = "export-data")]
    ExportFinished {
        request_id: String,
        error: Option<String>,
    },

    /// Join or leave failed; only sent when reporting is enabled
    GroupMembershipFailed { action: GroupAction, error: String },
}

/// Receiver of orchestrator notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl NotificationSink for mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        // Nobody listening anymore is not the orchestrator's problem
        let _ = self.send(notification);
    }
}
