use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a node.
///
/// ```text
/// Created -> Starting -> Running -> Stopping -> Stopped
///               |                                 ^
///               `------- (OnStart failed) --------'
/// ```
/// A `Stopped` node may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Constructed, never started.
    Created,
    /// `on_start` is running.
    Starting,
    /// Run loop spawned.
    Running,
    /// Cancellation sent, waiting for the loop and `on_stop`.
    Stopping,
    /// Torn down.
    Stopped,
}

impl NodeState {
    /// Whether `start` may begin a transition from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a managed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node name.
    pub name: String,
    /// Current state.
    pub state: NodeState,
    /// When the node last reached `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Whether the run loop has returned since the last start.
    pub run_finished: bool,
    /// Most recent hook or run loop failure.
    pub last_error: Option<String>,
}
