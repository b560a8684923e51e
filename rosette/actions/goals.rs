use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier assigned to a goal at submission. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalId(pub Uuid);

impl GoalId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a goal.
///
/// ```text
/// Pending -> Active -> Succeeded
///    |         |-> Aborted
///    |         `-> Preempted
///    `-> Recalled
/// (refused by the handler) -> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Accepted, waiting for an execution slot.
    Pending,
    /// Handler is running.
    Active,
    /// Handler returned a result.
    Succeeded,
    /// Handler failed or panicked.
    Aborted,
    /// Cancelled while the handler was running.
    Preempted,
    /// Refused by the handler before dispatch.
    Rejected,
    /// Cancelled before the handler was dispatched.
    Recalled,
}

impl GoalStatus {
    /// Pending or Active.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Any state a goal never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Lower-case label used in diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Succeeded => "succeeded",
            Self::Aborted => "aborted",
            Self::Preempted => "preempted",
            Self::Rejected => "rejected",
            Self::Recalled => "recalled",
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of a tracked goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalInfo {
    /// Goal identifier.
    pub goal_id: GoalId,
    /// Action the goal was sent to.
    pub action: String,
    /// Current status.
    pub status: GoalStatus,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

/// Terminal result delivered through a [`crate::executor::GoalHandle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalOutcome {
    /// Goal identifier.
    pub goal_id: GoalId,
    /// Action the goal was sent to.
    pub action: String,
    /// Terminal status.
    pub status: GoalStatus,
    /// Value returned by the handler, when it returned one.
    pub result: Option<serde_json::Value>,
    /// Failure or cancellation detail.
    pub message: Option<String>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

impl GoalOutcome {
    /// Whether the handler succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == GoalStatus::Succeeded
    }
}
