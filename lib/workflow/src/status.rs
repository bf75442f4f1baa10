//! Execution status state machine.
//!
//! Runs and node runs share one transition table, but each entity kind gets
//! its own [`StatusMachine`] so log lines say which kind of record refused a
//! transition. Every status write goes through [`StatusMachine::apply`];
//! records keep their status private.
//!
//! A transition outside the table is ignored rather than raised. Duplicate
//! or late completion signals are expected under at-least-once dispatch, and
//! dropping them keeps terminal records intact.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a workflow run or a node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet dispatched.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully. Accepts no further transitions.
    Completed,
    /// Finished with an error; may be re-opened by a manual retry.
    Failed,
    /// Stopped by request; may be restarted.
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses that still count as in flight.
    pub const ACTIVE: [Self; 2] = [Self::Pending, Self::Running];

    /// Returns true once no more work will happen without outside action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the record is pending or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns the snake_case name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from this one.
    #[must_use]
    pub fn allowed_targets(&self) -> &'static [ExecutionStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed => &[],
            Self::Failed => &[Self::Pending, Self::Running],
            Self::Cancelled => &[Self::Pending],
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed.
    Applied {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    /// The record was already in the requested status.
    Unchanged,
    /// The table does not allow this change; the status was left alone.
    Rejected {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

impl Transition {
    /// Returns true if the status changed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Transition gate for one kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMachine {
    entity: &'static str,
}

impl StatusMachine {
    /// Gate for workflow runs.
    pub const RUN: Self = Self::new("workflow run");
    /// Gate for node runs.
    pub const NODE_RUN: Self = Self::new("node run");

    /// Creates a gate that names `entity` in its log lines.
    #[must_use]
    pub const fn new(entity: &'static str) -> Self {
        Self { entity }
    }

    /// Returns true if the table allows `from -> to`.
    #[must_use]
    pub fn can_transition(&self, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        from.allowed_targets().contains(&to)
    }

    /// Moves `status` to `to` if allowed.
    pub fn apply(&self, status: &mut ExecutionStatus, to: ExecutionStatus) -> Transition {
        let from = *status;
        if from == to {
            return Transition::Unchanged;
        }

        if !self.can_transition(from, to) {
            tracing::warn!(
                entity = self.entity,
                from = %from,
                to = %to,
                "ignoring invalid status transition"
            );
            return Transition::Rejected { from, to };
        }

        *status = to;
        Transition::Applied { from, to }
    }
}
