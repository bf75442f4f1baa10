//! Run and node-run records.
//!
//! A [`WorkflowRun`] is created once per trigger; a [`NodeRun`] is created
//! for every scheduled invocation of a node, so a node downstream of a
//! fan-out gets one record per item. Status lives behind
//! [`StatusMachine`], and the lifecycle timestamps move with it.

use crate::definition::NodeId;
use crate::failure::FailureReport;
use crate::status::{ExecutionStatus, StatusMachine, Transition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// A record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run.
    pub id: WorkflowRunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    status: ExecutionStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run last entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Payload of the trigger event.
    pub trigger_payload: JsonValue,
    /// Summary of the failure, if the run failed.
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Creates a new run in `pending`.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, trigger_payload: JsonValue) -> Self {
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            trigger_payload,
            error: None,
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Requests a status change through the run state machine.
    pub fn transition_to(&mut self, to: ExecutionStatus) -> Transition {
        let outcome = StatusMachine::RUN.apply(&mut self.status, to);
        if outcome.is_applied() {
            stamp(&mut self.started_at, &mut self.completed_at, to);
            if to.is_active() {
                self.error = None;
            }
        }
        outcome
    }

    /// Marks the run failed with a summary message.
    pub fn fail(&mut self, error: impl Into<String>) -> Transition {
        let outcome = self.transition_to(ExecutionStatus::Failed);
        if outcome.is_applied() {
            self.error = Some(error.into());
        }
        outcome
    }

    /// Returns the duration of the run, if it has started.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

/// One invocation of a node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: NodeRunId,
    pub run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub node_type: String,
    status: ExecutionStatus,
    /// Input the scheduler handed to this invocation.
    pub input: JsonValue,
    /// Output on completion (a fallback object under the continue policy).
    pub output: Option<JsonValue>,
    /// Structured failure blob.
    pub error: Option<FailureReport>,
    /// Attempts made by the last execution, retries included.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    /// Creates a pending node run.
    #[must_use]
    pub fn new(
        run_id: WorkflowRunId,
        node_id: NodeId,
        node_type: impl Into<String>,
        input: JsonValue,
    ) -> Self {
        Self {
            id: NodeRunId::new(),
            run_id,
            node_id,
            node_type: node_type.into(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Requests a status change through the node-run state machine.
    pub fn transition_to(&mut self, to: ExecutionStatus) -> Transition {
        let outcome = StatusMachine::NODE_RUN.apply(&mut self.status, to);
        if outcome.is_applied() {
            stamp(&mut self.started_at, &mut self.completed_at, to);
        }
        outcome
    }

    /// Records a successful result.
    pub fn complete(&mut self, output: JsonValue, attempts: u32) -> Transition {
        let outcome = self.transition_to(ExecutionStatus::Completed);
        if outcome.is_applied() {
            self.output = Some(output);
            self.attempts = attempts;
        }
        outcome
    }

    /// Records a failure that the continue policy turned into a fallback output.
    pub fn complete_with_fallback(
        &mut self,
        fallback: JsonValue,
        report: FailureReport,
        attempts: u32,
    ) -> Transition {
        let outcome = self.complete(fallback, attempts);
        if outcome.is_applied() {
            self.error = Some(report);
        }
        outcome
    }

    /// Records a failure.
    pub fn fail(&mut self, report: FailureReport, attempts: u32) -> Transition {
        let outcome = self.transition_to(ExecutionStatus::Failed);
        if outcome.is_applied() {
            self.error = Some(report);
            self.attempts = attempts;
        }
        outcome
    }

    /// Re-opens a failed node run for another attempt.
    pub fn reopen(&mut self) -> Transition {
        let outcome = self.transition_to(ExecutionStatus::Pending);
        if outcome.is_applied() {
            self.output = None;
            self.error = None;
        }
        outcome
    }
}

fn stamp(
    started_at: &mut Option<DateTime<Utc>>,
    completed_at: &mut Option<DateTime<Utc>>,
    to: ExecutionStatus,
) {
    match to {
        ExecutionStatus::Pending => {
            *started_at = None;
            *completed_at = None;
        }
        ExecutionStatus::Running => {
            *started_at = Some(Utc::now());
            *completed_at = None;
        }
        ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
            *completed_at = Some(Utc::now());
        }
    }
}
