//! Lifecycle events emitted by the engine.

use crate::ids::{InstanceId, JobId, RunId};
use crate::run::{CancelKind, InstanceStatus, RunStatus, TriggerEvent};
use crate::workflow::ParameterSet;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events published over the engine's event bus.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunCancelled(RunCancelledPayload),
    MatrixExpanded(MatrixExpandedPayload),
    InstanceStarted(InstanceStartedPayload),
    InstanceCompleted(InstanceCompletedPayload),
}

impl Event {
    /// Routing subject for this event. Subscriptions match with `*`
    /// (one token) and `>` (remaining tokens) wildcards.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.queued.{}", p.run_id),
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}", p.run_id),
            Event::MatrixExpanded(p) => format!("run.{}.matrix.{}", p.run_id, p.job_id),
            Event::InstanceStarted(p) => {
                format!("run.{}.instance.{}.started", p.run_id, p.instance_id)
            }
            Event::InstanceCompleted(p) => {
                format!("run.{}.instance.{}.completed", p.run_id, p.instance_id)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: TriggerEvent,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub kind: CancelKind,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixExpandedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub instance_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstanceStartedPayload {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub parameters: ParameterSet,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstanceCompletedPayload {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub finished_at: DateTime<Utc>,
}
