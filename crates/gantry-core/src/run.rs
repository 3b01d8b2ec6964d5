//! Run and instance state types.

use crate::ids::{InstanceId, JobId, RunId};
use crate::workflow::{Condition, ParameterSet};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What caused a run to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    Manual,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Submitted but not yet executing (validating, or queued behind a
    /// concurrency group holder).
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    /// All prerequisites terminal; waiting for a dispatch slot.
    Ready,
    Running,
    Success,
    Failure,
    TimedOut,
    Cancelled,
    Skipped,
}

impl InstanceStatus {
    /// Terminal status is sticky: the first terminal transition wins
    /// and later worker reports are discarded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Success
                | InstanceStatus::Failure
                | InstanceStatus::TimedOut
                | InstanceStatus::Cancelled
                | InstanceStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstanceStatus::Success)
    }
}

/// Rollup of all instance statuses belonging to one job template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl AggregateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AggregateStatus::Success
                | AggregateStatus::Failure
                | AggregateStatus::Cancelled
                | AggregateStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AggregateStatus::Success)
    }
}

/// One concrete execution unit: a job template bound to one parameter set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: InstanceId,
    pub parameters: ParameterSet,
    pub display_name: String,
    pub status: InstanceStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Why a run (or its instances) were cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    UserRequested,
    /// Preempted by a newer run in the same concurrency group.
    Superseded,
    Timeout,
}

/// Point-in-time snapshot of one job template within a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    pub job_id: JobId,
    pub condition: Condition,
    pub aggregate: AggregateStatus,
    pub instances: Vec<JobInstance>,
}

/// Point-in-time snapshot of a run, sufficient for a status page:
/// per-template aggregates plus every instance with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub cancel_kind: Option<CancelKind>,
    pub jobs: Vec<JobReport>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunReport {
    pub fn job(&self, id: &JobId) -> Option<&JobReport> {
        self.jobs.iter().find(|j| &j.job_id == id)
    }
}
