//! Status rollup: instance outcomes to per-job and per-run status.
//!
//! Pure functions of the current instance statuses; the engine calls
//! them synchronously on every terminal transition, so repeated
//! evaluation after the same transition yields the same snapshot.

use gantry_core::run::{AggregateStatus, InstanceStatus, JobInstance, RunStatus};
use gantry_core::workflow::Condition;

/// Roll one template's instance statuses up to an aggregate.
///
/// Failure dominates (any `failure`/`timed_out`), then cancellation,
/// then skipped (only when nothing actually ran); a template is
/// `success` once every instance that ran succeeded.
pub fn job_aggregate(instances: &[JobInstance]) -> AggregateStatus {
    if instances.is_empty() {
        return AggregateStatus::Skipped;
    }

    let mut any_running = false;
    let mut any_nonterminal = false;
    let mut any_failure = false;
    let mut any_cancelled = false;
    let mut any_success = false;

    for instance in instances {
        match instance.status {
            InstanceStatus::Failure | InstanceStatus::TimedOut => any_failure = true,
            InstanceStatus::Cancelled => any_cancelled = true,
            InstanceStatus::Success => any_success = true,
            InstanceStatus::Skipped => {}
            InstanceStatus::Running | InstanceStatus::Ready => {
                any_running = true;
                any_nonterminal = true;
            }
            InstanceStatus::Pending => any_nonterminal = true,
        }
    }

    if any_nonterminal {
        if any_running {
            AggregateStatus::Running
        } else {
            AggregateStatus::Pending
        }
    } else if any_failure {
        AggregateStatus::Failure
    } else if any_cancelled {
        AggregateStatus::Cancelled
    } else if any_success {
        AggregateStatus::Success
    } else {
        AggregateStatus::Skipped
    }
}

/// Whether a job gated on its prerequisites may run or must skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Some prerequisite is still in flight.
    Wait,
    /// All prerequisites terminal and the condition admits execution.
    Run,
    /// All prerequisites terminal but an `on_success` condition saw a
    /// non-success aggregate.
    Skip,
}

/// Evaluate a job's condition against its prerequisites' aggregates.
pub fn evaluate_gate(condition: Condition, prerequisites: &[AggregateStatus]) -> Gate {
    if prerequisites.iter().any(|agg| !agg.is_terminal()) {
        return Gate::Wait;
    }

    match condition {
        Condition::Always => Gate::Run,
        Condition::OnSuccess => {
            if prerequisites.iter().all(|agg| agg.is_success()) {
                Gate::Run
            } else {
                Gate::Skip
            }
        }
    }
}

/// Final status of a run whose templates have all reached a terminal
/// aggregate. A run is a failure when any `on_success` template holds a
/// non-success, non-skipped terminal aggregate; skips never fail a run.
pub fn final_run_status(jobs: &[(Condition, AggregateStatus)]) -> RunStatus {
    let failed = jobs.iter().any(|(condition, agg)| {
        *condition == Condition::OnSuccess
            && matches!(agg, AggregateStatus::Failure | AggregateStatus::Cancelled)
    });
    if failed {
        RunStatus::Failure
    } else {
        RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::InstanceId;
    use gantry_core::workflow::ParameterSet;

    fn instance(status: InstanceStatus) -> JobInstance {
        JobInstance {
            id: InstanceId::new("j".into(), 0),
            parameters: ParameterSet::new(),
            display_name: "j".to_string(),
            status,
            started_at: None,
            finished_at: None,
        }
    }

    fn instances(statuses: &[InstanceStatus]) -> Vec<JobInstance> {
        statuses.iter().copied().map(instance).collect()
    }

    #[test]
    fn test_all_success() {
        let set = instances(&[InstanceStatus::Success, InstanceStatus::Success]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Success);
    }

    #[test]
    fn test_failure_dominates_cancelled() {
        let set = instances(&[
            InstanceStatus::Success,
            InstanceStatus::Cancelled,
            InstanceStatus::TimedOut,
        ]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Failure);
    }

    #[test]
    fn test_timed_out_is_failure() {
        let set = instances(&[InstanceStatus::Success, InstanceStatus::TimedOut]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Failure);
    }

    #[test]
    fn test_cancelled_without_failure() {
        let set = instances(&[InstanceStatus::Success, InstanceStatus::Cancelled]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Cancelled);
    }

    #[test]
    fn test_no_instances_is_skipped() {
        assert_eq!(job_aggregate(&[]), AggregateStatus::Skipped);
    }

    #[test]
    fn test_all_skipped() {
        let set = instances(&[InstanceStatus::Skipped, InstanceStatus::Skipped]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Skipped);
    }

    #[test]
    fn test_in_flight() {
        let set = instances(&[InstanceStatus::Success, InstanceStatus::Running]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Running);
        let set = instances(&[InstanceStatus::Pending, InstanceStatus::Pending]);
        assert_eq!(job_aggregate(&set), AggregateStatus::Pending);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let set = instances(&[InstanceStatus::Failure, InstanceStatus::Success]);
        let first = job_aggregate(&set);
        assert_eq!(job_aggregate(&set), first);
        assert_eq!(job_aggregate(&set), first);
    }

    #[test]
    fn test_gate_waits_for_terminal_prerequisites() {
        assert_eq!(
            evaluate_gate(
                Condition::OnSuccess,
                &[AggregateStatus::Success, AggregateStatus::Running]
            ),
            Gate::Wait
        );
        assert_eq!(
            evaluate_gate(
                Condition::Always,
                &[AggregateStatus::Failure, AggregateStatus::Pending]
            ),
            Gate::Wait
        );
    }

    #[test]
    fn test_on_success_skips_on_upstream_failure() {
        assert_eq!(
            evaluate_gate(
                Condition::OnSuccess,
                &[AggregateStatus::Success, AggregateStatus::Failure]
            ),
            Gate::Skip
        );
        assert_eq!(
            evaluate_gate(Condition::OnSuccess, &[AggregateStatus::Skipped]),
            Gate::Skip
        );
    }

    #[test]
    fn test_always_runs_regardless() {
        assert_eq!(
            evaluate_gate(
                Condition::Always,
                &[AggregateStatus::Failure, AggregateStatus::Cancelled]
            ),
            Gate::Run
        );
    }

    #[test]
    fn test_root_job_gate() {
        assert_eq!(evaluate_gate(Condition::OnSuccess, &[]), Gate::Run);
    }

    #[test]
    fn test_final_run_status() {
        assert_eq!(
            final_run_status(&[
                (Condition::OnSuccess, AggregateStatus::Success),
                (Condition::OnSuccess, AggregateStatus::Skipped),
            ]),
            RunStatus::Success
        );
        assert_eq!(
            final_run_status(&[
                (Condition::OnSuccess, AggregateStatus::Failure),
                (Condition::Always, AggregateStatus::Success),
            ]),
            RunStatus::Failure
        );
    }
}
