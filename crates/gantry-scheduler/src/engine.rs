//! The scheduler/executor: drives instance execution to completion.
//!
//! Each submitted run gets one driver task that owns all of the run's
//! mutable state. Worker outcomes, timeouts, and cancellation signals
//! arrive as messages on the driver's channels, so every status
//! transition, readiness re-evaluation, and aggregation is applied from
//! a single task; two instances finishing concurrently cannot race on
//! the shared rollup. Callers observe progress through `watch`
//! snapshots, which also back `await_terminal`.

use crate::aggregate::{self, Gate};
use crate::concurrency::{Admission, CancelHandle, GroupRegistry};
use crate::graph::GraphBuilder;
use crate::matrix::MatrixExpander;

use chrono::{DateTime, Utc};
use gantry_core::events::{
    Event, InstanceCompletedPayload, InstanceStartedPayload, MatrixExpandedPayload,
    RunCancelledPayload, RunCompletedPayload, RunQueuedPayload, RunStartedPayload,
};
use gantry_core::ids::{InstanceId, JobId, RunId};
use gantry_core::ports::{EventBus, Outcome, OutcomeStatus, WorkItem, Worker};
use gantry_core::run::{
    AggregateStatus, CancelKind, InstanceStatus, JobInstance, JobReport, RunReport, RunStatus,
    TriggerEvent,
};
use gantry_core::workflow::{Condition, WorkflowDefinition};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

/// Bounded backoff applied when the worker transport is unavailable.
/// Timeouts are never retried; retry after a timeout is a caller
/// decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// The workflow engine: submission API plus the per-run drivers it
/// spawns.
pub struct Engine {
    worker: Arc<dyn Worker>,
    event_bus: Arc<dyn EventBus>,
    groups: Arc<GroupRegistry>,
    runs: RwLock<HashMap<RunId, RunEntry>>,
    retry: RetryPolicy,
}

struct RunEntry {
    report: watch::Receiver<RunReport>,
    cancel: CancelHandle,
}

impl Engine {
    pub fn new(worker: Arc<dyn Worker>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            worker,
            event_bus,
            groups: Arc::new(GroupRegistry::new()),
            runs: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate, expand, and start (or queue) a run of `definition`.
    ///
    /// Structural errors surface here and the run never starts. On
    /// success the run id is returned immediately; execution proceeds
    /// in the background.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        trigger: TriggerEvent,
        scoping_key: Option<&str>,
    ) -> Result<RunId> {
        GraphBuilder::new()
            .build(&definition)
            .map_err(|e| Error::InvalidWorkflow(e.to_string()))?;

        let run_id = RunId::new();
        let expander = MatrixExpander::new();
        let index: HashMap<JobId, usize> = definition
            .jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.clone(), i))
            .collect();

        let jobs: Vec<JobRun> = definition
            .jobs
            .iter()
            .map(|template| {
                let expansion = expander.expand(template);
                JobRun {
                    id: template.id.clone(),
                    condition: template.condition,
                    timeout_ms: template.timeout_ms,
                    fail_fast: expansion.fail_fast,
                    max_parallel: expansion.max_parallel,
                    has_matrix: template.matrix.is_some(),
                    deps: template.depends_on.iter().map(|d| index[d]).collect(),
                    instances: expansion.instances,
                    running: 0,
                }
            })
            .collect();

        let group = definition.concurrency.as_ref().map(|c| {
            let key = match scoping_key {
                Some(scope) => format!("{}:{}", c.group, scope),
                None => c.group.clone(),
            };
            (key, c.cancel_in_progress)
        });

        let state = RunState {
            run_id,
            workflow: definition.name.clone(),
            trigger,
            status: RunStatus::Pending,
            cancel_kind: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            jobs,
        };

        info!(run_id = %run_id, workflow = %state.workflow, "Run submitted");

        let (report_tx, report_rx) = watch::channel(state.snapshot());
        let (cancel_handle, cancel_rx) = CancelHandle::channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        self.runs.write().await.insert(
            run_id,
            RunEntry {
                report: report_rx,
                cancel: cancel_handle.clone(),
            },
        );

        let queued_event = Event::RunQueued(RunQueuedPayload {
            run_id,
            workflow: state.workflow.clone(),
            trigger,
            queued_at: state.queued_at,
        });
        if let Err(err) = self.event_bus.publish(queued_event).await {
            warn!(run_id = %run_id, error = %err, "Failed to publish event");
        }

        let driver = Driver {
            state,
            worker: self.worker.clone(),
            bus: self.event_bus.clone(),
            groups: self.groups.clone(),
            group,
            report: report_tx,
            outcome_tx,
            outcome_rx,
            cancel_rx,
            cancel_handle,
            retry: self.retry,
        };
        tokio::spawn(driver.run());

        Ok(run_id)
    }

    /// Snapshot of a run's current status; available mid-run.
    pub async fn get_status(&self, run_id: RunId) -> Result<RunReport> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        Ok(entry.report.borrow().clone())
    }

    /// Suspend until the run reaches a terminal status.
    pub async fn await_terminal(&self, run_id: RunId) -> Result<RunReport> {
        let mut rx = {
            let runs = self.runs.read().await;
            runs.get(&run_id)
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?
                .report
                .clone()
        };

        loop {
            {
                let report = rx.borrow_and_update();
                if report.status.is_terminal() {
                    return Ok(report.clone());
                }
            }
            if rx.changed().await.is_err() {
                // Driver gone; the last snapshot is final.
                return Ok(rx.borrow().clone());
            }
        }
    }

    /// Remove terminal runs from the in-memory index, returning their
    /// final reports for archival. Mid-flight runs are untouched; an
    /// embedder that stores reports elsewhere calls this to keep the
    /// index bounded.
    pub async fn prune_terminal(&self) -> Vec<RunReport> {
        let mut runs = self.runs.write().await;
        let terminal: Vec<RunId> = runs
            .iter()
            .filter(|(_, entry)| entry.report.borrow().status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        terminal
            .into_iter()
            .filter_map(|id| runs.remove(&id))
            .map(|entry| entry.report.borrow().clone())
            .collect()
    }

    /// Request cancellation of a run. Best-effort: a run that already
    /// reached a terminal status is unaffected.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        entry.cancel.signal(CancelKind::UserRequested);
        Ok(())
    }
}

/// Per-template runtime state.
struct JobRun {
    id: JobId,
    condition: Condition,
    timeout_ms: u64,
    fail_fast: bool,
    max_parallel: Option<u32>,
    has_matrix: bool,
    /// Indices of prerequisite templates.
    deps: Vec<usize>,
    instances: Vec<JobInstance>,
    /// Currently running instance count, bounded by `max_parallel`.
    running: u32,
}

/// All mutable state of one run. Owned exclusively by the driver task.
struct RunState {
    run_id: RunId,
    workflow: String,
    trigger: TriggerEvent,
    status: RunStatus,
    cancel_kind: Option<CancelKind>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    jobs: Vec<JobRun>,
}

impl RunState {
    fn aggregates(&self) -> Vec<AggregateStatus> {
        self.jobs
            .iter()
            .map(|job| aggregate::job_aggregate(&job.instances))
            .collect()
    }

    fn snapshot(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            workflow: self.workflow.clone(),
            trigger: self.trigger,
            status: self.status,
            cancel_kind: self.cancel_kind,
            jobs: self
                .jobs
                .iter()
                .map(|job| JobReport {
                    job_id: job.id.clone(),
                    condition: job.condition,
                    aggregate: aggregate::job_aggregate(&job.instances),
                    instances: job.instances.clone(),
                })
                .collect(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.started_at.zip(self.completed_at).map(|(start, end)| {
                (end - start).num_milliseconds().max(0) as u64
            }),
        }
    }
}

/// Terminal outcome delivered by an instance's worker task.
struct InstanceMsg {
    job: usize,
    instance: usize,
    status: InstanceStatus,
}

enum Wake {
    Cancel(Option<CancelKind>),
    Outcome(Option<InstanceMsg>),
}

struct Driver {
    state: RunState,
    worker: Arc<dyn Worker>,
    bus: Arc<dyn EventBus>,
    groups: Arc<GroupRegistry>,
    group: Option<(String, bool)>,
    report: watch::Sender<RunReport>,
    outcome_tx: mpsc::UnboundedSender<InstanceMsg>,
    outcome_rx: mpsc::UnboundedReceiver<InstanceMsg>,
    cancel_rx: mpsc::UnboundedReceiver<CancelKind>,
    cancel_handle: CancelHandle,
    retry: RetryPolicy,
}

impl Driver {
    async fn run(mut self) {
        if let Some((key, cancel_in_progress)) = self.group.clone() {
            match self.groups.admit(
                &key,
                cancel_in_progress,
                self.state.run_id,
                self.cancel_handle.clone(),
            ) {
                Admission::Active => {}
                Admission::Queued(permit) => {
                    // A dropped permit means the group entry went away
                    // underneath us; treat it like preemption.
                    let cancelled = tokio::select! {
                        result = permit => match result {
                            Ok(()) => None,
                            Err(_) => Some(CancelKind::Superseded),
                        },
                        kind = self.cancel_rx.recv() => {
                            Some(kind.unwrap_or(CancelKind::UserRequested))
                        }
                    };
                    if let Some(kind) = cancelled {
                        self.cancel_run(kind).await;
                        self.finish();
                        return;
                    }
                }
            }
        }

        self.start().await;

        while !self.state.status.is_terminal() {
            let wake = tokio::select! {
                kind = self.cancel_rx.recv() => Wake::Cancel(kind),
                msg = self.outcome_rx.recv() => Wake::Outcome(msg),
            };
            match wake {
                Wake::Cancel(Some(kind)) => self.cancel_run(kind).await,
                Wake::Outcome(Some(msg)) => self.apply_outcome(msg).await,
                // Both channels are kept alive by the engine and the
                // driver itself; a closed channel means shutdown.
                Wake::Cancel(None) | Wake::Outcome(None) => break,
            }
        }

        self.finish();
    }

    async fn start(&mut self) {
        self.state.status = RunStatus::Running;
        self.state.started_at = Some(Utc::now());
        info!(run_id = %self.state.run_id, workflow = %self.state.workflow, "Run started");

        self.publish(Event::RunStarted(RunStartedPayload {
            run_id: self.state.run_id,
            started_at: self.state.started_at.unwrap_or_else(Utc::now),
        }))
        .await;

        let expansions: Vec<Event> = self
            .state
            .jobs
            .iter()
            .filter(|job| job.has_matrix)
            .map(|job| {
                Event::MatrixExpanded(MatrixExpandedPayload {
                    run_id: self.state.run_id,
                    job_id: job.id.clone(),
                    instance_count: job.instances.len(),
                })
            })
            .collect();
        for event in expansions {
            self.publish(event).await;
        }

        self.step().await;
    }

    /// One scheduling pass: re-evaluate readiness, dispatch within
    /// parallelism caps, roll up completion. Idempotent; runs after
    /// every state change.
    async fn step(&mut self) {
        self.evaluate().await;
        self.dispatch().await;
        self.check_complete().await;
        self.push_report();
    }

    /// Readiness and skip evaluation, iterated to a fixpoint so skips
    /// cascade through chains of `on_success` jobs in one pass.
    async fn evaluate(&mut self) {
        let now = Utc::now();
        let mut skipped: Vec<InstanceId> = Vec::new();

        loop {
            let mut changed = false;
            let aggregates = self.state.aggregates();

            for j in 0..self.state.jobs.len() {
                let prereqs: Vec<AggregateStatus> = self.state.jobs[j]
                    .deps
                    .iter()
                    .map(|&d| aggregates[d])
                    .collect();
                let gate = aggregate::evaluate_gate(self.state.jobs[j].condition, &prereqs);
                let job = &mut self.state.jobs[j];

                match gate {
                    Gate::Wait => {}
                    Gate::Run => {
                        for instance in &mut job.instances {
                            if instance.status == InstanceStatus::Pending {
                                instance.status = InstanceStatus::Ready;
                                changed = true;
                            }
                        }
                    }
                    Gate::Skip => {
                        for instance in &mut job.instances {
                            if instance.status == InstanceStatus::Pending {
                                instance.status = InstanceStatus::Skipped;
                                instance.finished_at = Some(now);
                                skipped.push(instance.id.clone());
                                changed = true;
                            }
                        }
                    }
                }
            }

            if !changed {
                break;
            }
        }

        for instance_id in skipped {
            debug!(run_id = %self.state.run_id, instance = %instance_id, "Instance skipped");
            self.publish(Event::InstanceCompleted(InstanceCompletedPayload {
                run_id: self.state.run_id,
                instance_id,
                status: InstanceStatus::Skipped,
                finished_at: now,
            }))
            .await;
        }
    }

    /// Hand ready instances to the worker, in expansion order, up to
    /// each template's parallelism cap.
    async fn dispatch(&mut self) {
        let now = Utc::now();
        let run_id = self.state.run_id;
        let mut started: Vec<(usize, usize, WorkItem, u64)> = Vec::new();

        for (j, job) in self.state.jobs.iter_mut().enumerate() {
            let cap = job.max_parallel.unwrap_or(u32::MAX);
            let mut slots = cap.saturating_sub(job.running);
            for (i, instance) in job.instances.iter_mut().enumerate() {
                if slots == 0 {
                    break;
                }
                if instance.status != InstanceStatus::Ready {
                    continue;
                }
                instance.status = InstanceStatus::Running;
                instance.started_at = Some(now);
                job.running += 1;
                slots -= 1;

                let deadline = now
                    .checked_add_signed(chrono::Duration::milliseconds(
                        i64::try_from(job.timeout_ms).unwrap_or(i64::MAX),
                    ))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let work = WorkItem {
                    run_id,
                    instance_id: instance.id.clone(),
                    parameters: instance.parameters.clone(),
                    deadline,
                };
                started.push((j, i, work, job.timeout_ms));
            }
        }

        for (j, i, work, timeout_ms) in started {
            info!(
                run_id = %run_id,
                instance = %work.instance_id,
                timeout_ms,
                "Dispatching instance"
            );
            self.publish(Event::InstanceStarted(InstanceStartedPayload {
                run_id,
                instance_id: work.instance_id.clone(),
                parameters: work.parameters.clone(),
                started_at: now,
            }))
            .await;
            self.spawn_instance(j, i, work, Duration::from_millis(timeout_ms));
        }
    }

    fn spawn_instance(&self, job: usize, instance: usize, work: WorkItem, timeout: Duration) {
        let worker = self.worker.clone();
        let tx = self.outcome_tx.clone();
        let retry = self.retry;

        tokio::spawn(async move {
            let status =
                match tokio::time::timeout(timeout, execute_with_retry(&worker, &work, retry))
                    .await
                {
                    Ok(Ok(outcome)) => match outcome.status {
                        OutcomeStatus::Success => InstanceStatus::Success,
                        OutcomeStatus::Failure => InstanceStatus::Failure,
                    },
                    Ok(Err(err)) => {
                        warn!(instance = %work.instance_id, error = %err, "Dispatch retries exhausted");
                        InstanceStatus::Failure
                    }
                    Err(_) => {
                        warn!(instance = %work.instance_id, "Instance deadline elapsed");
                        // The worker's cancel may be as unresponsive as
                        // its execute; the timeout must not wait on it.
                        let run_id = work.run_id;
                        let instance_id = work.instance_id.clone();
                        let worker = worker.clone();
                        tokio::spawn(async move {
                            worker.cancel(run_id, &instance_id).await;
                        });
                        InstanceStatus::TimedOut
                    }
                };
            // The driver may already be gone if the run was cancelled.
            let _ = tx.send(InstanceMsg {
                job,
                instance,
                status,
            });
        });
    }

    /// Record a worker outcome. Terminal statuses are sticky: outcomes
    /// arriving after cancellation (or any other terminal transition)
    /// are discarded silently.
    async fn apply_outcome(&mut self, msg: InstanceMsg) {
        let now = Utc::now();
        let run_id = self.state.run_id;
        let mut events: Vec<Event> = Vec::new();
        let mut worker_cancels: Vec<InstanceId> = Vec::new();

        {
            let job = &mut self.state.jobs[msg.job];
            let instance = &mut job.instances[msg.instance];
            if instance.status.is_terminal() {
                debug!(
                    run_id = %run_id,
                    instance = %instance.id,
                    "Discarding outcome for already-terminal instance"
                );
                return;
            }

            if instance.status == InstanceStatus::Running {
                job.running = job.running.saturating_sub(1);
            }
            instance.status = msg.status;
            instance.finished_at = Some(now);
            info!(
                run_id = %run_id,
                instance = %instance.id,
                status = ?msg.status,
                "Instance finished"
            );
            events.push(Event::InstanceCompleted(InstanceCompletedPayload {
                run_id,
                instance_id: instance.id.clone(),
                status: msg.status,
                finished_at: now,
            }));

            let trips_fail_fast = job.fail_fast
                && matches!(
                    msg.status,
                    InstanceStatus::Failure | InstanceStatus::TimedOut
                );
            if trips_fail_fast {
                for sibling in &mut job.instances {
                    if sibling.status.is_terminal() {
                        continue;
                    }
                    if sibling.status == InstanceStatus::Running {
                        job.running = job.running.saturating_sub(1);
                        worker_cancels.push(sibling.id.clone());
                    }
                    sibling.status = InstanceStatus::Cancelled;
                    sibling.finished_at = Some(now);
                    events.push(Event::InstanceCompleted(InstanceCompletedPayload {
                        run_id,
                        instance_id: sibling.id.clone(),
                        status: InstanceStatus::Cancelled,
                        finished_at: now,
                    }));
                }
            }
        }

        for instance_id in worker_cancels {
            let worker = self.worker.clone();
            tokio::spawn(async move {
                worker.cancel(run_id, &instance_id).await;
            });
        }
        for event in events {
            self.publish(event).await;
        }

        self.step().await;
    }

    async fn check_complete(&mut self) {
        if self.state.status.is_terminal() {
            return;
        }
        let aggregates = self.state.aggregates();
        if !aggregates.iter().all(|agg| agg.is_terminal()) {
            return;
        }

        let rollup: Vec<(Condition, AggregateStatus)> = self
            .state
            .jobs
            .iter()
            .map(|job| job.condition)
            .zip(aggregates)
            .collect();
        self.state.status = aggregate::final_run_status(&rollup);
        self.state.completed_at = Some(Utc::now());
        info!(
            run_id = %self.state.run_id,
            status = ?self.state.status,
            "Run complete"
        );

        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: self.state.run_id,
            status: self.state.status,
            completed_at: self.state.completed_at.unwrap_or_else(Utc::now),
            duration_ms: self.state.snapshot().duration_ms,
        }))
        .await;
    }

    /// Cancel every non-terminal instance and mark the run cancelled.
    /// Optimistic: running workers get a best-effort signal but the
    /// engine does not wait for acknowledgement.
    async fn cancel_run(&mut self, kind: CancelKind) {
        if self.state.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        let run_id = self.state.run_id;
        info!(run_id = %run_id, kind = ?kind, "Cancelling run");

        let mut events: Vec<Event> = Vec::new();
        let mut worker_cancels: Vec<InstanceId> = Vec::new();

        for job in &mut self.state.jobs {
            for instance in &mut job.instances {
                if instance.status.is_terminal() {
                    continue;
                }
                if instance.status == InstanceStatus::Running {
                    worker_cancels.push(instance.id.clone());
                }
                instance.status = InstanceStatus::Cancelled;
                instance.finished_at = Some(now);
                events.push(Event::InstanceCompleted(InstanceCompletedPayload {
                    run_id,
                    instance_id: instance.id.clone(),
                    status: InstanceStatus::Cancelled,
                    finished_at: now,
                }));
            }
            job.running = 0;
        }

        self.state.cancel_kind = Some(kind);
        self.state.status = RunStatus::Cancelled;
        self.state.completed_at = Some(now);

        for instance_id in worker_cancels {
            let worker = self.worker.clone();
            tokio::spawn(async move {
                worker.cancel(run_id, &instance_id).await;
            });
        }
        for event in events {
            self.publish(event).await;
        }
        self.publish(Event::RunCancelled(RunCancelledPayload {
            run_id,
            kind,
            cancelled_at: now,
        }))
        .await;

        self.push_report();
    }

    fn finish(&mut self) {
        if let Some((key, _)) = &self.group {
            self.groups.release(key, self.state.run_id);
        }
        self.push_report();
    }

    fn push_report(&self) {
        self.report.send_replace(self.state.snapshot());
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.bus.publish(event).await {
            warn!(run_id = %self.state.run_id, error = %err, "Failed to publish event");
        }
    }
}

async fn execute_with_retry(
    worker: &Arc<dyn Worker>,
    work: &WorkItem,
    retry: RetryPolicy,
) -> Result<Outcome> {
    let mut delay = retry.base_delay;
    let mut attempt = 1u32;
    loop {
        match worker.execute(work.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < retry.attempts => {
                warn!(
                    instance = %work.instance_id,
                    attempt,
                    error = %err,
                    "Worker unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
