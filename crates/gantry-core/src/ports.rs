//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and external
//! adapters: the worker that executes instances and the event bus that
//! carries lifecycle notifications.

use crate::events::Event;
use crate::ids::{InstanceId, RunId};
use crate::workflow::ParameterSet;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a subject pattern.
    /// Pattern supports wildcards: `run.queued.*`, `run.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// One unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub parameters: ParameterSet,
    /// Hard deadline; past it the engine records a timeout whether or
    /// not the worker ever responds.
    pub deadline: DateTime<Utc>,
}

/// Terminal outcome a worker reports for an instance.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub metadata: HashMap<String, String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            metadata: HashMap::new(),
        }
    }

    pub fn failure() -> Self {
        Self {
            status: OutcomeStatus::Failure,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Opaque execution backend.
///
/// `execute` resolves with the instance's terminal outcome, or with an
/// error when the backend itself is unreachable (which the engine
/// retries with bounded backoff). `cancel` is best-effort and
/// fire-and-forget; the engine marks the instance cancelled without
/// waiting for acknowledgement.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, work: WorkItem) -> Result<Outcome>;

    async fn cancel(&self, run_id: RunId, instance_id: &InstanceId);
}
