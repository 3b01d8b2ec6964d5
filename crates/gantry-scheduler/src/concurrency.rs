//! Cross-run concurrency groups.
//!
//! A process-wide registry enforcing "one active run per group key".
//! The key is an opaque caller-supplied string; the registry outlives
//! any single run and is only mutated through [`GroupRegistry::admit`]
//! and [`GroupRegistry::release`]. Entries are evicted once a group has
//! no active or queued run.

use gantry_core::ids::RunId;
use gantry_core::run::CancelKind;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Handle through which the registry (or the engine's cancel API)
/// signals a run's driver to cancel.
#[derive(Clone)]
pub struct CancelHandle(mpsc::UnboundedSender<CancelKind>);

impl CancelHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CancelKind>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Delivery is best-effort: a run that already finished has dropped
    /// its receiver and the signal is simply lost.
    pub fn signal(&self, kind: CancelKind) {
        let _ = self.0.send(kind);
    }
}

/// Outcome of admitting a run into its group.
pub enum Admission {
    /// The run holds the group and may start immediately.
    Active,
    /// Another run holds the group; the receiver resolves when this run
    /// is promoted.
    Queued(oneshot::Receiver<()>),
}

struct ActiveRun {
    run_id: RunId,
}

struct QueuedRun {
    run_id: RunId,
    permit: oneshot::Sender<()>,
    cancel: CancelHandle,
}

#[derive(Default)]
struct GroupEntry {
    active: Option<ActiveRun>,
    queue: VecDeque<QueuedRun>,
}

/// Process-wide concurrency-group registry.
///
/// All mutation happens under one mutex held only for map updates,
/// never across an await point.
#[derive(Default)]
pub struct GroupRegistry {
    groups: Mutex<HashMap<String, GroupState>>,
}

struct GroupState {
    entry: GroupEntry,
    /// Cancel handle of the active run, kept so a later
    /// `cancel_in_progress` admission can preempt it.
    active_cancel: Option<CancelHandle>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `run_id` into `key`.
    ///
    /// With `cancel_in_progress`, a current holder is sent a
    /// `Superseded` cancel signal and the new run takes the group
    /// immediately. Otherwise the run queues FIFO behind the holder.
    pub fn admit(
        &self,
        key: &str,
        cancel_in_progress: bool,
        run_id: RunId,
        cancel: CancelHandle,
    ) -> Admission {
        let mut groups = self.groups.lock().expect("group registry poisoned");
        let state = groups.entry(key.to_string()).or_insert_with(|| GroupState {
            entry: GroupEntry::default(),
            active_cancel: None,
        });

        match &state.entry.active {
            None => {
                state.entry.active = Some(ActiveRun { run_id });
                state.active_cancel = Some(cancel);
                debug!(group = key, run_id = %run_id, "Run admitted as group holder");
                Admission::Active
            }
            Some(holder) if cancel_in_progress => {
                info!(
                    group = key,
                    superseded = %holder.run_id,
                    run_id = %run_id,
                    "Preempting group holder"
                );
                if let Some(prev) = state.active_cancel.take() {
                    prev.signal(CancelKind::Superseded);
                }
                state.entry.active = Some(ActiveRun { run_id });
                state.active_cancel = Some(cancel);
                Admission::Active
            }
            Some(holder) => {
                debug!(
                    group = key,
                    holder = %holder.run_id,
                    run_id = %run_id,
                    position = state.entry.queue.len(),
                    "Run queued behind group holder"
                );
                let (permit_tx, permit_rx) = oneshot::channel();
                state.entry.queue.push_back(QueuedRun {
                    run_id,
                    permit: permit_tx,
                    cancel,
                });
                Admission::Queued(permit_rx)
            }
        }
    }

    /// Release `run_id` from `key` on terminal transition: promotes the
    /// next queued run (skipping any that already gave up) and evicts
    /// the entry when the group drains. The promotion installs the new
    /// holder before the permit-holder resumes, so an admit landing in
    /// between cannot steal the group.
    pub fn release(&self, key: &str, run_id: RunId) {
        let mut groups = self.groups.lock().expect("group registry poisoned");
        let Some(state) = groups.get_mut(key) else {
            return;
        };

        if state
            .entry
            .active
            .as_ref()
            .is_some_and(|a| a.run_id == run_id)
        {
            state.entry.active = None;
            state.active_cancel = None;
            while let Some(next) = state.entry.queue.pop_front() {
                let next_id = next.run_id;
                let next_cancel = next.cancel.clone();
                if next.permit.send(()).is_ok() {
                    debug!(group = key, run_id = %next_id, "Promoted queued run");
                    state.entry.active = Some(ActiveRun { run_id: next_id });
                    state.active_cancel = Some(next_cancel);
                    break;
                }
                // Receiver dropped: the queued run was cancelled while
                // waiting. Try the next one.
            }
        } else {
            // A run cancelled while still queued releases its slot.
            state.entry.queue.retain(|q| q.run_id != run_id);
        }

        if state.entry.active.is_none() && state.entry.queue.is_empty() {
            groups.remove(key);
        }
    }

    /// Number of live groups, for observability and tests.
    pub fn len(&self) -> usize {
        self.groups.lock().expect("group registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
