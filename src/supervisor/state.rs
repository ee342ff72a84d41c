//! Worker pool state machine.
//!
//! Each slot moves `Starting -> Running -> (ExitedClean | ExitedCrashed)`.
//! [`SupervisorState`] is owned by the event loop alone, so every mutation,
//! including the crash counter, is applied by a single writer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{AlertPolicy, TerminationEvent};
use crate::worker::WorkerId;

/// Lifecycle status of one worker slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Running,
    ExitedClean,
    ExitedCrashed,
}

impl WorkerStatus {
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Supervisor-side record of a spawned worker.
///
/// The process itself is owned by the worker's monitor task; the handle
/// keeps the token used to ask that task to stop it.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    stop: CancellationToken,
    stop_requested: bool,
}

impl WorkerHandle {
    #[must_use]
    pub fn new(id: WorkerId, pid: Option<u32>) -> Self {
        Self {
            id,
            pid,
            status: WorkerStatus::Starting,
            started_at: Utc::now(),
            stop: CancellationToken::new(),
            stop_requested: false,
        }
    }

    /// Token the monitor task watches for a stop request.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

/// Outcome of applying a [`TerminationEvent`] to the state.
#[derive(Debug, Clone)]
pub struct Termination {
    /// The removed worker, with its terminal status.
    pub worker: WorkerHandle,
    /// Crash counter after this event.
    pub crash_count: u64,
    /// Whether this event crossed the alert threshold.
    pub alert: bool,
}

impl Termination {
    #[must_use]
    pub fn is_crash(&self) -> bool {
        self.worker.status == WorkerStatus::ExitedCrashed
    }
}

/// Process-wide supervisor state.
#[derive(Debug)]
pub struct SupervisorState {
    target: usize,
    alert_threshold: u64,
    alert_policy: AlertPolicy,
    workers: HashMap<WorkerId, WorkerHandle>,
    crash_count: u64,
    clean_exits: u64,
    alerts_sent: u64,
    spawned: u64,
    next_id: u64,
}

impl SupervisorState {
    #[must_use]
    pub fn new(target: usize, alert_threshold: u64, alert_policy: AlertPolicy) -> Self {
        Self {
            target,
            alert_threshold,
            alert_policy,
            workers: HashMap::with_capacity(target),
            crash_count: 0,
            clean_exits: 0,
            alerts_sent: 0,
            spawned: 0,
            next_id: 0,
        }
    }

    /// Allocate the id for the next worker.
    pub fn next_worker_id(&mut self) -> WorkerId {
        self.next_id = self.next_id.saturating_add(1);
        WorkerId::new(self.next_id)
    }

    /// Track a freshly spawned worker.
    pub fn insert(&mut self, handle: WorkerHandle) {
        self.spawned = self.spawned.saturating_add(1);
        self.workers.insert(handle.id, handle);
    }

    /// Move a worker from `Starting` to `Running`.
    pub fn mark_running(&mut self, id: WorkerId) -> bool {
        match self.workers.get_mut(&id) {
            Some(handle) if handle.status == WorkerStatus::Starting => {
                tracing::debug!(worker_id = %id, "Worker running");
                handle.status = WorkerStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Flag a worker as being stopped by the supervisor.
    ///
    /// Returns the token to cancel, or `None` for an unknown worker.
    pub fn request_stop(&mut self, id: WorkerId) -> Option<CancellationToken> {
        let handle = self.workers.get_mut(&id)?;
        handle.stop_requested = true;
        Some(handle.stop_token())
    }

    /// Classify a worker exit and update the counters.
    ///
    /// Returns `None` if the worker is not tracked.
    pub fn record_termination(&mut self, event: &TerminationEvent) -> Option<Termination> {
        let mut worker = self.workers.remove(&event.worker_id)?;

        let requested = event.voluntary || worker.stop_requested;
        let mut alert = false;
        if requested || event.exited_zero() {
            worker.status = WorkerStatus::ExitedClean;
            self.clean_exits = self.clean_exits.saturating_add(1);
        } else {
            worker.status = WorkerStatus::ExitedCrashed;
            self.crash_count = self.crash_count.saturating_add(1);
            alert = self
                .alert_policy
                .should_alert(self.crash_count, self.alert_threshold);
            if alert {
                self.alerts_sent = self.alerts_sent.saturating_add(1);
            }
        }

        Some(Termination {
            worker,
            crash_count: self.crash_count,
            alert,
        })
    }

    #[must_use]
    pub fn crash_count(&self) -> u64 {
        self.crash_count
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.status.is_live()).count()
    }

    #[must_use]
    pub fn live_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.status.is_live())
            .map(|w| w.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// Point-in-time view for observers.
    #[must_use]
    pub fn snapshot(&self) -> SupervisorStatus {
        let mut workers: Vec<WorkerSnapshot> = self
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id,
                pid: w.pid,
                status: w.status,
                started_at: w.started_at,
            })
            .collect();
        workers.sort_unstable_by_key(|w| w.id);

        SupervisorStatus {
            target: self.target,
            workers,
            crash_count: self.crash_count,
            clean_exits: self.clean_exits,
            alerts_sent: self.alerts_sent,
            spawned: self.spawned,
        }
    }
}

/// Public view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
}

/// Public view of the supervisor, published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    /// Number of workers the supervisor keeps alive.
    pub target: usize,
    /// Tracked workers, ordered by id.
    pub workers: Vec<WorkerSnapshot>,
    /// Crashes observed so far. Never decreases.
    pub crash_count: u64,
    /// Clean exits observed so far.
    pub clean_exits: u64,
    /// Alerts dispatched so far.
    pub alerts_sent: u64,
    /// Workers spawned so far, including replacements.
    pub spawned: u64,
}

impl SupervisorStatus {
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.status.is_live()).count()
    }

    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }

    #[must_use]
    pub fn pid_of(&self, id: WorkerId) -> Option<u32> {
        self.workers.iter().find(|w| w.id == id).and_then(|w| w.pid)
    }
}
