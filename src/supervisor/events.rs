//! Messages flowing into the supervisor event loop.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::worker::{ExitOutcome, WorkerId};

/// Default capacity for the worker event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Describes one worker's exit. Consumed exactly once by the event loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationEvent {
    pub worker_id: WorkerId,
    /// Exit code, absent when killed by a signal.
    pub code: Option<i32>,
    /// Signal name, when killed by a signal.
    pub signal: Option<String>,
    /// The supervisor asked this worker to stop.
    pub voluntary: bool,
}

impl TerminationEvent {
    #[must_use]
    pub fn new(worker_id: WorkerId, outcome: ExitOutcome, voluntary: bool) -> Self {
        Self {
            worker_id,
            code: outcome.code,
            signal: outcome.signal,
            voluntary,
        }
    }

    /// Whether the worker exited with status 0.
    #[must_use]
    pub fn exited_zero(&self) -> bool {
        self.code == Some(0)
    }
}

/// Lifecycle notifications sent by per-worker monitor tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The monitor took ownership of the process and is waiting on it.
    Online { worker_id: WorkerId },
    /// The process ended.
    Exited(TerminationEvent),
}

/// Requests sent from a [`SupervisorHandle`](super::SupervisorHandle).
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Gracefully stop one worker without replacing it.
    Disconnect {
        worker_id: WorkerId,
        reply: oneshot::Sender<bool>,
    },
}
