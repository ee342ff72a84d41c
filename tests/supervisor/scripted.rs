//! In-memory worker launcher whose workers exit when the test says so.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_cluster::alert::{AlertSink, NotificationError};
use api_cluster::worker::{ExitOutcome, SpawnError, WorkerId, WorkerLauncher, WorkerProcess};
use async_trait::async_trait;
use tokio::sync::oneshot;

#[derive(Default)]
struct Inner {
    exits: HashMap<WorkerId, oneshot::Sender<ExitOutcome>>,
    launched: Vec<WorkerId>,
    terminated: Vec<WorkerId>,
    failures_pending: usize,
}

/// Launcher handing out workers that live until `exit` is called.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the worker exit on its own with `outcome`.
    pub fn exit(&self, id: WorkerId, outcome: ExitOutcome) -> bool {
        let sender = self.inner.lock().unwrap().exits.remove(&id);
        sender.is_some_and(|tx| tx.send(outcome).is_ok())
    }

    /// Kill the worker unexpectedly.
    pub fn crash(&self, id: WorkerId) -> bool {
        self.exit(id, ExitOutcome::signaled("SIGKILL"))
    }

    /// Fail the next `count` launches.
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().unwrap().failures_pending = count;
    }

    pub fn launched(&self) -> Vec<WorkerId> {
        self.inner.lock().unwrap().launched.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.inner.lock().unwrap().launched.len()
    }

    pub fn terminated(&self) -> Vec<WorkerId> {
        self.inner.lock().unwrap().terminated.clone()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, id: WorkerId) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failures_pending > 0 {
            inner.failures_pending -= 1;
            return Err(SpawnError::NotFound);
        }

        let (tx, rx) = oneshot::channel();
        inner.exits.insert(id, tx);
        inner.launched.push(id);

        Ok(Box::new(ScriptedWorker {
            id,
            pid: 10_000 + u32::try_from(id.get()).unwrap(),
            exit_rx: rx,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct ScriptedWorker {
    id: WorkerId,
    pid: u32,
    exit_rx: oneshot::Receiver<ExitOutcome>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl WorkerProcess for ScriptedWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        (&mut self.exit_rx)
            .await
            .map_err(|_| std::io::Error::other("scripted worker dropped"))
    }

    async fn terminate(&mut self, _timeout: Duration) -> std::io::Result<ExitOutcome> {
        let mut inner = self.inner.lock().unwrap();
        inner.exits.remove(&self.id);
        inner.terminated.push(self.id);
        Ok(ExitOutcome::exited(0))
    }
}

/// Sink remembering every crash count it was notified with.
#[derive(Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<u64>>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn notify(&self, crash_count: u64) -> Result<(), NotificationError> {
        self.calls.lock().unwrap().push(crash_count);
        Ok(())
    }
}

/// Sink whose transport is always down.
#[derive(Clone, Default)]
pub struct FailingSink {
    attempts: Arc<Mutex<u64>>,
}

impl FailingSink {
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl AlertSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn notify(&self, _crash_count: u64) -> Result<(), NotificationError> {
        *self.attempts.lock().unwrap() += 1;
        Err(NotificationError::Transport("smtp unreachable".to_string()))
    }
}
