//! Supervisor runtime.
//!
//! Keeps `C` workers alive. Each worker gets a monitor task that owns the
//! process and reports its exit over a channel; a single event loop consumes
//! those reports, classifies them, respawns crashed workers and escalates to
//! the alert sink when the crash counter reaches the threshold.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::alert::{AlertSink, NotificationError};
use crate::config::{detected_cpus, AppConfig, ConfigError, DEFAULT_ALERT_THRESHOLD};
use crate::supervisor::{
    AlertPolicy, SupervisorCommand, SupervisorState, SupervisorStatus, TerminationEvent,
    WorkerEvent, WorkerHandle, DEFAULT_EVENT_BUFFER,
};
use crate::worker::{
    ExitOutcome, SpawnError, WorkerId, WorkerLauncher, WorkerProcess, DEFAULT_TERMINATE_TIMEOUT,
};

/// Extra time allowed on top of the terminate timeout during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lower bound for the respawn retry period.
const MIN_RESPAWN_RETRY: Duration = Duration::from_millis(10);

/// Error type for supervisor operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// Settings rejected before any worker was spawned.
    #[error("Invalid supervisor configuration: {0}")]
    Config(#[from] ConfigError),
    /// A worker could not be spawned during startup.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    /// The event loop is no longer running.
    #[error("Supervisor event loop is not running")]
    ChannelClosed,
    /// The event loop task panicked or was aborted.
    #[error("Supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runtime settings for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Number of workers to keep alive.
    pub workers: usize,
    /// Crash count that triggers an alert.
    pub alert_threshold: u64,
    pub alert_policy: AlertPolicy,
    /// Grace period between asking a worker to stop and killing it.
    pub shutdown_timeout: Duration,
    /// Period for retrying respawns that failed.
    pub respawn_retry: Duration,
    /// Upper bound on one alert delivery.
    pub alert_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::new(detected_cpus())
    }
}

impl SupervisorSettings {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            alert_policy: AlertPolicy::Once,
            shutdown_timeout: DEFAULT_TERMINATE_TIMEOUT,
            respawn_retry: Duration::from_secs(1),
            alert_timeout: Duration::from_secs(10),
        }
    }

    /// Derive settings from the application configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidWorkerCount` if the worker count resolves to 0.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            workers: config.cluster.resolve_worker_count()?,
            alert_threshold: config.cluster.alert_threshold,
            alert_policy: config.cluster.alert_policy,
            shutdown_timeout: config.cluster.shutdown_timeout(),
            respawn_retry: config.cluster.respawn_retry(),
            alert_timeout: config.alert.timeout(),
        })
    }

    #[must_use]
    pub fn alert_threshold(mut self, threshold: u64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    #[must_use]
    pub fn alert_policy(mut self, policy: AlertPolicy) -> Self {
        self.alert_policy = policy;
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn respawn_retry(mut self, period: Duration) -> Self {
        self.respawn_retry = period;
        self
    }

    #[must_use]
    pub fn alert_timeout(mut self, timeout: Duration) -> Self {
        self.alert_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(0));
        }
        if self.alert_threshold == 0 {
            return Err(ConfigError::InvalidAlertThreshold);
        }
        Ok(())
    }
}

/// Owner of the worker pool. Lives inside its own task once started.
pub struct Supervisor {
    settings: SupervisorSettings,
    state: SupervisorState,
    launcher: Arc<dyn WorkerLauncher>,
    alerts: Arc<dyn AlertSink>,
    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    status_tx: watch::Sender<SupervisorStatus>,
    cancel: CancellationToken,
    alert_tasks: JoinSet<()>,
    /// Replacements owed for crashed workers whose launch failed.
    pending_respawns: usize,
    shutting_down: bool,
}

impl Supervisor {
    /// Validate `settings`, spawn every worker and start the event loop.
    ///
    /// All workers are launched before any of them is monitored; if one
    /// fails to launch, the ones already started are killed when dropped.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Config` if the worker count is 0 or the
    /// threshold is 0 (nothing is spawned), or `SupervisorError::Spawn` if a
    /// worker cannot be started.
    pub fn start(
        settings: SupervisorSettings,
        launcher: Arc<dyn WorkerLauncher>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<SupervisorHandle, SupervisorError> {
        settings.validate()?;

        let mut state = SupervisorState::new(
            settings.workers,
            settings.alert_threshold,
            settings.alert_policy,
        );

        tracing::info!(workers = settings.workers, "Forking workers");
        let mut launched = Vec::with_capacity(settings.workers);
        for _ in 0..settings.workers {
            let id = state.next_worker_id();
            launched.push((id, launcher.launch(id)?));
        }

        let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let cancel = CancellationToken::new();

        let mut supervisor = Self {
            settings,
            state,
            launcher,
            alerts,
            event_tx,
            event_rx,
            command_rx,
            status_tx,
            cancel: cancel.clone(),
            alert_tasks: JoinSet::new(),
            pending_respawns: 0,
            shutting_down: false,
        };

        for (id, process) in launched {
            supervisor.monitor(id, process);
        }
        supervisor.publish_status();

        let task = tokio::spawn(supervisor.run());

        Ok(SupervisorHandle {
            status_rx,
            command_tx,
            cancel,
            task,
        })
    }

    /// Track `process` and spawn the task that reports its exit.
    fn monitor(&mut self, id: WorkerId, mut process: Box<dyn WorkerProcess>) {
        let handle = WorkerHandle::new(id, process.pid());
        let stop = handle.stop_token();
        self.state.insert(handle);

        let events = self.event_tx.clone();
        let terminate_timeout = self.settings.shutdown_timeout;

        tokio::spawn(async move {
            let _ = events.send(WorkerEvent::Online { worker_id: id }).await;

            let exited = tokio::select! {
                result = process.wait() => Some(result),
                () = stop.cancelled() => None,
            };
            let (result, voluntary) = match exited {
                Some(result) => (result, false),
                None => (process.terminate(terminate_timeout).await, true),
            };

            let outcome = result.unwrap_or_else(|e| {
                tracing::warn!(worker_id = %id, error = %e, "Failed to observe worker exit");
                ExitOutcome::default()
            });

            let event = TerminationEvent::new(id, outcome, voluntary);
            let _ = events.send(WorkerEvent::Exited(event)).await;
        });
    }

    /// Launch one worker into a fresh slot. Returns false if the launch failed.
    fn spawn_worker(&mut self) -> bool {
        let id = self.state.next_worker_id();
        match self.launcher.launch(id) {
            Ok(process) => {
                tracing::info!(worker_id = %id, pid = ?process.pid(), "Started worker");
                self.monitor(id, process);
                true
            }
            Err(e) => {
                tracing::error!(worker_id = %id, error = %e, "Failed to start worker");
                false
            }
        }
    }

    /// Launch the replacements still owed for crashed workers.
    fn respawn_pending(&mut self) {
        while self.pending_respawns > 0 {
            if !self.spawn_worker() {
                tracing::warn!(
                    pending = self.pending_respawns,
                    "Replacement deferred, retrying later"
                );
                break;
            }
            self.pending_respawns -= 1;
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Online { worker_id } => {
                self.state.mark_running(worker_id);
            }
            WorkerEvent::Exited(event) => self.handle_termination(&event),
        }
        self.publish_status();
    }

    fn handle_termination(&mut self, event: &TerminationEvent) {
        let Some(termination) = self.state.record_termination(event) else {
            tracing::warn!(worker_id = %event.worker_id, "Exit reported for unknown worker");
            return;
        };

        if termination.is_crash() {
            tracing::warn!(
                worker_id = %event.worker_id,
                code = ?event.code,
                signal = ?event.signal,
                crash_count = termination.crash_count,
                "Worker crashed, starting a new worker"
            );
            if !self.shutting_down {
                self.pending_respawns = self.pending_respawns.saturating_add(1);
                self.respawn_pending();
            }
            if termination.alert {
                self.dispatch_alert(termination.crash_count);
            }
        } else {
            tracing::info!(
                worker_id = %event.worker_id,
                code = ?event.code,
                signal = ?event.signal,
                voluntary = event.voluntary,
                "Worker exited"
            );
        }
    }

    fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Disconnect { worker_id, reply } => {
                let found = match self.state.request_stop(worker_id) {
                    Some(stop) => {
                        tracing::info!(worker_id = %worker_id, "Disconnecting worker");
                        stop.cancel();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
        }
    }

    /// Notify the sink without blocking the event loop. Failures are logged.
    fn dispatch_alert(&mut self, crash_count: u64) {
        tracing::warn!(
            crash_count,
            sink = self.alerts.name(),
            "Crash threshold reached, sending alert"
        );

        let sink = Arc::clone(&self.alerts);
        let timeout = self.settings.alert_timeout;
        self.alert_tasks.spawn(async move {
            let result = tokio::time::timeout(timeout, sink.notify(crash_count))
                .await
                .unwrap_or(Err(NotificationError::Timeout));
            match result {
                Ok(()) => tracing::info!(crash_count, "Crash alert delivered"),
                Err(e) => {
                    tracing::error!(crash_count, error = %e, "Failed to deliver crash alert");
                }
            }
        });
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.state.snapshot());
    }

    async fn run(mut self) -> SupervisorStatus {
        let mut retry = tokio::time::interval(self.settings.respawn_retry.max(MIN_RESPAWN_RETRY));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(event) = self.event_rx.recv() => self.handle_event(event),
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                Some(joined) = self.alert_tasks.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Alert task failed");
                    }
                }
                _ = retry.tick(), if self.pending_respawns > 0 => {
                    self.respawn_pending();
                    self.publish_status();
                }
            }
        }

        self.shutdown().await
    }

    /// Stop every live worker, wait for their exits and pending alerts.
    async fn shutdown(mut self) -> SupervisorStatus {
        self.shutting_down = true;

        let live = self.state.live_ids();
        tracing::info!(workers = live.len(), "Stopping workers");
        for id in live {
            if let Some(stop) = self.state.request_stop(id) {
                stop.cancel();
            }
        }
        self.publish_status();

        let deadline = self.settings.shutdown_timeout.saturating_add(SHUTDOWN_GRACE);
        if tokio::time::timeout(deadline, self.drain_workers())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.state.live_count(),
                "Timed out waiting for workers to exit"
            );
        }

        while let Some(joined) = self.alert_tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Alert task failed");
            }
        }

        self.publish_status();
        let status = self.state.snapshot();
        tracing::info!(
            crash_count = status.crash_count,
            clean_exits = status.clean_exits,
            "Supervisor stopped"
        );
        status
    }

    async fn drain_workers(&mut self) {
        while self.state.live_count() > 0 {
            match self.event_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }
}

/// Control handle returned by [`Supervisor::start`].
#[derive(Debug)]
pub struct SupervisorHandle {
    status_rx: watch::Receiver<SupervisorStatus>,
    command_tx: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
    task: JoinHandle<SupervisorStatus>,
}

impl SupervisorHandle {
    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Wait until a published status satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::ChannelClosed` if the supervisor stopped first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SupervisorStatus, SupervisorError>
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let status = rx
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?
            .clone();
        Ok(status)
    }

    /// Gracefully stop one worker. It is not replaced and does not count
    /// as a crash. Returns false if the worker is unknown.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::ChannelClosed` if the event loop has stopped.
    pub async fn disconnect(&self, worker_id: WorkerId) -> Result<bool, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::Disconnect { worker_id, reply })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        response.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop all workers and wait for the event loop to finish.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Join` if the event loop task failed.
    pub async fn shutdown(self) -> Result<SupervisorStatus, SupervisorError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the event loop to finish after its token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Join` if the event loop task failed.
    pub async fn join(self) -> Result<SupervisorStatus, SupervisorError> {
        Ok(self.task.await?)
    }
}
