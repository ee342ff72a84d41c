//! Supervisor behavior against scripted workers.

use std::sync::Arc;
use std::time::Duration;

use api_cluster::alert::AlertSink;
use api_cluster::config::ConfigError;
use api_cluster::supervisor::{
    AlertPolicy, Supervisor, SupervisorError, SupervisorHandle, SupervisorSettings,
    SupervisorStatus, WorkerStatus,
};
use api_cluster::worker::{ExitOutcome, WorkerId};
use tokio::time::timeout;

use super::scripted::{FailingSink, RecordingSink, ScriptedLauncher};

const WAIT: Duration = Duration::from_secs(5);

fn settings(workers: usize, threshold: u64) -> SupervisorSettings {
    SupervisorSettings::new(workers)
        .alert_threshold(threshold)
        .respawn_retry(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_millis(200))
}

fn start(
    settings: SupervisorSettings,
    launcher: &ScriptedLauncher,
    sink: Arc<dyn AlertSink>,
) -> SupervisorHandle {
    Supervisor::start(settings, Arc::new(launcher.clone()), sink).expect("supervisor should start")
}

async fn wait_until<F>(handle: &SupervisorHandle, predicate: F) -> SupervisorStatus
where
    F: FnMut(&SupervisorStatus) -> bool,
{
    timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for supervisor status")
        .expect("supervisor stopped")
}

fn all_running(status: &SupervisorStatus, count: usize) -> bool {
    status.live_count() == count
        && status
            .workers
            .iter()
            .all(|w| w.status == WorkerStatus::Running)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn start_spawns_exactly_target_workers() {
    for workers in [1, 2, 4, 8] {
        let launcher = ScriptedLauncher::new();
        let handle = start(settings(workers, 5), &launcher, Arc::new(RecordingSink::default()));

        let status = handle.status();
        assert_eq!(status.target, workers);
        assert_eq!(status.live_count(), workers);
        assert_eq!(launcher.launch_count(), workers);

        wait_until(&handle, |s| all_running(s, workers)).await;
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn five_crashes_across_four_workers_alert_once() {
    let launcher = ScriptedLauncher::new();
    let sink = RecordingSink::default();
    let handle = start(settings(4, 5), &launcher, Arc::new(sink.clone()));

    for crash in 1..=5u64 {
        let status = wait_until(&handle, |s| all_running(s, 4)).await;
        let victim = status.workers[0].id;
        assert!(launcher.crash(victim));

        let status = wait_until(&handle, |s| s.crash_count == crash && s.live_count() == 4).await;
        assert!(!status.worker_ids().contains(&victim));
        assert_eq!(status.live_count(), 4);
    }

    eventually(|| sink.calls() == vec![5]).await;

    let final_status = handle.shutdown().await.unwrap();
    assert_eq!(final_status.crash_count, 5);
    assert_eq!(final_status.alerts_sent, 1);
    assert_eq!(final_status.clean_exits, 4);
    assert_eq!(final_status.live_count(), 0);
    assert_eq!(launcher.launch_count(), 9);
    assert_eq!(sink.calls(), vec![5]);
}

#[tokio::test]
async fn alert_is_not_repeated_past_threshold() {
    let launcher = ScriptedLauncher::new();
    let sink = RecordingSink::default();
    let handle = start(settings(2, 3), &launcher, Arc::new(sink.clone()));

    for crash in 1..=7u64 {
        let status = wait_until(&handle, |s| all_running(s, 2)).await;
        assert!(launcher.crash(status.workers[1].id));
        wait_until(&handle, |s| s.crash_count == crash).await;
    }

    let final_status = handle.shutdown().await.unwrap();
    assert_eq!(final_status.crash_count, 7);
    assert_eq!(final_status.alerts_sent, 1);
    assert_eq!(sink.calls(), vec![3]);
}

#[tokio::test]
async fn every_multiple_policy_alerts_on_each_multiple() {
    let launcher = ScriptedLauncher::new();
    let sink = RecordingSink::default();
    let handle = start(
        settings(1, 2).alert_policy(AlertPolicy::EveryMultiple),
        &launcher,
        Arc::new(sink.clone()),
    );

    for crash in 1..=6u64 {
        let status = wait_until(&handle, |s| all_running(s, 1)).await;
        assert!(launcher.exit(status.workers[0].id, ExitOutcome::exited(1)));
        wait_until(&handle, |s| s.crash_count == crash).await;
    }

    handle.shutdown().await.unwrap();
    let mut calls = sink.calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![2, 4, 6]);
}

#[tokio::test]
async fn requested_disconnect_is_clean_and_not_replaced() {
    let launcher = ScriptedLauncher::new();
    let sink = RecordingSink::default();
    let handle = start(settings(1, 5), &launcher, Arc::new(sink.clone()));

    let status = wait_until(&handle, |s| all_running(s, 1)).await;
    let id = status.workers[0].id;

    assert!(handle.disconnect(id).await.unwrap());
    let status = wait_until(&handle, |s| s.clean_exits == 1).await;
    assert_eq!(status.crash_count, 0);
    assert_eq!(status.live_count(), 0);

    // Give a respawn the chance to happen if it were going to.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(launcher.terminated(), vec![id]);

    let final_status = handle.shutdown().await.unwrap();
    assert_eq!(final_status.crash_count, 0);
    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn disconnect_unknown_worker_returns_false() {
    let launcher = ScriptedLauncher::new();
    let handle = start(settings(1, 5), &launcher, Arc::new(RecordingSink::default()));

    assert!(!handle.disconnect(WorkerId::new(999)).await.unwrap());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unrequested_zero_exit_is_clean_without_respawn() {
    let launcher = ScriptedLauncher::new();
    let handle = start(settings(2, 5), &launcher, Arc::new(RecordingSink::default()));

    let status = wait_until(&handle, |s| all_running(s, 2)).await;
    assert!(launcher.exit(status.workers[0].id, ExitOutcome::exited(0)));

    let status = wait_until(&handle, |s| s.clean_exits == 1).await;
    assert_eq!(status.crash_count, 0);
    assert_eq!(status.live_count(), 1);
    assert_eq!(launcher.launch_count(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_crashes_are_all_counted() {
    let launcher = ScriptedLauncher::new();
    let sink = RecordingSink::default();
    let handle = start(settings(8, 5), &launcher, Arc::new(sink.clone()));

    let status = wait_until(&handle, |s| all_running(s, 8)).await;
    for id in status.worker_ids() {
        assert!(launcher.crash(id));
    }

    let status = wait_until(&handle, |s| s.crash_count == 8 && s.live_count() == 8).await;
    assert_eq!(status.spawned, 16);
    assert_eq!(launcher.launch_count(), 16);

    let final_status = handle.shutdown().await.unwrap();
    assert_eq!(final_status.crash_count, 8);
    assert_eq!(sink.calls(), vec![5]);
}

#[tokio::test]
async fn failing_alert_sink_does_not_stop_supervision() {
    let launcher = ScriptedLauncher::new();
    let sink = FailingSink::default();
    let handle = start(settings(1, 1), &launcher, Arc::new(sink.clone()));

    let status = wait_until(&handle, |s| all_running(s, 1)).await;
    assert!(launcher.crash(status.workers[0].id));
    wait_until(&handle, |s| s.crash_count == 1 && s.live_count() == 1).await;
    eventually(|| sink.attempts() == 1).await;

    let status = wait_until(&handle, |s| all_running(s, 1)).await;
    assert!(launcher.crash(status.workers[0].id));
    let status = wait_until(&handle, |s| s.crash_count == 2 && s.live_count() == 1).await;
    assert_eq!(status.alerts_sent, 1);
    assert!(!handle.is_finished());

    handle.shutdown().await.unwrap();
    assert_eq!(sink.attempts(), 1);
}

#[tokio::test]
async fn failed_respawn_is_retried() {
    let launcher = ScriptedLauncher::new();
    let handle = start(settings(1, 5), &launcher, Arc::new(RecordingSink::default()));

    let status = wait_until(&handle, |s| all_running(s, 1)).await;
    launcher.fail_next(2);
    assert!(launcher.crash(status.workers[0].id));

    let status = wait_until(&handle, |s| s.crash_count == 1 && s.live_count() == 1).await;
    assert_eq!(status.spawned, 2);
    assert_eq!(launcher.launch_count(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_workers_is_a_config_error() {
    let launcher = ScriptedLauncher::new();
    let result = Supervisor::start(
        SupervisorSettings::new(0),
        Arc::new(launcher.clone()),
        Arc::new(RecordingSink::default()),
    );

    assert!(matches!(
        result,
        Err(SupervisorError::Config(ConfigError::InvalidWorkerCount(0)))
    ));
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn startup_launch_failure_aborts_start() {
    let launcher = ScriptedLauncher::new();
    launcher.fail_next(1);
    let result = Supervisor::start(
        settings(3, 5),
        Arc::new(launcher.clone()),
        Arc::new(RecordingSink::default()),
    );

    assert!(matches!(result, Err(SupervisorError::Spawn(_))));
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn shutdown_stops_every_worker_cleanly() {
    let launcher = ScriptedLauncher::new();
    let handle = start(settings(3, 5), &launcher, Arc::new(RecordingSink::default()));
    wait_until(&handle, |s| all_running(s, 3)).await;

    let final_status = handle.shutdown().await.unwrap();
    assert_eq!(final_status.clean_exits, 3);
    assert_eq!(final_status.crash_count, 0);
    assert!(final_status.workers.is_empty());

    let mut terminated = launcher.terminated();
    terminated.sort_unstable();
    assert_eq!(terminated, launcher.launched());
}

#[tokio::test]
async fn status_subscription_sees_updates() {
    let launcher = ScriptedLauncher::new();
    let handle = start(settings(1, 5), &launcher, Arc::new(RecordingSink::default()));
    let mut rx = handle.subscribe();

    let status = wait_until(&handle, |s| all_running(s, 1)).await;
    assert!(launcher.crash(status.workers[0].id));

    let observed = timeout(WAIT, rx.wait_for(|s| s.crash_count == 1))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(observed.crash_count, 1);

    handle.shutdown().await.unwrap();
}
