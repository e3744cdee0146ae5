// End-to-end pipeline tests
// Definitions are built, applied to the in-memory substrate, and run through
// the local compute queue; notifications are observed on a broadcast topic.

use chrono::{TimeZone, Utc};
use common::config::Settings;
use common::errors::ConfigurationError;
use common::models::{BackupDefinition, NotificationEvent, TerminalStatus, TriggerState};
use common::orchestrator::{build_desired_state, DesiredState};
use common::queue::{local_compute_queue, ComputeQueueManager};
use common::router::{BroadcastTopic, EventSource};
use common::scheduler::{EngineConfig, TriggerEngine};
use common::substrate::{apply, InMemorySubstrate};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Worker stand-in: fails for the source id "Broken", succeeds otherwise
fn write_worker(dir: &Path) -> String {
    let path = dir.join("back-up-folder");
    std::fs::write(
        &path,
        "#!/bin/sh\ncase \"$1\" in\n  Broken) exit 3 ;;\nesac\nexit 0\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn settings(executable: String) -> Settings {
    let mut settings = Settings::default();
    settings.orchestrator.executable = executable;
    settings.compute.max_vcpus = 2;
    settings
}

/// Local runtime wired the way `run-local` wires it
struct Pipeline {
    manager: ComputeQueueManager,
    notifications: broadcast::Receiver<NotificationEvent>,
    shutdown: broadcast::Sender<()>,
}

fn start_pipeline(state: &DesiredState, settings: &Settings) -> Pipeline {
    let source = EventSource::from_config(&settings.notifications);
    let (events_tx, events_rx) = broadcast::channel::<Value>(256);
    let (shutdown, shutdown_rx) = broadcast::channel(1);

    let (queue, dispatcher) = local_compute_queue(
        &state.compute_pool,
        &state.job_queue,
        source,
        events_tx,
    );
    tokio::spawn(dispatcher.run());

    let topic = BroadcastTopic::new(state.topic.name.clone(), 64);
    let notifications = topic.subscribe();
    let router = state
        .completion_router(&settings.orchestrator.component)
        .with_publisher(Arc::new(topic));
    tokio::spawn(router.run(events_rx, shutdown_rx));

    let manager = ComputeQueueManager::new(
        state.compute_pool.clone(),
        state.job_queue.clone(),
        Arc::new(queue),
    );

    Pipeline {
        manager,
        notifications,
        shutdown,
    }
}

async fn next_notification(
    receiver: &mut broadcast::Receiver<NotificationEvent>,
) -> NotificationEvent {
    timeout(Duration::from_secs(10), receiver.recv())
        .await
        .expect("notification in time")
        .expect("topic open")
}

#[tokio::test]
async fn test_runs_produce_one_notification_each() {
    let dir = TempDir::new().unwrap();
    let settings = settings(write_worker(dir.path()));
    let definitions = vec![
        BackupDefinition::new("Documents", "s3://archive/documents").creating_destination(),
        BackupDefinition::new("Broken", "s3://archive/broken"),
    ];

    let state = build_desired_state(&definitions, &settings).unwrap();
    let substrate = InMemorySubstrate::new();
    apply(&state, &substrate).await.unwrap();

    let mut pipeline = start_pipeline(&state, &settings);
    for descriptor in &state.descriptors {
        pipeline
            .manager
            .enqueue(descriptor, &descriptor.run_label)
            .await
            .unwrap();
    }

    let mut received = vec![
        next_notification(&mut pipeline.notifications).await,
        next_notification(&mut pipeline.notifications).await,
    ];
    received.sort_by(|a, b| a.job_name.cmp(&b.job_name));

    assert_eq!(received[0].job_name, "backup-Broken-backup");
    assert_eq!(received[0].terminal_status, TerminalStatus::Failed);
    assert_eq!(received[0].subject, "backup job backup-Broken-backup FAILED");
    assert_eq!(received[0].raw_detail["container"]["exitCode"], 3);

    assert_eq!(received[1].terminal_status, TerminalStatus::Succeeded);
    assert!(received[1]
        .subject
        .ends_with("backup-Documents-backup SUCCEEDED"));

    let message: Value = serde_json::from_str(&received[1].message).unwrap();
    assert_eq!(message["detail"]["jobDefinition"], "backup-Documents-backup-job");

    // RUNNABLE and RUNNING transitions never reach the topic
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pipeline.notifications.try_recv().is_err());

    let _ = pipeline.shutdown.send(());
}

#[tokio::test]
async fn test_armed_trigger_fires_and_notifies() {
    let dir = TempDir::new().unwrap();
    let settings = settings(write_worker(dir.path()));
    let definitions = vec![
        BackupDefinition::new("Documents", "s3://archive/documents").with_schedule("* * * * * *"),
        BackupDefinition::new("Photos", "s3://archive/photos"),
    ];

    let state = build_desired_state(&definitions, &settings).unwrap();
    let scheduler = state.arm_triggers().unwrap();
    assert_eq!(scheduler.state("backup-Photos-backup-job"), TriggerState::Unarmed);

    let mut pipeline = start_pipeline(&state, &settings);
    let engine = Arc::new(TriggerEngine::new(
        EngineConfig {
            tick_interval_ms: 100,
        },
        Arc::new(scheduler),
        pipeline.manager.clone(),
    ));
    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });

    let notification = next_notification(&mut pipeline.notifications).await;
    assert_eq!(notification.job_name, "backup-Documents-backup");
    assert_eq!(notification.terminal_status, TerminalStatus::Succeeded);

    engine.stop();
    running.await.unwrap();
    let _ = pipeline.shutdown.send(());
}

#[tokio::test]
async fn test_unscheduled_definition_is_never_enqueued() {
    let definitions = vec![
        BackupDefinition::new("Documents", "s3://archive/documents").with_schedule("0 0 3 * * *"),
        BackupDefinition::new("Photos", "s3://archive/photos"),
    ];
    let settings = settings("true".to_string());
    let state = build_desired_state(&definitions, &settings).unwrap();

    let pipeline = start_pipeline(&state, &settings);
    let engine = TriggerEngine::new(
        EngineConfig::default(),
        Arc::new(state.arm_triggers().unwrap()),
        pipeline.manager.clone(),
    );

    let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    assert_eq!(engine.fire_due(from, to).await, 3);

    let _ = pipeline.shutdown.send(());
}

#[tokio::test]
async fn test_rebuild_and_reapply_are_stable() {
    let definitions = vec![
        BackupDefinition::new("Documents", "s3://archive/documents")
            .with_schedule("0 0 3 * * *")
            .with_secret("REFRESH_TOKEN", "arn:secret:drive")
            .creating_destination(),
        BackupDefinition::new("Photos", "s3://archive/photos").with_schedule("0 0 4 * * *"),
    ];
    let settings = Settings::default();

    let first = build_desired_state(&definitions, &settings).unwrap();
    let second = build_desired_state(&definitions, &settings).unwrap();
    assert_eq!(first.render_manifest().unwrap(), second.render_manifest().unwrap());

    let substrate = InMemorySubstrate::new();
    apply(&first, &substrate).await.unwrap();
    let applied = substrate.snapshot().await;
    apply(&second, &substrate).await.unwrap();
    assert_eq!(substrate.snapshot().await, applied);

    let operations = substrate.operations().await;
    let count = |wanted: &str| operations.iter().filter(|op| op.as_str() == wanted).count();
    assert_eq!(count("create_bucket:archive"), 2, "one create per apply for the shared bucket");
    assert_eq!(
        count("grant:backup-batch-job-role:put_object:archive"),
        2,
        "one write grant per apply for the shared bucket"
    );
    assert_eq!(applied.owned_buckets, vec!["archive".to_string()]);
}

#[test]
fn test_duplicate_source_ids_abort_build() {
    let definitions = vec![
        BackupDefinition::new("Documents", "s3://archive/a").with_schedule("0 0 3 * * *"),
        BackupDefinition::new("Documents", "s3://archive/b").with_schedule("0 0 5 * * *"),
    ];
    let err = build_desired_state(&definitions, &Settings::default()).unwrap_err();
    assert!(matches!(err, ConfigurationError::DuplicateJobName { .. }));
}
