// Provisioner binary entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::config::Settings;
use common::errors::OrchestrationError;
use common::orchestrator::{build_and_apply, build_desired_state, DesiredState};
use common::queue::{
    local_compute_queue, ComputeQueueManager, JobSubmitter, NatsClient, NatsJobSubmitter,
};
use common::router::{publishers_from_config, EventSource};
use common::scheduler::{EngineConfig, TriggerEngine};
use common::storage::ManifestStore;
use common::substrate::ManifestSubstrate;
use common::telemetry;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Lifecycle events buffered for the completion router
const EVENT_BUFFER: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "provisioner", version, about = "Provision and run the backup pipeline")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config", global = true)]
    config_dir: PathBuf,

    /// Configuration file layered over the directory files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the desired state as JSON
    Plan,
    /// Render the manifest and publish it
    Apply {
        /// Overrides manifest.output_path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fire armed triggers on this host and route completion events
    RunLocal {
        /// Submit runs to the JetStream queue instead of running them here
        #[arg(long)]
        nats: bool,
        /// Enqueue these source ids once at startup
        #[arg(long = "run-now", value_name = "SOURCE_ID")]
        run_now: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir, cli.config.as_deref())
        .context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!(
        backups = settings.backups.len(),
        config_dir = %cli.config_dir.display(),
        "Configuration loaded"
    );

    let result = match cli.command {
        Command::Plan => desired_state(&settings).and_then(|state| plan(&state)),
        Command::Apply { output } => apply_manifest(&settings, output).await,
        Command::RunLocal { nats, run_now } => match desired_state(&settings) {
            Ok(state) => run_local(state, &settings, nats, &run_now).await,
            Err(e) => Err(e),
        },
    };

    telemetry::shutdown_tracer();
    result
}

fn desired_state(settings: &Settings) -> Result<DesiredState> {
    build_desired_state(&settings.backups, settings).map_err(|e| {
        error!(error = %e, "Invalid backup configuration");
        OrchestrationError::from(e).into()
    })
}

fn plan(state: &DesiredState) -> Result<()> {
    println!("{}", state.render_manifest()?);
    Ok(())
}

async fn apply_manifest(settings: &Settings, output: Option<PathBuf>) -> Result<()> {
    let substrate = ManifestSubstrate::new();
    let state = build_and_apply(&settings.backups, settings, &substrate)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to apply desired state");
            e
        })?;

    let path = output.unwrap_or_else(|| PathBuf::from(&settings.manifest.output_path));
    substrate.write_to(&path).await?;

    if let Some(bucket) = &settings.manifest.s3 {
        let store = ManifestStore::new(bucket)?;
        substrate.publish(&store).await?;
        info!(bucket = %bucket.bucket, key = %store.key(), "Manifest published");
    }

    info!(
        path = %path.display(),
        descriptors = state.descriptors.len(),
        "Desired state applied"
    );
    Ok(())
}

async fn run_local(
    state: DesiredState,
    settings: &Settings,
    use_nats: bool,
    run_now: &[String],
) -> Result<()> {
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let source = EventSource::from_config(&settings.notifications);
    let (events_tx, _) = broadcast::channel::<Value>(EVENT_BUFFER);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let nats = if use_nats {
        let client = NatsClient::connect(settings.nats.clone()).await?;
        client.initialize_stream().await?;
        Some(client)
    } else {
        None
    };

    let submitter: Arc<dyn JobSubmitter> = match &nats {
        Some(client) => {
            tokio::spawn(forward_remote_events(
                client.client().clone(),
                settings.nats.event_subject.clone(),
                events_tx.clone(),
            ));
            Arc::new(NatsJobSubmitter::new(client.clone()))
        }
        None => {
            let (queue, dispatcher) = local_compute_queue(
                &state.compute_pool,
                &state.job_queue,
                source.clone(),
                events_tx.clone(),
            );
            tokio::spawn(dispatcher.run());
            Arc::new(queue)
        }
    };

    let publishers = publishers_from_config(
        &settings.notifications,
        nats.as_ref().map(|client| client.client().clone()),
    )?;
    let router = state
        .completion_router(&settings.orchestrator.component)
        .with_publishers(publishers);
    let router_task = tokio::spawn(router.run(events_tx.subscribe(), shutdown_tx.subscribe()));

    let manager = ComputeQueueManager::new(
        state.compute_pool.clone(),
        state.job_queue.clone(),
        submitter,
    );

    for source_id in run_now {
        let Some(descriptor) = state
            .descriptors
            .iter()
            .find(|descriptor| &descriptor.source_id == source_id)
        else {
            bail!("No backup definition with source id '{}'", source_id);
        };
        manager.enqueue(descriptor, &descriptor.run_label).await?;
    }

    let scheduler = Arc::new(state.arm_triggers()?);
    let engine = Arc::new(TriggerEngine::new(
        EngineConfig::default(),
        scheduler,
        manager,
    ));

    let engine_for_shutdown = engine.clone();
    let shutdown_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        engine_for_shutdown.stop();
        let _ = shutdown_for_signal.send(());
    });

    engine.start().await;
    if let Err(e) = router_task.await {
        warn!(error = %e, "Completion router task ended abnormally");
    }

    info!("Local runtime stopped");
    Ok(())
}

/// Relay lifecycle events published by remote workers into the router channel
async fn forward_remote_events(
    client: async_nats::Client,
    subject: String,
    events: broadcast::Sender<Value>,
) {
    let mut subscriber = match client.subscribe(subject.clone()).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(subject = %subject, error = %e, "Failed to subscribe to lifecycle events");
            return;
        }
    };

    info!(subject = %subject, "Listening for remote lifecycle events");
    while let Some(message) = subscriber.next().await {
        match serde_json::from_slice::<Value>(&message.payload) {
            Ok(event) => {
                let _ = events.send(event);
            }
            Err(e) => warn!(subject = %subject, error = %e, "Discarding malformed lifecycle event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_local_flags() {
        let cli = Cli::try_parse_from([
            "provisioner",
            "run-local",
            "--nats",
            "--run-now",
            "Documents",
            "--run-now",
            "Photos",
        ])
        .unwrap();
        match cli.command {
            Command::RunLocal { nats, run_now } => {
                assert!(nats);
                assert_eq!(run_now, vec!["Documents", "Photos"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["provisioner", "apply", "--config", "backups.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("backups.toml")));
        assert!(matches!(cli.command, Command::Apply { output: None }));
    }

    #[tokio::test]
    async fn test_apply_manifest_writes_output() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("backups.toml");
        fs::write(
            &config_path,
            r#"
[[backups]]
source_id = "Documents"
destination_url = "s3://archive/documents"
schedule = "0 0 3 * * *"
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path(), Some(&config_path)).unwrap();
        let output = dir.path().join("desired-state.json");
        apply_manifest(&settings, Some(output.clone())).await.unwrap();

        let written = fs::read_to_string(output).unwrap();
        assert!(written.contains("backup-Documents-backup-job"));
        assert!(written.contains("run-backup-Documents-backup"));
    }

    #[tokio::test]
    async fn test_apply_manifest_rejects_bad_destination_without_writing() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("backups.toml");
        fs::write(
            &config_path,
            r#"
[[backups]]
source_id = "Documents"
destination_url = "gs://archive/documents"
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path(), Some(&config_path)).unwrap();
        let output = dir.path().join("desired-state.json");
        let err = apply_manifest(&settings, Some(output.clone()))
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<OrchestrationError>().is_some());
        assert!(!output.exists());
    }
}
