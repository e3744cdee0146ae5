// In-process compute queue
//
// Entries are admitted strictly in submission order; an entry waits until the
// pool has enough free vCPUs for it, then runs the worker as a child process.

use crate::errors::QueueError;
use crate::models::{ComputePool, JobQueue, JobStatus, QueueEntry, SecretRef};
use crate::queue::JobSubmitter;
use crate::router::EventSource;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Secret locators of this form are read from the provisioner's environment
const ENV_LOCATOR_PREFIX: &str = "env:";

/// Submitting half of the local queue
#[derive(Clone)]
pub struct LocalComputeQueue {
    name: String,
    sender: mpsc::UnboundedSender<QueueEntry>,
}

#[async_trait::async_trait]
impl JobSubmitter for LocalComputeQueue {
    async fn submit(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.sender
            .send(entry)
            .map_err(|_| QueueError::Closed(self.name.clone()))
    }
}

/// Admits queued entries to the pool and runs them
pub struct LocalDispatcher {
    receiver: mpsc::UnboundedReceiver<QueueEntry>,
    capacity: Arc<Semaphore>,
    max_vcpus: u32,
    events: broadcast::Sender<Value>,
    source: EventSource,
}

/// Create a local queue bound to `pool`, emitting lifecycle events on `events`
pub fn local_compute_queue(
    pool: &ComputePool,
    queue: &JobQueue,
    source: EventSource,
    events: broadcast::Sender<Value>,
) -> (LocalComputeQueue, LocalDispatcher) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let max_vcpus = pool.max_vcpus.max(1);

    let submitter = LocalComputeQueue {
        name: queue.name.clone(),
        sender,
    };
    let dispatcher = LocalDispatcher {
        receiver,
        capacity: Arc::new(Semaphore::new(max_vcpus as usize)),
        max_vcpus,
        events,
        source,
    };
    (submitter, dispatcher)
}

impl LocalDispatcher {
    /// Run until every submitter has been dropped
    ///
    /// Runs already admitted keep going after this returns.
    pub async fn run(mut self) {
        info!(max_vcpus = self.max_vcpus, "Local dispatcher started");

        while let Some(entry) = self.receiver.recv().await {
            emit(&self.events, &self.source, &entry, JobStatus::Runnable, None, None);

            let vcpus = entry.resources.vcpus.clamp(1, self.max_vcpus);
            let permit = match self.capacity.clone().acquire_many_owned(vcpus).await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Compute pool closed, dropping remaining entries");
                    break;
                }
            };

            let events = self.events.clone();
            let source = self.source.clone();
            tokio::spawn(async move {
                execute(&entry, &source, &events).await;
                drop(permit);
            });
        }

        info!("Local dispatcher stopped");
    }
}

#[instrument(skip_all, fields(handle_id = %entry.handle.id, job_name = %entry.handle.job_name))]
async fn execute(entry: &QueueEntry, source: &EventSource, events: &broadcast::Sender<Value>) {
    emit(events, source, entry, JobStatus::Running, None, None);

    match spawn_worker(entry).await {
        Ok(status) if status.success() => {
            info!("Run succeeded");
            emit(events, source, entry, JobStatus::Succeeded, status.code(), None);
        }
        Ok(status) => {
            let reason = match status.code() {
                Some(code) => format!("Worker exited with code {}", code),
                None => "Worker terminated by signal".to_string(),
            };
            warn!(reason = %reason, "Run failed");
            emit(
                events,
                source,
                entry,
                JobStatus::Failed,
                status.code(),
                Some(&reason),
            );
        }
        Err(e) => {
            let reason = format!("Failed to start worker: {}", e);
            error!(reason = %reason, "Run failed");
            emit(events, source, entry, JobStatus::Failed, None, Some(&reason));
        }
    }
}

async fn spawn_worker(entry: &QueueEntry) -> std::io::Result<ExitStatus> {
    let (program, args) = entry.command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    for secret in &entry.secrets {
        if let Some(value) = resolve_secret(secret) {
            command.env(&secret.name, value);
        }
    }

    command.status().await
}

fn resolve_secret(secret: &SecretRef) -> Option<String> {
    let Some(variable) = secret.locator.strip_prefix(ENV_LOCATOR_PREFIX) else {
        debug!(secret = %secret.name, "Secret locator not resolvable locally, skipping");
        return None;
    };
    match std::env::var(variable) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(secret = %secret.name, variable = %variable, "Secret variable not set");
            None
        }
    }
}

fn emit(
    events: &broadcast::Sender<Value>,
    source: &EventSource,
    entry: &QueueEntry,
    status: JobStatus,
    exit_code: Option<i32>,
    reason: Option<&str>,
) {
    let event = source.state_change(entry, status, exit_code, reason);
    if events.send(event).is_err() {
        debug!(status = %status, "No lifecycle event subscribers");
    }
}
