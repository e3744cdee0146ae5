// JetStream-backed job submitter

use crate::errors::QueueError;
use crate::models::{QueueEntry, ResourceRequest, SecretRef};
use crate::queue::nats::NatsClient;
use crate::queue::JobSubmitter;
use async_nats::jetstream::context::PublishAckFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Message format for a queued run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub handle_id: Uuid,
    pub job_definition: String,
    pub job_name: String,
    pub queue: String,
    pub command: Vec<String>,
    pub image: String,
    pub resources: ResourceRequest,
    pub secrets: Vec<SecretRef>,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl From<&QueueEntry> for JobMessage {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            handle_id: entry.handle.id,
            job_definition: entry.handle.job_name.clone(),
            job_name: entry.handle.run_label.clone(),
            queue: entry.handle.queue.clone(),
            command: entry.command.clone(),
            image: entry.image.clone(),
            resources: entry.resources,
            secrets: entry.secrets.clone(),
            enqueued_at: entry.enqueued_at,
        }
    }
}

/// Submits runs to a JetStream work-queue stream
///
/// The handle id doubles as the `Nats-Msg-Id`, so the server only
/// deduplicates client retries of the same publish. Every firing gets a
/// fresh handle and is never deduplicated against an earlier one.
pub struct NatsJobSubmitter {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsJobSubmitter {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
        }
    }

    fn subject_for(&self, entry: &QueueEntry) -> String {
        format!(
            "{}.{}.{}",
            self.client.config().subject_prefix,
            entry.handle.queue,
            entry.handle.job_name
        )
    }
}

fn publish_headers(entry: &QueueEntry) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert("Nats-Msg-Id", entry.handle.id.to_string().as_str());
    headers.insert("Job-Definition", entry.handle.job_name.as_str());
    headers
}

#[async_trait::async_trait]
impl JobSubmitter for NatsJobSubmitter {
    #[instrument(skip(self, entry), fields(
        handle_id = %entry.handle.id,
        job_name = %entry.handle.job_name,
        queue = %entry.handle.queue
    ))]
    async fn submit(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let message = JobMessage::from(&entry);
        let payload = serde_json::to_vec(&message).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize job message: {}", e))
        })?;

        let subject = self.subject_for(&entry);

        let headers = publish_headers(&entry);
        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(_ack)) => {
                info!(subject = %subject, "Run submitted to queue");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
