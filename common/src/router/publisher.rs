// Fan-out channel delivery

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::NotificationEvent;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

const WEBHOOK_TIMEOUT_SECONDS: u64 = 10;

/// One delivery path for notification events
///
/// Publishing is attempted once; callers log failures and move on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Label used in logs and metrics
    fn channel(&self) -> String;

    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// Writes notifications to the log
///
/// Stands in for email subscriptions when running locally.
pub struct LogPublisher {
    recipient: Option<String>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self { recipient: None }
    }

    pub fn for_recipient(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
        }
    }
}

impl Default for LogPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationPublisher for LogPublisher {
    fn channel(&self) -> String {
        match &self.recipient {
            Some(recipient) => format!("log:{}", recipient),
            None => "log".to_string(),
        }
    }

    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        info!(
            recipient = self.recipient.as_deref().unwrap_or("-"),
            subject = %event.subject,
            message = %event.message,
            "Job notification"
        );
        Ok(())
    }
}

/// In-process topic; every subscriber gets every event
#[derive(Clone)]
pub struct BroadcastTopic {
    name: String,
    sender: broadcast::Sender<NotificationEvent>,
}

impl BroadcastTopic {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationPublisher for BroadcastTopic {
    fn channel(&self) -> String {
        format!("topic:{}", self.name)
    }

    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(topic = %self.name, receivers, "Notification broadcast"),
            Err(_) => debug!(topic = %self.name, "Topic has no subscribers"),
        }
        Ok(())
    }
}

/// Publishes notifications as JSON on a core NATS subject
pub struct NatsTopicPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsTopicPublisher {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl NotificationPublisher for NatsTopicPublisher {
    fn channel(&self) -> String {
        format!("nats:{}", self.subject)
    }

    #[instrument(skip(self, event), fields(subject = %self.subject, job_name = %event.job_name))]
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NotificationError::PublishFailed(format!("NATS publish failed: {}", e)))
    }
}

/// POSTs each notification as JSON to an HTTP endpoint
pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout_seconds: u64) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                NotificationError::PublishFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationPublisher for WebhookPublisher {
    fn channel(&self) -> String {
        format!("webhook:{}", self.url)
    }

    #[instrument(skip(self, event), fields(url = %self.url, job_name = %event.job_name))]
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotificationError::PublishFailed(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::PublishFailed(format!(
                "Webhook responded with {}",
                status
            )));
        }
        Ok(())
    }
}

/// Publishers for every subscription in `config`
///
/// A NATS subscription without a connected client is an error rather than a
/// channel that never delivers.
pub fn publishers_from_config(
    config: &NotificationConfig,
    nats: Option<async_nats::Client>,
) -> Result<Vec<Arc<dyn NotificationPublisher>>, NotificationError> {
    let mut publishers: Vec<Arc<dyn NotificationPublisher>> = vec![Arc::new(LogPublisher::new())];

    if let Some(email) = &config.email {
        publishers.push(Arc::new(LogPublisher::for_recipient(email.clone())));
    }
    if let Some(url) = &config.webhook_url {
        publishers.push(Arc::new(WebhookPublisher::new(
            url.clone(),
            WEBHOOK_TIMEOUT_SECONDS,
        )?));
    }
    if let Some(subject) = &config.nats_subject {
        let Some(client) = nats else {
            warn!(subject = %subject, "NATS notification subject configured without a NATS connection");
            return Err(NotificationError::ChannelUnavailable(format!("nats:{}", subject)));
        };
        publishers.push(Arc::new(NatsTopicPublisher::new(client, subject.clone())));
    }

    Ok(publishers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminalStatus;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> NotificationEvent {
        NotificationEvent {
            job_name: "backup-Documents-backup".to_string(),
            terminal_status: TerminalStatus::Succeeded,
            subject: "backup job backup-Documents-backup SUCCEEDED".to_string(),
            message: r#"{"detail":{"status":"SUCCEEDED"}}"#.to_string(),
            raw_detail: json!({"status": "SUCCEEDED"}),
        }
    }

    #[tokio::test]
    async fn test_broadcast_topic_reaches_every_subscriber() {
        let topic = BroadcastTopic::new("backup-job-notifications", 8);
        let mut first = topic.subscribe();
        let mut second = topic.subscribe();

        topic.publish(&event()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), event());
        assert_eq!(second.recv().await.unwrap(), event());
    }

    #[tokio::test]
    async fn test_broadcast_topic_without_subscribers_is_ok() {
        let topic = BroadcastTopic::new("backup-job-notifications", 8);
        assert!(topic.publish(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_posts_event_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/backup"))
            .and(body_json(serde_json::to_value(event()).unwrap()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new(format!("{}/hooks/backup", server.uri()), 5).unwrap();
        publisher.publish(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_publish_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new(server.uri(), 5).unwrap();
        let err = publisher.publish(&event()).await.unwrap_err();
        assert!(matches!(err, NotificationError::PublishFailed(_)));
    }

    #[test]
    fn test_publishers_from_config() {
        let config = NotificationConfig {
            email: Some("ops@example.com".to_string()),
            webhook_url: Some("http://localhost:9000/hook".to_string()),
            ..NotificationConfig::default()
        };

        let channels: Vec<String> = publishers_from_config(&config, None)
            .unwrap()
            .iter()
            .map(|publisher| publisher.channel())
            .collect();
        assert_eq!(
            channels,
            vec![
                "log",
                "log:ops@example.com",
                "webhook:http://localhost:9000/hook"
            ]
        );
    }

    #[test]
    fn test_nats_subject_without_connection_is_rejected() {
        let config = NotificationConfig {
            nats_subject: Some("backup.notifications".to_string()),
            ..NotificationConfig::default()
        };

        let err = match publishers_from_config(&config, None) {
            Ok(_) => panic!("NATS subject accepted without a connection"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            NotificationError::ChannelUnavailable(ref channel) if channel == "nats:backup.notifications"
        ));
    }
}
