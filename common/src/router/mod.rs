// Completion router: terminal lifecycle events to the fan-out channel

pub mod event;
pub mod publisher;

pub use event::{canonical_json, job_definition_name, EventRecord, EventSource};
pub use publisher::{
    publishers_from_config, BroadcastTopic, LogPublisher, NatsTopicPublisher,
    NotificationPublisher, WebhookPublisher,
};

use crate::descriptor::bounded;
use crate::errors::NotificationError;
use crate::models::{JobDescriptor, ListenerRule, NotificationEvent, TerminalStatus};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

const TERMINAL_STATUSES: [TerminalStatus; 2] = [TerminalStatus::Failed, TerminalStatus::Succeeded];

/// Listener rule name derived from the descriptor it watches
pub fn derive_listener_name(descriptor: &JobDescriptor) -> String {
    bounded(
        format!("{}-status-change", descriptor.name),
        &descriptor.source_id,
    )
}

/// The listener installed for `descriptor`
pub fn listener_for(descriptor: &JobDescriptor, source: &EventSource, topic: &str) -> ListenerRule {
    ListenerRule {
        name: derive_listener_name(descriptor),
        job_definition: descriptor.name.clone(),
        event_source: source.source.clone(),
        detail_type: source.detail_type.clone(),
        statuses: TERMINAL_STATUSES.to_vec(),
        topic: topic.to_string(),
    }
}

impl ListenerRule {
    /// Whether an event described by `record` is delivered through this rule
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.source == self.event_source
            && record.detail_type == self.detail_type
            && record.job_definition_name() == self.job_definition
            && record
                .status
                .terminal()
                .is_some_and(|status| self.statuses.contains(&status))
    }
}

/// Turn a matched terminal event into its notification
///
/// Pure: the same event always yields the same notification.
pub fn transform(
    component: &str,
    record: &EventRecord,
    event: &Value,
) -> Result<NotificationEvent, NotificationError> {
    let terminal_status = record.status.terminal().ok_or_else(|| {
        NotificationError::InvalidEvent(format!("{} is not a terminal status", record.status))
    })?;
    let job_name = record
        .job_name
        .clone()
        .unwrap_or_else(|| record.job_definition_name().to_string());

    Ok(NotificationEvent {
        subject: format!("{} job {} {}", component, job_name, terminal_status),
        message: canonical_json(event)?,
        raw_detail: event.get("detail").cloned().unwrap_or(Value::Null),
        job_name,
        terminal_status,
    })
}

/// What happened to one lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// No listener matched, or the event was not a terminal transition
    Ignored,
    Routed {
        event: NotificationEvent,
        delivered: usize,
        failed: usize,
    },
}

/// Matches lifecycle events against the installed listeners and publishes
/// one notification per terminal transition
pub struct CompletionRouter {
    component: String,
    listeners: Vec<ListenerRule>,
    publishers: Vec<Arc<dyn NotificationPublisher>>,
}

impl CompletionRouter {
    pub fn new(component: impl Into<String>, listeners: Vec<ListenerRule>) -> Self {
        Self {
            component: component.into(),
            listeners,
            publishers: Vec::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_publishers(
        mut self,
        publishers: impl IntoIterator<Item = Arc<dyn NotificationPublisher>>,
    ) -> Self {
        self.publishers.extend(publishers);
        self
    }

    pub fn listeners(&self) -> &[ListenerRule] {
        &self.listeners
    }

    /// The notification `event` produces, if any listener matches it
    pub fn evaluate(&self, event: &Value) -> Option<NotificationEvent> {
        let record = match EventRecord::from_value(event) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized event");
                return None;
            }
        };

        let listener = self.listeners.iter().find(|rule| rule.matches(&record))?;
        match transform(&self.component, &record, event) {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!(listener = %listener.name, error = %e, "Failed to build notification");
                None
            }
        }
    }

    /// Publish the notification for `event` to every channel, once
    #[instrument(skip(self, event))]
    pub async fn route(&self, event: &Value) -> RouteOutcome {
        let Some(notification) = self.evaluate(event) else {
            return RouteOutcome::Ignored;
        };

        let mut delivered = 0;
        let mut failed = 0;
        for publisher in &self.publishers {
            let channel = publisher.channel();
            match publisher.publish(&notification).await {
                Ok(()) => {
                    delivered += 1;
                    counter!("backup_notifications_published_total", "channel" => channel)
                        .increment(1);
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        channel = %channel,
                        job_name = %notification.job_name,
                        error = %e,
                        "Failed to deliver notification"
                    );
                    counter!("backup_notifications_failed_total", "channel" => channel)
                        .increment(1);
                }
            }
        }

        info!(
            subject = %notification.subject,
            delivered,
            failed,
            "Notification routed"
        );
        RouteOutcome::Routed {
            event: notification,
            delivered,
            failed,
        }
    }

    /// Route events from `events` until shutdown or the channel closes
    pub async fn run(
        self,
        mut events: broadcast::Receiver<Value>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(listeners = self.listeners.len(), "Completion router started");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        self.route(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Completion router lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping completion router");
                    break;
                }
            }
        }

        info!("Completion router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::publisher::MockNotificationPublisher;
    use super::*;
    use crate::models::{ResourceRequest, SecretRef};
    use serde_json::json;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            name: "backup-Documents-backup-job".to_string(),
            source_id: "Documents".to_string(),
            run_label: "backup-Documents-backup".to_string(),
            command: vec!["/back-up-folder".to_string()],
            image: "backup-worker:latest".to_string(),
            resources: ResourceRequest::default(),
            secrets: Vec::<SecretRef>::new(),
            execution_role: "exec".to_string(),
            job_role: "job".to_string(),
            bucket: "archive".to_string(),
            platform: "FARGATE".to_string(),
            assign_public_ip: true,
        }
    }

    fn source() -> EventSource {
        EventSource::new("aws.batch", "Batch Job State Change")
    }

    fn event(status: &str, job_definition: &str) -> Value {
        json!({
            "detail-type": "Batch Job State Change",
            "source": "aws.batch",
            "detail": {
                "status": status,
                "jobDefinition": job_definition,
                "jobName": "backup-Documents-backup",
                "jobId": "1f0c6b7e"
            }
        })
    }

    fn router() -> CompletionRouter {
        CompletionRouter::new(
            "backup",
            vec![listener_for(&descriptor(), &source(), "backup-job-notifications")],
        )
    }

    #[test]
    fn test_listener_watches_terminal_statuses_only() {
        let rule = listener_for(&descriptor(), &source(), "topic");
        assert_eq!(rule.name, "backup-Documents-backup-job-status-change");
        assert_eq!(rule.statuses, vec![TerminalStatus::Failed, TerminalStatus::Succeeded]);
    }

    #[test]
    fn test_running_event_is_ignored() {
        assert!(router()
            .evaluate(&event("RUNNING", "backup-Documents-backup-job"))
            .is_none());
    }

    #[test]
    fn test_other_descriptor_is_ignored() {
        assert!(router()
            .evaluate(&event("SUCCEEDED", "backup-Photos-backup-job"))
            .is_none());
    }

    #[test]
    fn test_other_source_is_ignored() {
        let mut foreign = event("SUCCEEDED", "backup-Documents-backup-job");
        foreign["source"] = json!("aws.ecs");
        assert!(router().evaluate(&foreign).is_none());
    }

    #[test]
    fn test_arn_reference_matches() {
        let notification = router()
            .evaluate(&event(
                "FAILED",
                "arn:aws:batch:eu-west-1:123456789012:job-definition/backup-Documents-backup-job:4",
            ))
            .unwrap();
        assert_eq!(notification.terminal_status, TerminalStatus::Failed);
    }

    #[test]
    fn test_transform_builds_subject_and_sorted_message() {
        let raw = event("SUCCEEDED", "backup-Documents-backup-job");
        let notification = router().evaluate(&raw).unwrap();

        assert_eq!(
            notification.subject,
            "backup job backup-Documents-backup SUCCEEDED"
        );
        assert!(notification.subject.ends_with("backup-Documents-backup SUCCEEDED"));
        assert_eq!(notification.job_name, "backup-Documents-backup");
        assert!(notification.message.starts_with(r#"{"detail":{"jobDefinition""#));
        assert_eq!(notification.raw_detail, raw["detail"]);
        assert_eq!(router().evaluate(&raw).unwrap(), notification);
    }

    #[tokio::test]
    async fn test_terminal_event_published_exactly_once() {
        let mut publisher = MockNotificationPublisher::new();
        publisher.expect_channel().return_const("mock".to_string());
        publisher
            .expect_publish()
            .withf(|event| event.subject == "backup job backup-Documents-backup FAILED")
            .times(1)
            .returning(|_| Ok(()));

        let router = router().with_publisher(Arc::new(publisher));
        let outcome = router
            .route(&event("FAILED", "backup-Documents-backup-job"))
            .await;
        assert!(matches!(
            outcome,
            RouteOutcome::Routed {
                delivered: 1,
                failed: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ignored_event_is_not_published() {
        let mut publisher = MockNotificationPublisher::new();
        publisher.expect_channel().return_const("mock".to_string());
        publisher.expect_publish().times(0);

        let router = router().with_publisher(Arc::new(publisher));
        let outcome = router
            .route(&event("RUNNING", "backup-Documents-backup-job"))
            .await;
        assert_eq!(outcome, RouteOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_retried() {
        let mut failing = MockNotificationPublisher::new();
        failing.expect_channel().return_const("failing".to_string());
        failing
            .expect_publish()
            .times(1)
            .returning(|_| Err(NotificationError::PublishFailed("unreachable".to_string())));

        let mut healthy = MockNotificationPublisher::new();
        healthy.expect_channel().return_const("healthy".to_string());
        healthy.expect_publish().times(1).returning(|_| Ok(()));

        let router = router()
            .with_publisher(Arc::new(failing))
            .with_publisher(Arc::new(healthy));
        let outcome = router
            .route(&event("SUCCEEDED", "backup-Documents-backup-job"))
            .await;
        assert!(matches!(
            outcome,
            RouteOutcome::Routed {
                delivered: 1,
                failed: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let topic = BroadcastTopic::new("backup-job-notifications", 8);
        let mut notifications = topic.subscribe();

        let handle = tokio::spawn(
            router()
                .with_publisher(Arc::new(topic))
                .run(events_rx, shutdown_rx),
        );

        events_tx
            .send(event("SUCCEEDED", "backup-Documents-backup-job"))
            .unwrap();
        let received = notifications.recv().await.unwrap();
        assert_eq!(received.terminal_status, TerminalStatus::Succeeded);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
