// Lifecycle events as emitted by the compute substrate

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::{JobStatus, QueueEntry};
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

const JOB_DEFINITION_MARKER: &str = ":job-definition/";

/// Identifies which events come from the compute substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub source: String,
    pub detail_type: String,
}

impl EventSource {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.event_source.clone(), config.detail_type.clone())
    }

    /// Build the state-change event the substrate would emit for `entry`
    pub fn state_change(
        &self,
        entry: &QueueEntry,
        status: JobStatus,
        exit_code: Option<i32>,
        reason: Option<&str>,
    ) -> Value {
        let mut container = Map::new();
        container.insert("command".to_string(), json!(entry.command));
        if let Some(code) = exit_code {
            container.insert("exitCode".to_string(), json!(code));
        }

        let mut detail = Map::new();
        detail.insert("jobName".to_string(), json!(entry.handle.run_label));
        detail.insert("jobId".to_string(), json!(entry.handle.id.to_string()));
        detail.insert("jobQueue".to_string(), json!(entry.handle.queue));
        detail.insert("jobDefinition".to_string(), json!(entry.handle.job_name));
        detail.insert("status".to_string(), json!(status.as_str()));
        if let Some(reason) = reason {
            detail.insert("statusReason".to_string(), json!(reason));
        }
        detail.insert("container".to_string(), Value::Object(container));

        json!({
            "version": "0",
            "id": Uuid::new_v4().to_string(),
            "detail-type": self.detail_type,
            "source": self.source,
            "time": Utc::now().to_rfc3339(),
            "detail": Value::Object(detail),
        })
    }
}

/// The fields listener predicates look at, pulled out of a raw event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub source: String,
    pub detail_type: String,
    pub status: JobStatus,
    /// Job definition reference as it appeared in the event
    pub job_ref: String,
    pub job_name: Option<String>,
}

impl EventRecord {
    pub fn from_value(event: &Value) -> Result<Self, NotificationError> {
        let source = string_field(event, "source")?;
        let detail_type = string_field(event, "detail-type")?;
        let detail = event
            .get("detail")
            .filter(|detail| detail.is_object())
            .ok_or_else(|| NotificationError::InvalidEvent("missing detail object".to_string()))?;

        let status = match detail.get("status").and_then(Value::as_str) {
            Some(raw) => serde_json::from_value(Value::String(raw.to_string()))?,
            None => {
                return Err(NotificationError::InvalidEvent(
                    "missing detail.status".to_string(),
                ))
            }
        };
        let job_ref = detail
            .get("jobDefinition")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NotificationError::InvalidEvent("missing detail.jobDefinition".to_string())
            })?
            .to_string();
        let job_name = detail
            .get("jobName")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            source,
            detail_type,
            status,
            job_ref,
            job_name,
        })
    }

    /// Descriptor name referenced by the event
    pub fn job_definition_name(&self) -> &str {
        job_definition_name(&self.job_ref)
    }
}

fn string_field(event: &Value, field: &str) -> Result<String, NotificationError> {
    event
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| NotificationError::InvalidEvent(format!("missing {}", field)))
}

/// Strip an ARN-style prefix and revision from a job definition reference
///
/// `arn:aws:batch:eu-west-1:123:job-definition/docs-backup-job:3` and
/// `docs-backup-job` both yield `docs-backup-job`.
pub fn job_definition_name(job_ref: &str) -> &str {
    match job_ref.rfind(JOB_DEFINITION_MARKER) {
        Some(index) => {
            let rest = &job_ref[index + JOB_DEFINITION_MARKER.len()..];
            rest.split(':').next().unwrap_or(rest)
        }
        None => job_ref,
    }
}

/// Serialize `value` with every object's keys in sorted order
pub fn canonical_json(value: &Value) -> Result<String, NotificationError> {
    Ok(serde_json::to_string(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobHandle, ResourceRequest};

    fn entry() -> QueueEntry {
        QueueEntry {
            handle: JobHandle {
                id: Uuid::new_v4(),
                job_name: "backup-Documents-backup-job".to_string(),
                run_label: "backup-Documents-backup".to_string(),
                queue: "default-job-queue".to_string(),
            },
            command: vec!["/back-up-folder".to_string(), "Documents".to_string()],
            image: "backup-worker:latest".to_string(),
            resources: ResourceRequest::default(),
            secrets: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_change_round_trips_into_record() {
        let source = EventSource::new("aws.batch", "Batch Job State Change");
        let event = source.state_change(&entry(), JobStatus::Failed, Some(2), Some("exit 2"));

        let record = EventRecord::from_value(&event).unwrap();
        assert_eq!(record.source, "aws.batch");
        assert_eq!(record.detail_type, "Batch Job State Change");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.job_definition_name(), "backup-Documents-backup-job");
        assert_eq!(record.job_name.as_deref(), Some("backup-Documents-backup"));
        assert_eq!(event["detail"]["container"]["exitCode"], 2);
    }

    #[test]
    fn test_job_definition_name_strips_arn_and_revision() {
        assert_eq!(
            job_definition_name("arn:aws:batch:eu-west-1:123456789012:job-definition/docs-job:7"),
            "docs-job"
        );
        assert_eq!(
            job_definition_name("arn:aws:batch:eu-west-1:123456789012:job-definition/docs-job"),
            "docs-job"
        );
        assert_eq!(job_definition_name("docs-job"), "docs-job");
    }

    #[test]
    fn test_record_rejects_event_without_detail() {
        let event = json!({"source": "aws.batch", "detail-type": "Batch Job State Change"});
        assert!(matches!(
            EventRecord::from_value(&event),
            Err(NotificationError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_unrecognized_status_is_unknown() {
        let event = json!({
            "source": "aws.batch",
            "detail-type": "Batch Job State Change",
            "detail": {"status": "SCALING", "jobDefinition": "docs-job"}
        });
        let record = EventRecord::from_value(&event).unwrap();
        assert_eq!(record.status, JobStatus::Unknown);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [{"y": 2, "x": 3}]}, "a": true});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":true,"b":{"a":[{"x":3,"y":2}],"z":1}}"#
        );
    }
}
