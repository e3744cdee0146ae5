use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Input Models
// ============================================================================

/// A named reference to a secret held by an external secret store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub locator: String,
}

/// BackupDefinition is one configured unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDefinition {
    /// Identifier of the content to back up, handed verbatim to the worker
    pub source_id: String,
    /// `s3://bucket[/path]`
    pub destination_url: String,
    #[serde(default)]
    pub create_destination_if_missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_refs: Vec<SecretRef>,
    /// Cron expression; absent means the job is only run on demand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// IANA timezone the schedule is evaluated in (UTC when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl BackupDefinition {
    pub fn new(source_id: impl Into<String>, destination_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_url: destination_url.into(),
            create_destination_if_missing: false,
            storage_class: None,
            secret_refs: Vec::new(),
            schedule: None,
            timezone: None,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, locator: impl Into<String>) -> Self {
        self.secret_refs.push(SecretRef {
            name: name.into(),
            locator: locator.into(),
        });
        self
    }

    pub fn creating_destination(mut self) -> Self {
        self.create_destination_if_missing = true;
        self
    }
}

// ============================================================================
// Shared Provisioning Handles
// ============================================================================

/// Identities shared by every job descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedIdentities {
    /// Reads secrets and submits to the queue on behalf of the job
    pub execution_role: String,
    /// Identity the running container assumes; gets storage write access
    pub job_role: String,
}

/// The single bounded compute pool every job runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputePool {
    pub name: String,
    pub platform: String,
    pub max_vcpus: u32,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeEnvironmentOrder {
    pub order: u32,
    pub compute_environment: String,
}

/// The single queue all job descriptors submit into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueue {
    pub name: String,
    pub priority: i32,
    pub compute_environment_order: Vec<ComputeEnvironmentOrder>,
}

// ============================================================================
// Derived Models
// ============================================================================

/// Resource request of a single job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub vcpus: u32,
    pub memory_mb: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 2048,
        }
    }
}

/// JobDescriptor is the fully resolved runnable form of a BackupDefinition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub source_id: String,
    /// Job name given to every run submitted for this descriptor
    pub run_label: String,
    pub command: Vec<String>,
    pub image: String,
    pub resources: ResourceRequest,
    pub secrets: Vec<SecretRef>,
    pub execution_role: String,
    pub job_role: String,
    pub bucket: String,
    pub platform: String,
    pub assign_public_ip: bool,
}

/// Whether a trigger will ever enqueue its descriptor on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Unarmed,
    Armed,
}

/// A cron-bound rule that enqueues one job descriptor at each firing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub rule_name: String,
    pub job_name: String,
    pub run_label: String,
    pub queue: String,
    pub schedule: String,
    pub timezone: String,
    pub enabled: bool,
}

/// One distinct destination bucket and how it is bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBinding {
    pub bucket: String,
    pub create: bool,
    pub grantee: String,
    /// Source ids whose destination resolves to this bucket, in input order
    pub source_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantAction {
    PutObject { bucket: String },
    ReadSecret { locator: String },
    SubmitJob { queue: String },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessGrant {
    pub grantee: String,
    pub action: GrantAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionProtocol {
    Email,
    Webhook,
    Nats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub protocol: SubscriptionProtocol,
    pub endpoint: String,
}

/// The shared fan-out channel notifications are published to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTopic {
    pub name: String,
    pub subscriptions: Vec<TopicSubscription>,
}

/// Listener installed for exactly one job descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRule {
    pub name: String,
    pub job_definition: String,
    pub event_source: String,
    pub detail_type: String,
    pub statuses: Vec<TerminalStatus>,
    pub topic: String,
}

// ============================================================================
// Runtime Models
// ============================================================================

/// Lifecycle state reported by the compute substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn terminal(self) -> Option<TerminalStatus> {
        match self {
            JobStatus::Succeeded => Some(TerminalStatus::Succeeded),
            JobStatus::Failed => Some(TerminalStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Pending => "PENDING",
            JobStatus::Runnable => "RUNNABLE",
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Succeeded => f.write_str("SUCCEEDED"),
            TerminalStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// Correlates a submitted run with the lifecycle events it produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub job_name: String,
    pub run_label: String,
    pub queue: String,
}

/// One triggered or manually submitted execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub handle: JobHandle,
    pub command: Vec<String>,
    pub image: String,
    pub resources: ResourceRequest,
    pub secrets: Vec<SecretRef>,
    pub enqueued_at: DateTime<Utc>,
}

/// Normalized notification produced once per terminal transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub job_name: String,
    pub terminal_status: TerminalStatus,
    pub subject: String,
    /// The original event serialized with sorted keys
    pub message: String,
    pub raw_detail: serde_json::Value,
}
