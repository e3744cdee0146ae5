// Error handling framework
//
// Configuration problems abort the build before anything is applied,
// provisioning problems are propagated unchanged, and delivery problems
// are logged by the caller and never escalated.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next firing time available for cron expression '{expression}'")]
    NoNextFiring { expression: String },
}

/// Errors detected while turning backup definitions into a desired state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Malformed destination URL '{url}': {reason}")]
    MalformedDestinationUrl { url: String, reason: String },

    #[error("Backup definition for '{destination_url}' has an empty source id")]
    EmptySourceId { destination_url: String },

    #[error("Job name '{name}' derived from both '{first}' and '{second}'")]
    DuplicateJobName {
        name: String,
        first: String,
        second: String,
    },

    #[error("Secret name at position {index} for '{source_id}' is empty")]
    EmptySecretName { source_id: String, index: usize },

    #[error("Secret '{name}' attached more than once to '{source_id}'")]
    DuplicateSecretName { source_id: String, name: String },

    #[error("Schedule for '{source_id}' is invalid: {source}")]
    InvalidSchedule {
        source_id: String,
        #[source]
        source: ScheduleError,
    },

    #[error("Trigger rule '{rule_name}' is already armed with a different configuration")]
    ConflictingTrigger { rule_name: String },

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),
}

/// Errors raised by the substrate while applying a desired state
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Bucket '{bucket}' already exists under different ownership")]
    BucketOwnershipConflict { bucket: String },

    #[error("Failed to render manifest: {0}")]
    RenderFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),

    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Job descriptor not found: {0}")]
    UnknownJob(String),
}

/// Errors raised while routing lifecycle events to the fan-out channel
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Invalid lifecycle event: {0}")]
    InvalidEvent(String),

    #[error("Failed to publish notification: {0}")]
    PublishFailed(String),

    #[error("Notification serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Notification channel '{0}' is configured but cannot be reached")]
    ChannelUnavailable(String),
}

/// Umbrella error for a full build-and-apply run
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}
