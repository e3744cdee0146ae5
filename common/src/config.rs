// Configuration management with layered configuration (file, env)

use crate::errors::ConfigurationError;
use crate::models::BackupDefinition;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub compute: ComputeConfig,
    pub identities: IdentityConfig,
    pub notifications: NotificationConfig,
    pub nats: NatsConfig,
    pub manifest: ManifestConfig,
    pub observability: ObservabilityConfig,
    pub backups: Vec<BackupDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Component name used in notification subjects
    pub component: String,
    /// Prefix of every derived resource name
    pub name_prefix: String,
    pub image: String,
    /// Path of the worker executable inside the image
    pub executable: String,
    pub default_vcpus: u32,
    pub default_memory_mb: u32,
    pub platform: String,
    pub assign_public_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub pool_name: String,
    pub queue_name: String,
    pub max_vcpus: u32,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub service_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub execution_role: String,
    pub job_role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub topic_name: String,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub nats_subject: Option<String>,
    /// `source` of lifecycle events emitted by the compute substrate
    pub event_source: String,
    /// `detail-type` of lifecycle events emitted by the compute substrate
    pub detail_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    /// Core subject remote workers publish lifecycle events on
    pub event_subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub output_path: String,
    pub s3: Option<ManifestBucketConfig>,
}

/// S3-compatible location the rendered manifest is uploaded to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestBucketConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    #[serde(default = "default_manifest_key")]
    pub key: String,
}

fn default_manifest_key() -> String {
    "orchestrator/desired-state.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config", None)
    }

    /// Load configuration from a directory, optionally layering one explicit file on top
    pub fn load_from_path<P: AsRef<Path>>(
        config_dir: P,
        extra_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let mut builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("BACKUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let orchestrator = &self.orchestrator;
        require_non_empty("orchestrator.component", &orchestrator.component)?;
        require_non_empty("orchestrator.image", &orchestrator.image)?;
        require_non_empty("orchestrator.executable", &orchestrator.executable)?;
        if orchestrator.name_prefix.is_empty()
            || !orchestrator
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                "orchestrator.name_prefix",
                "must be non-empty and contain only letters, digits, '-' or '_'",
            ));
        }
        if orchestrator.default_vcpus == 0 {
            return Err(invalid("orchestrator.default_vcpus", "must be greater than 0"));
        }
        if orchestrator.default_memory_mb == 0 {
            return Err(invalid(
                "orchestrator.default_memory_mb",
                "must be greater than 0",
            ));
        }

        require_non_empty("compute.pool_name", &self.compute.pool_name)?;
        require_non_empty("compute.queue_name", &self.compute.queue_name)?;
        if self.compute.max_vcpus < orchestrator.default_vcpus {
            return Err(invalid(
                "compute.max_vcpus",
                "must be at least orchestrator.default_vcpus",
            ));
        }

        require_non_empty("identities.execution_role", &self.identities.execution_role)?;
        require_non_empty("identities.job_role", &self.identities.job_role)?;

        require_non_empty("notifications.topic_name", &self.notifications.topic_name)?;
        if let Some(email) = &self.notifications.email {
            if !email.contains('@') {
                return Err(invalid("notifications.email", "is not an email address"));
            }
        }
        if let Some(webhook_url) = &self.notifications.webhook_url {
            reqwest::Url::parse(webhook_url)
                .map_err(|e| invalid("notifications.webhook_url", &e.to_string()))?;
        }

        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "cannot be empty"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            component: "backup".to_string(),
            name_prefix: "backup".to_string(),
            image: "backup-worker:latest".to_string(),
            executable: "/back-up-folder".to_string(),
            default_vcpus: 1,
            default_memory_mb: 2048,
            platform: "FARGATE".to_string(),
            assign_public_ip: true,
        }
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            pool_name: "default-compute-environment".to_string(),
            queue_name: "default-job-queue".to_string(),
            max_vcpus: 256,
            subnets: Vec::new(),
            security_group_ids: Vec::new(),
            service_role: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            execution_role: "backup-batch-execution-role".to_string(),
            job_role: "backup-batch-job-role".to_string(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            topic_name: "backup-job-notifications".to_string(),
            email: None,
            webhook_url: None,
            nats_subject: None,
            event_source: "aws.batch".to_string(),
            detail_type: "Batch Job State Change".to_string(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "BACKUP_JOBS".to_string(),
            subject_prefix: "backup.jobs".to_string(),
            event_subject: "backup.events".to_string(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            output_path: "desired-state.json".to_string(),
            s3: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_image() {
        let mut settings = Settings::default();
        settings.orchestrator.image = String::new();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("orchestrator.image"));
    }

    #[test]
    fn test_validation_catches_pool_smaller_than_job() {
        let mut settings = Settings::default();
        settings.orchestrator.default_vcpus = 4;
        settings.compute.max_vcpus = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_prefix() {
        let mut settings = Settings::default();
        settings.orchestrator.name_prefix = "bad prefix".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_email() {
        let mut settings = Settings::default();
        settings.notifications.email = Some("not-an-address".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_backups_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[orchestrator]
image = "registry.example.com/backup-worker:1.2"

[notifications]
email = "ops@example.com"

[[backups]]
source_id = "Documents"
destination_url = "s3://family-archive/documents"
create_destination_if_missing = true
storage_class = "GLACIER"
schedule = "0 0 3 * * *"

[[backups.secret_refs]]
name = "REFRESH_TOKEN"
locator = "arn:aws:secretsmanager:eu-west-1:000000000000:secret:drive"

[[backups]]
source_id = "Photos"
destination_url = "s3://family-archive/photos"
"#
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path(), None).unwrap();
        assert_eq!(
            settings.orchestrator.image,
            "registry.example.com/backup-worker:1.2"
        );
        assert_eq!(settings.orchestrator.component, "backup");
        assert_eq!(settings.compute.max_vcpus, 256);
        assert_eq!(settings.backups.len(), 2);
        assert_eq!(settings.backups[0].secret_refs.len(), 1);
        assert_eq!(settings.backups[0].storage_class.as_deref(), Some("GLACIER"));
        assert!(settings.backups[1].schedule.is_none());
        assert!(settings.validate().is_ok());
    }
}
