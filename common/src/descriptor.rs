// Job descriptor builder
//
// Every name produced here is a pure function of the source id so that
// rebuilding from unchanged configuration yields the same resources.

use crate::config::Settings;
use crate::errors::ConfigurationError;
use crate::models::{BackupDefinition, JobDescriptor, ResourceRequest, SharedIdentities};
use crate::storage::resolve_bucket;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::debug;

/// Longest name the compute substrate accepts for job definitions and rules
pub const MAX_NAME_LENGTH: usize = 128;

const HASH_SUFFIX_LENGTH: usize = 8;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").expect("valid name pattern"))
}

/// Replace every character the substrate rejects in names with '-'
pub fn slugify(source_id: &str) -> String {
    name_pattern().replace_all(source_id.trim(), "-").into_owned()
}

/// Keep `name` within [`MAX_NAME_LENGTH`], appending a digest of the source id
/// when it has to be shortened so distinct long ids stay distinct
pub(crate) fn bounded(name: String, source_id: &str) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name;
    }
    let digest = hex::encode(Sha256::digest(source_id.as_bytes()));
    let limit = MAX_NAME_LENGTH - HASH_SUFFIX_LENGTH - 1;
    let keep = (0..=limit)
        .rev()
        .find(|&index| name.is_char_boundary(index))
        .unwrap_or(0);
    format!("{}-{}", &name[..keep], &digest[..HASH_SUFFIX_LENGTH])
}

/// Name of the job descriptor derived from `source_id`
pub fn derive_job_name(prefix: &str, source_id: &str) -> String {
    bounded(
        format!("{}-{}-backup-job", slugify(prefix), slugify(source_id)),
        source_id,
    )
}

/// Job name given to each submitted run of the descriptor
pub fn derive_run_label(prefix: &str, source_id: &str) -> String {
    bounded(
        format!("{}-{}-backup", slugify(prefix), slugify(source_id)),
        source_id,
    )
}

/// Worker argv: `[executable, source_id, destination_url]` plus an optional
/// `--storage-class <value>` pair
pub fn build_command(executable: &str, definition: &BackupDefinition) -> Vec<String> {
    let mut command = vec![
        executable.to_string(),
        definition.source_id.clone(),
        definition.destination_url.clone(),
    ];
    if let Some(storage_class) = &definition.storage_class {
        command.push("--storage-class".to_string());
        command.push(storage_class.clone());
    }
    command
}

/// Settings every descriptor shares apart from the identities
#[derive(Debug, Clone)]
pub struct DescriptorDefaults {
    pub name_prefix: String,
    pub image: String,
    pub executable: String,
    pub resources: ResourceRequest,
    pub platform: String,
    pub assign_public_ip: bool,
}

impl DescriptorDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        let orchestrator = &settings.orchestrator;
        Self {
            name_prefix: orchestrator.name_prefix.clone(),
            image: orchestrator.image.clone(),
            executable: orchestrator.executable.clone(),
            resources: ResourceRequest {
                vcpus: orchestrator.default_vcpus,
                memory_mb: orchestrator.default_memory_mb,
            },
            platform: orchestrator.platform.clone(),
            assign_public_ip: orchestrator.assign_public_ip,
        }
    }
}

/// Builds one [`JobDescriptor`] per [`BackupDefinition`]
#[derive(Debug, Clone)]
pub struct JobDescriptorBuilder {
    defaults: DescriptorDefaults,
    identities: SharedIdentities,
}

impl JobDescriptorBuilder {
    pub fn new(defaults: DescriptorDefaults, identities: SharedIdentities) -> Self {
        Self {
            defaults,
            identities,
        }
    }

    pub fn defaults(&self) -> &DescriptorDefaults {
        &self.defaults
    }

    pub fn build(&self, definition: &BackupDefinition) -> Result<JobDescriptor, ConfigurationError> {
        if definition.source_id.trim().is_empty() {
            return Err(ConfigurationError::EmptySourceId {
                destination_url: definition.destination_url.clone(),
            });
        }
        validate_secrets(definition)?;
        let bucket = resolve_bucket(&definition.destination_url)?;

        let prefix = &self.defaults.name_prefix;
        Ok(JobDescriptor {
            name: derive_job_name(prefix, &definition.source_id),
            source_id: definition.source_id.clone(),
            run_label: derive_run_label(prefix, &definition.source_id),
            command: build_command(&self.defaults.executable, definition),
            image: self.defaults.image.clone(),
            resources: self.defaults.resources,
            secrets: definition.secret_refs.clone(),
            execution_role: self.identities.execution_role.clone(),
            job_role: self.identities.job_role.clone(),
            bucket,
            platform: self.defaults.platform.clone(),
            assign_public_ip: self.defaults.assign_public_ip,
        })
    }

    /// Build every descriptor, rejecting any two that derive the same name
    pub fn build_all(
        &self,
        definitions: &[BackupDefinition],
    ) -> Result<Vec<JobDescriptor>, ConfigurationError> {
        let mut seen: HashMap<String, String> = HashMap::with_capacity(definitions.len());
        let mut descriptors = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let descriptor = self.build(definition)?;
            if let Some(first) = seen.get(&descriptor.name) {
                return Err(ConfigurationError::DuplicateJobName {
                    name: descriptor.name,
                    first: first.clone(),
                    second: definition.source_id.clone(),
                });
            }
            seen.insert(descriptor.name.clone(), definition.source_id.clone());
            debug!(job_name = %descriptor.name, source_id = %descriptor.source_id, "Built job descriptor");
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }
}

fn validate_secrets(definition: &BackupDefinition) -> Result<(), ConfigurationError> {
    let mut names = HashSet::with_capacity(definition.secret_refs.len());
    for (index, secret) in definition.secret_refs.iter().enumerate() {
        if secret.name.trim().is_empty() {
            return Err(ConfigurationError::EmptySecretName {
                source_id: definition.source_id.clone(),
                index,
            });
        }
        if !names.insert(secret.name.as_str()) {
            return Err(ConfigurationError::DuplicateSecretName {
                source_id: definition.source_id.clone(),
                name: secret.name.clone(),
            });
        }
    }
    Ok(())
}
