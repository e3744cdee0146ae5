// Storage binding resolution: destination URL → bucket identity → write grant

use crate::errors::{ConfigurationError, ProvisioningError};
use crate::models::{AccessGrant, BackupDefinition, BucketBinding, GrantAction};
use crate::substrate::Substrate;
use reqwest::Url;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// The only destination scheme the worker knows how to write to
pub const OBJECT_STORAGE_SCHEME: &str = "s3";

/// Extract the bucket identity from `s3://bucket[/path]`
///
/// The host component is returned unchanged; any path, including a bare
/// trailing slash, is ignored.
pub fn resolve_bucket(destination_url: &str) -> Result<String, ConfigurationError> {
    let url = Url::parse(destination_url.trim())
        .map_err(|e| malformed(destination_url, &e.to_string()))?;

    if url.scheme() != OBJECT_STORAGE_SCHEME {
        return Err(malformed(
            destination_url,
            &format!(
                "scheme '{}' is not '{}'",
                url.scheme(),
                OBJECT_STORAGE_SCHEME
            ),
        ));
    }

    match url.host_str() {
        Some(bucket) if !bucket.is_empty() => Ok(bucket.to_string()),
        _ => Err(malformed(destination_url, "bucket name is missing")),
    }
}

fn malformed(url: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::MalformedDestinationUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

impl BucketBinding {
    /// Put-object permission this binding hands to its grantee
    pub fn write_grant(&self) -> AccessGrant {
        AccessGrant {
            grantee: self.grantee.clone(),
            action: GrantAction::PutObject {
                bucket: self.bucket.clone(),
            },
        }
    }
}

/// Compute one binding per distinct bucket over the full definition set
///
/// Runs before any bind call is issued. A bucket is created when at least
/// one definition writing to it asks for creation. Bindings are ordered by
/// bucket name.
pub fn plan_bindings(
    definitions: &[BackupDefinition],
    grantee: &str,
) -> Result<Vec<BucketBinding>, ConfigurationError> {
    let mut bindings: BTreeMap<String, BucketBinding> = BTreeMap::new();

    for definition in definitions {
        let bucket = resolve_bucket(&definition.destination_url)?;
        let binding = bindings
            .entry(bucket.clone())
            .or_insert_with(|| BucketBinding {
                bucket,
                create: false,
                grantee: grantee.to_string(),
                source_ids: Vec::new(),
            });
        binding.create |= definition.create_destination_if_missing;
        binding.source_ids.push(definition.source_id.clone());
    }

    debug!(distinct_buckets = bindings.len(), "Planned bucket bindings");
    Ok(bindings.into_values().collect())
}

/// Create or reference the bucket, then grant write access to the grantee
#[instrument(skip(substrate, binding), fields(bucket = %binding.bucket, create = binding.create))]
pub async fn bind_access(
    substrate: &dyn Substrate,
    binding: &BucketBinding,
) -> Result<(), ProvisioningError> {
    if binding.create {
        substrate.create_bucket(&binding.bucket).await?;
    } else {
        substrate.reference_bucket(&binding.bucket).await?;
    }
    substrate.grant(&binding.write_grant()).await?;

    info!(grantee = %binding.grantee, "Write access bound to bucket");
    Ok(())
}
