// S3-compatible store the rendered desired-state manifest is published to

use crate::config::ManifestBucketConfig;
use crate::errors::StorageError;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Client for the bucket an external reconciler reads manifests from
#[derive(Clone, Debug)]
pub struct ManifestStore {
    bucket: Arc<Bucket>,
    key: String,
}

impl ManifestStore {
    #[instrument(skip(config), fields(endpoint = %config.endpoint, bucket = %config.bucket))]
    pub fn new(config: &ManifestBucketConfig) -> Result<Self, StorageError> {
        info!("Initializing manifest store");

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| {
            error!(error = %e, "Failed to create storage credentials");
            StorageError::S3Error(format!("Failed to create credentials: {}", e))
        })?;

        // The scheme stays on the endpoint; without one the client assumes https
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| {
                error!(error = %e, "Failed to create bucket handle");
                StorageError::S3Error(format!("Failed to create bucket: {}", e))
            })?
            .with_path_style();

        Ok(Self {
            bucket: Arc::new(bucket),
            key: config.key.clone(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the manifest object with a freshly rendered one
    #[instrument(skip(self, manifest), fields(key = %self.key, size = manifest.len()))]
    pub async fn publish(&self, manifest: &[u8]) -> Result<(), StorageError> {
        debug!("Uploading manifest");

        self.bucket.put_object(&self.key, manifest).await.map_err(|e| {
            error!(error = %e, "Failed to upload manifest");
            StorageError::S3Error(format!("Failed to put object '{}': {}", self.key, e))
        })?;

        info!("Manifest uploaded");
        Ok(())
    }
}
