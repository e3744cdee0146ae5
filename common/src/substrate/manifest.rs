// Manifest substrate: records every applied resource into a JSON document
// that an external reconciler turns into real infrastructure.

use crate::errors::{ProvisioningError, StorageError};
use crate::models::{
    AccessGrant, ComputePool, JobDescriptor, JobQueue, ListenerRule, NotificationTopic, Trigger,
};
use crate::storage::ManifestStore;
use crate::substrate::Substrate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketMode {
    Create,
    Reference,
}

/// Applied resources keyed by name, so the rendering never depends on call order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub compute_pools: BTreeMap<String, ComputePool>,
    pub job_queues: BTreeMap<String, JobQueue>,
    pub topics: BTreeMap<String, NotificationTopic>,
    pub buckets: BTreeMap<String, BucketMode>,
    pub grants: BTreeSet<AccessGrant>,
    pub job_definitions: BTreeMap<String, JobDescriptor>,
    pub trigger_rules: BTreeMap<String, Trigger>,
    pub listener_rules: BTreeMap<String, ListenerRule>,
}

#[derive(Debug, Default)]
pub struct ManifestSubstrate {
    document: Mutex<ManifestDocument>,
}

impl ManifestSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self) -> ManifestDocument {
        self.document.lock().await.clone()
    }

    pub async fn render(&self) -> Result<String, ProvisioningError> {
        let document = self.document.lock().await;
        serde_json::to_string_pretty(&*document)
            .map_err(|e| ProvisioningError::RenderFailed(e.to_string()))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn write_to(&self, path: &Path) -> Result<(), ProvisioningError> {
        let rendered = self.render().await?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::from)?;
        }
        tokio::fs::write(path, rendered.as_bytes())
            .await
            .map_err(StorageError::from)?;

        info!(bytes = rendered.len(), "Manifest written");
        Ok(())
    }

    pub async fn publish(&self, store: &ManifestStore) -> Result<(), ProvisioningError> {
        let rendered = self.render().await?;
        store.publish(rendered.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl Substrate for ManifestSubstrate {
    async fn ensure_compute_pool(&self, pool: &ComputePool) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .compute_pools
            .insert(pool.name.clone(), pool.clone());
        Ok(())
    }

    async fn ensure_job_queue(&self, queue: &JobQueue) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .job_queues
            .insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn ensure_topic(&self, topic: &NotificationTopic) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .topics
            .insert(topic.name.clone(), topic.clone());
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .buckets
            .insert(bucket.to_string(), BucketMode::Create);
        Ok(())
    }

    async fn reference_bucket(&self, bucket: &str) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .buckets
            .entry(bucket.to_string())
            .or_insert(BucketMode::Reference);
        Ok(())
    }

    async fn grant(&self, grant: &AccessGrant) -> Result<(), ProvisioningError> {
        self.document.lock().await.grants.insert(grant.clone());
        Ok(())
    }

    async fn register_job_descriptor(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .job_definitions
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    async fn put_trigger_rule(&self, trigger: &Trigger) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .trigger_rules
            .insert(trigger.rule_name.clone(), trigger.clone());
        Ok(())
    }

    async fn put_listener_rule(&self, listener: &ListenerRule) -> Result<(), ProvisioningError> {
        self.document
            .lock()
            .await
            .listener_rules
            .insert(listener.name.clone(), listener.clone());
        Ok(())
    }
}
