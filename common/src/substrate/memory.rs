// In-memory substrate for dry runs and tests

use crate::errors::ProvisioningError;
use crate::models::{
    AccessGrant, ComputePool, GrantAction, JobDescriptor, JobQueue, ListenerRule,
    NotificationTopic, Trigger,
};
use crate::substrate::Substrate;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Resources held by an [`InMemorySubstrate`], in name order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub compute_pool: Option<ComputePool>,
    pub job_queue: Option<JobQueue>,
    pub topic: Option<NotificationTopic>,
    pub owned_buckets: Vec<String>,
    pub referenced_buckets: Vec<String>,
    pub grants: Vec<AccessGrant>,
    pub descriptors: Vec<JobDescriptor>,
    pub trigger_rules: Vec<Trigger>,
    pub listener_rules: Vec<ListenerRule>,
}

#[derive(Debug, Default)]
struct MemoryState {
    compute_pool: Option<ComputePool>,
    job_queue: Option<JobQueue>,
    topic: Option<NotificationTopic>,
    owned_buckets: BTreeSet<String>,
    referenced_buckets: BTreeSet<String>,
    grants: BTreeSet<AccessGrant>,
    descriptors: BTreeMap<String, JobDescriptor>,
    trigger_rules: BTreeMap<String, Trigger>,
    listener_rules: BTreeMap<String, ListenerRule>,
    /// Every call received, in order
    operations: Vec<String>,
}

/// Substrate that keeps everything in process memory
///
/// Buckets registered with [`InMemorySubstrate::with_foreign_bucket`] exist
/// under another owner; creating one fails with a conflict.
#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    foreign_buckets: BTreeSet<String>,
    state: Mutex<MemoryState>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_foreign_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.foreign_buckets.insert(bucket.into());
        self
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        let state = self.state.lock().await;
        MemorySnapshot {
            compute_pool: state.compute_pool.clone(),
            job_queue: state.job_queue.clone(),
            topic: state.topic.clone(),
            owned_buckets: state.owned_buckets.iter().cloned().collect(),
            referenced_buckets: state.referenced_buckets.iter().cloned().collect(),
            grants: state.grants.iter().cloned().collect(),
            descriptors: state.descriptors.values().cloned().collect(),
            trigger_rules: state.trigger_rules.values().cloned().collect(),
            listener_rules: state.listener_rules.values().cloned().collect(),
        }
    }

    /// Calls received so far, formatted `operation:target`
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.operations.clone()
    }

    async fn record(&self, operation: &str, target: &str) -> MutexGuard<'_, MemoryState> {
        let mut state = self.state.lock().await;
        debug!(operation, target, "Substrate call");
        state.operations.push(format!("{}:{}", operation, target));
        state
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn ensure_compute_pool(&self, pool: &ComputePool) -> Result<(), ProvisioningError> {
        let mut state = self.record("ensure_compute_pool", &pool.name).await;
        state.compute_pool = Some(pool.clone());
        Ok(())
    }

    async fn ensure_job_queue(&self, queue: &JobQueue) -> Result<(), ProvisioningError> {
        let mut state = self.record("ensure_job_queue", &queue.name).await;
        state.job_queue = Some(queue.clone());
        Ok(())
    }

    async fn ensure_topic(&self, topic: &NotificationTopic) -> Result<(), ProvisioningError> {
        let mut state = self.record("ensure_topic", &topic.name).await;
        state.topic = Some(topic.clone());
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), ProvisioningError> {
        let mut state = self.record("create_bucket", bucket).await;
        if self.foreign_buckets.contains(bucket) {
            return Err(ProvisioningError::BucketOwnershipConflict {
                bucket: bucket.to_string(),
            });
        }
        state.owned_buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn reference_bucket(&self, bucket: &str) -> Result<(), ProvisioningError> {
        let mut state = self.record("reference_bucket", bucket).await;
        if !state.owned_buckets.contains(bucket) {
            state.referenced_buckets.insert(bucket.to_string());
        }
        Ok(())
    }

    async fn grant(&self, grant: &AccessGrant) -> Result<(), ProvisioningError> {
        let target = match &grant.action {
            GrantAction::PutObject { bucket } => format!("{}:put_object:{}", grant.grantee, bucket),
            GrantAction::ReadSecret { locator } => {
                format!("{}:read_secret:{}", grant.grantee, locator)
            }
            GrantAction::SubmitJob { queue } => format!("{}:submit_job:{}", grant.grantee, queue),
        };
        let mut state = self.record("grant", &target).await;
        state.grants.insert(grant.clone());
        Ok(())
    }

    async fn register_job_descriptor(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.record("register_job_descriptor", &descriptor.name).await;
        state
            .descriptors
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    async fn put_trigger_rule(&self, trigger: &Trigger) -> Result<(), ProvisioningError> {
        let mut state = self.record("put_trigger_rule", &trigger.rule_name).await;
        state
            .trigger_rules
            .insert(trigger.rule_name.clone(), trigger.clone());
        Ok(())
    }

    async fn put_listener_rule(&self, listener: &ListenerRule) -> Result<(), ProvisioningError> {
        let mut state = self.record("put_listener_rule", &listener.name).await;
        state
            .listener_rules
            .insert(listener.name.clone(), listener.clone());
        Ok(())
    }
}
