// Substrate: the external system a desired state is applied to

pub mod manifest;
pub mod memory;

pub use manifest::{BucketMode, ManifestDocument, ManifestSubstrate};
pub use memory::{InMemorySubstrate, MemorySnapshot};

use crate::errors::ProvisioningError;
use crate::models::{
    AccessGrant, ComputePool, JobDescriptor, JobQueue, ListenerRule, NotificationTopic, Trigger,
};
use crate::orchestrator::DesiredState;
use crate::storage::bind_access;
use async_trait::async_trait;
use tracing::{info, instrument};

/// Every operation must be idempotent: applying the same resource twice
/// leaves the substrate unchanged.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn ensure_compute_pool(&self, pool: &ComputePool) -> Result<(), ProvisioningError>;

    async fn ensure_job_queue(&self, queue: &JobQueue) -> Result<(), ProvisioningError>;

    async fn ensure_topic(&self, topic: &NotificationTopic) -> Result<(), ProvisioningError>;

    /// Create a bucket owned by this deployment
    async fn create_bucket(&self, bucket: &str) -> Result<(), ProvisioningError>;

    /// Use a bucket that already exists without taking ownership of it
    async fn reference_bucket(&self, bucket: &str) -> Result<(), ProvisioningError>;

    async fn grant(&self, grant: &AccessGrant) -> Result<(), ProvisioningError>;

    async fn register_job_descriptor(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<(), ProvisioningError>;

    async fn put_trigger_rule(&self, trigger: &Trigger) -> Result<(), ProvisioningError>;

    async fn put_listener_rule(&self, listener: &ListenerRule) -> Result<(), ProvisioningError>;
}

/// Apply `state` in dependency order, stopping at the first error
///
/// Nothing already applied is rolled back; applying again is safe.
#[instrument(skip_all, fields(descriptors = state.descriptors.len()))]
pub async fn apply(
    state: &DesiredState,
    substrate: &dyn Substrate,
) -> Result<(), ProvisioningError> {
    substrate.ensure_compute_pool(&state.compute_pool).await?;
    substrate.ensure_job_queue(&state.job_queue).await?;
    substrate.ensure_topic(&state.topic).await?;

    for binding in &state.bindings {
        bind_access(substrate, binding).await?;
    }
    for grant in &state.identity_grants {
        substrate.grant(grant).await?;
    }
    for descriptor in &state.descriptors {
        substrate.register_job_descriptor(descriptor).await?;
    }
    for trigger in &state.triggers {
        substrate.put_trigger_rule(trigger).await?;
    }
    for listener in &state.listeners {
        substrate.put_listener_rule(listener).await?;
    }

    info!(
        triggers = state.triggers.len(),
        listeners = state.listeners.len(),
        buckets = state.bindings.len(),
        "Desired state applied"
    );
    Ok(())
}
