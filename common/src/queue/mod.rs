// Compute queue manager: one bounded pool, one single-tier queue

pub mod local;
pub mod nats;
pub mod publisher;

pub use local::{local_compute_queue, LocalComputeQueue, LocalDispatcher};
pub use nats::NatsClient;
pub use publisher::{JobMessage, NatsJobSubmitter};

use crate::config::ComputeConfig;
use crate::errors::{ConfigurationError, QueueError};
use crate::models::{
    ComputeEnvironmentOrder, ComputePool, JobDescriptor, JobHandle, JobQueue, QueueEntry,
};
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// The only priority tier jobs are placed in
pub const DEFAULT_PRIORITY: i32 = 0;

/// Hands a queue entry to whatever actually runs it
///
/// Implementations accept the entry and return without waiting for the run
/// to be admitted to the pool.
#[async_trait::async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, entry: QueueEntry) -> Result<(), QueueError>;
}

/// Describe the shared compute pool and the queue that feeds it
pub fn provision(
    compute: &ComputeConfig,
    platform: &str,
) -> Result<(ComputePool, JobQueue), ConfigurationError> {
    if compute.max_vcpus == 0 {
        return Err(ConfigurationError::InvalidSetting {
            field: "compute.max_vcpus".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    let pool = ComputePool {
        name: compute.pool_name.clone(),
        platform: platform.to_string(),
        max_vcpus: compute.max_vcpus,
        subnets: compute.subnets.clone(),
        security_group_ids: compute.security_group_ids.clone(),
        service_role: compute.service_role.clone(),
    };

    let queue = JobQueue {
        name: compute.queue_name.clone(),
        priority: DEFAULT_PRIORITY,
        compute_environment_order: vec![ComputeEnvironmentOrder {
            order: 0,
            compute_environment: pool.name.clone(),
        }],
    };

    Ok((pool, queue))
}

/// Runtime handle used by triggers and manual submissions to enqueue runs
#[derive(Clone)]
pub struct ComputeQueueManager {
    pool: ComputePool,
    queue: JobQueue,
    submitter: Arc<dyn JobSubmitter>,
}

impl ComputeQueueManager {
    pub fn new(pool: ComputePool, queue: JobQueue, submitter: Arc<dyn JobSubmitter>) -> Self {
        Self {
            pool,
            queue,
            submitter,
        }
    }

    pub fn pool(&self) -> &ComputePool {
        &self.pool
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Submit one run of `descriptor`; the returned handle correlates its lifecycle events
    #[instrument(skip(self, descriptor), fields(job_name = %descriptor.name, queue = %self.queue.name))]
    pub async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
        run_label: &str,
    ) -> Result<JobHandle, QueueError> {
        let handle = JobHandle {
            id: Uuid::new_v4(),
            job_name: descriptor.name.clone(),
            run_label: run_label.to_string(),
            queue: self.queue.name.clone(),
        };

        let entry = QueueEntry {
            handle: handle.clone(),
            command: descriptor.command.clone(),
            image: descriptor.image.clone(),
            resources: descriptor.resources,
            secrets: descriptor.secrets.clone(),
            enqueued_at: Utc::now(),
        };

        self.submitter.submit(entry).await?;

        counter!("backup_jobs_enqueued_total", "job_name" => descriptor.name.clone()).increment(1);
        info!(handle_id = %handle.id, run_label = %run_label, "Run enqueued");
        Ok(handle)
    }
}
