// Desired state: everything the substrate must hold for a definition set
//
// Building is pure and synchronous; nothing is applied until the whole set
// has been validated.

use crate::config::{NotificationConfig, Settings};
use crate::descriptor::{DescriptorDefaults, JobDescriptorBuilder};
use crate::errors::{ConfigurationError, OrchestrationError, ProvisioningError};
use crate::models::{
    AccessGrant, BackupDefinition, BucketBinding, ComputePool, GrantAction, JobDescriptor,
    JobQueue, ListenerRule, NotificationTopic, SharedIdentities, SubscriptionProtocol,
    TopicSubscription, Trigger,
};
use crate::queue::provision;
use crate::router::{listener_for, CompletionRouter, EventSource};
use crate::scheduler::{plan_trigger, TriggerScheduler};
use crate::storage::plan_bindings;
use crate::substrate::{apply, Substrate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// The complete set of resources derived from the configured definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub compute_pool: ComputePool,
    pub job_queue: JobQueue,
    pub topic: NotificationTopic,
    pub descriptors: Vec<JobDescriptor>,
    /// Armed triggers only; descriptors without a schedule have none
    pub triggers: Vec<Trigger>,
    pub bindings: Vec<BucketBinding>,
    /// Grants held by the shared execution identity
    pub identity_grants: Vec<AccessGrant>,
    pub listeners: Vec<ListenerRule>,
}

impl DesiredState {
    pub fn descriptor(&self, name: &str) -> Option<&JobDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.name == name)
    }

    /// Every grant, storage and identity, deduplicated and sorted
    pub fn all_grants(&self) -> Vec<AccessGrant> {
        self.bindings
            .iter()
            .map(BucketBinding::write_grant)
            .chain(self.identity_grants.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Deterministic JSON rendering; identical states render identical bytes
    pub fn render_manifest(&self) -> Result<String, ProvisioningError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ProvisioningError::RenderFailed(e.to_string()))
    }

    /// Arm one rule per trigger in a fresh scheduler
    pub fn arm_triggers(&self) -> Result<TriggerScheduler, ConfigurationError> {
        let mut scheduler = TriggerScheduler::new();
        for trigger in &self.triggers {
            let descriptor = self.descriptor(&trigger.job_name).cloned().ok_or_else(|| {
                ConfigurationError::InvalidSetting {
                    field: "triggers".to_string(),
                    reason: format!("no descriptor named '{}'", trigger.job_name),
                }
            })?;
            scheduler.arm(trigger.clone(), descriptor)?;
        }
        Ok(scheduler)
    }

    /// A router holding this state's listeners, without publishers
    pub fn completion_router(&self, component: &str) -> CompletionRouter {
        CompletionRouter::new(component, self.listeners.clone())
    }
}

/// The fan-out topic and its subscriptions
pub fn notification_topic(config: &NotificationConfig) -> NotificationTopic {
    let mut subscriptions = Vec::new();
    if let Some(email) = &config.email {
        subscriptions.push(TopicSubscription {
            protocol: SubscriptionProtocol::Email,
            endpoint: email.clone(),
        });
    }
    if let Some(url) = &config.webhook_url {
        subscriptions.push(TopicSubscription {
            protocol: SubscriptionProtocol::Webhook,
            endpoint: url.clone(),
        });
    }
    if let Some(subject) = &config.nats_subject {
        subscriptions.push(TopicSubscription {
            protocol: SubscriptionProtocol::Nats,
            endpoint: subject.clone(),
        });
    }

    NotificationTopic {
        name: config.topic_name.clone(),
        subscriptions,
    }
}

/// Grants for the execution identity: read every attached secret, submit to the queue
pub fn identity_grants(
    descriptors: &[JobDescriptor],
    identities: &SharedIdentities,
    queue: &JobQueue,
) -> Vec<AccessGrant> {
    let mut grants: BTreeSet<AccessGrant> = descriptors
        .iter()
        .flat_map(|descriptor| descriptor.secrets.iter())
        .map(|secret| AccessGrant {
            grantee: identities.execution_role.clone(),
            action: GrantAction::ReadSecret {
                locator: secret.locator.clone(),
            },
        })
        .collect();

    grants.insert(AccessGrant {
        grantee: identities.execution_role.clone(),
        action: GrantAction::SubmitJob {
            queue: queue.name.clone(),
        },
    });

    grants.into_iter().collect()
}

/// Map `definitions` to the desired state
pub fn build_desired_state(
    definitions: &[BackupDefinition],
    settings: &Settings,
) -> Result<DesiredState, ConfigurationError> {
    settings.validate()?;

    let identities = SharedIdentities {
        execution_role: settings.identities.execution_role.clone(),
        job_role: settings.identities.job_role.clone(),
    };

    let builder = JobDescriptorBuilder::new(
        DescriptorDefaults::from_settings(settings),
        identities.clone(),
    );
    let descriptors = builder.build_all(definitions)?;

    let (compute_pool, job_queue) = provision(&settings.compute, &settings.orchestrator.platform)?;
    let bindings = plan_bindings(definitions, &identities.job_role)?;

    let mut triggers = Vec::new();
    for (descriptor, definition) in descriptors.iter().zip(definitions) {
        if let Some(trigger) = plan_trigger(descriptor, definition, &job_queue)? {
            triggers.push(trigger);
        }
    }

    let topic = notification_topic(&settings.notifications);
    let source = EventSource::from_config(&settings.notifications);
    let listeners = descriptors
        .iter()
        .map(|descriptor| listener_for(descriptor, &source, &topic.name))
        .collect();

    let identity_grants = identity_grants(&descriptors, &identities, &job_queue);

    info!(
        descriptors = descriptors.len(),
        triggers = triggers.len(),
        buckets = bindings.len(),
        "Desired state built"
    );

    Ok(DesiredState {
        compute_pool,
        job_queue,
        topic,
        descriptors,
        triggers,
        bindings,
        identity_grants,
        listeners,
    })
}

/// Build the desired state for `definitions` and apply it to `substrate`
///
/// Nothing is applied when the build fails; the first substrate error aborts
/// the apply.
pub async fn build_and_apply(
    definitions: &[BackupDefinition],
    settings: &Settings,
    substrate: &dyn Substrate,
) -> Result<DesiredState, OrchestrationError> {
    let state = build_desired_state(definitions, settings)?;
    apply(&state, substrate).await?;
    Ok(state)
}
