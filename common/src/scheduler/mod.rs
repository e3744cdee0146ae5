// Trigger scheduler: cron-bound rules that enqueue job descriptors

pub mod engine;

pub use engine::{EngineConfig, TriggerEngine};

use crate::descriptor::bounded;
use crate::errors::{ConfigurationError, QueueError};
use crate::models::{BackupDefinition, JobDescriptor, JobHandle, JobQueue, Trigger, TriggerState};
use crate::queue::ComputeQueueManager;
use crate::schedule::CronSpec;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Rule name derived from the descriptor it fires
pub fn derive_rule_name(descriptor: &JobDescriptor) -> String {
    bounded(format!("run-{}", descriptor.run_label), &descriptor.source_id)
}

/// The trigger for `descriptor`, or `None` when the definition has no schedule
///
/// The cron expression and timezone are validated here so a bad schedule
/// stops the build rather than surfacing at the first firing.
pub fn plan_trigger(
    descriptor: &JobDescriptor,
    definition: &BackupDefinition,
    queue: &JobQueue,
) -> Result<Option<Trigger>, ConfigurationError> {
    let Some(schedule) = &definition.schedule else {
        debug!(job_name = %descriptor.name, "No schedule, trigger stays unarmed");
        return Ok(None);
    };

    let spec = CronSpec::parse(schedule, definition.timezone.as_deref()).map_err(|source| {
        ConfigurationError::InvalidSchedule {
            source_id: definition.source_id.clone(),
            source,
        }
    })?;

    Ok(Some(Trigger {
        rule_name: derive_rule_name(descriptor),
        job_name: descriptor.name.clone(),
        run_label: descriptor.run_label.clone(),
        queue: queue.name.clone(),
        schedule: spec.expression().to_string(),
        timezone: spec.timezone().name().to_string(),
        enabled: true,
    }))
}

/// Result of arming a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Registered,
    /// The rule was already armed with the same configuration
    Unchanged,
}

#[derive(Debug, Clone)]
struct ArmedRule {
    trigger: Trigger,
    spec: CronSpec,
    descriptor: JobDescriptor,
}

/// Registry of armed rules keyed by rule name
#[derive(Debug, Default)]
pub struct TriggerScheduler {
    rules: BTreeMap<String, ArmedRule>,
}

impl TriggerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `trigger` so each firing enqueues `descriptor`
    pub fn arm(
        &mut self,
        trigger: Trigger,
        descriptor: JobDescriptor,
    ) -> Result<ArmOutcome, ConfigurationError> {
        if let Some(existing) = self.rules.get(&trigger.rule_name) {
            if existing.trigger == trigger && existing.descriptor == descriptor {
                return Ok(ArmOutcome::Unchanged);
            }
            return Err(ConfigurationError::ConflictingTrigger {
                rule_name: trigger.rule_name,
            });
        }

        let spec = CronSpec::parse(&trigger.schedule, Some(&trigger.timezone)).map_err(
            |source| ConfigurationError::InvalidSchedule {
                source_id: descriptor.source_id.clone(),
                source,
            },
        )?;

        info!(
            rule_name = %trigger.rule_name,
            job_name = %trigger.job_name,
            schedule = %trigger.schedule,
            timezone = %trigger.timezone,
            "Trigger armed"
        );
        self.rules.insert(
            trigger.rule_name.clone(),
            ArmedRule {
                trigger,
                spec,
                descriptor,
            },
        );
        Ok(ArmOutcome::Registered)
    }

    /// ARMED when an enabled rule enqueues `job_name`, UNARMED otherwise
    pub fn state(&self, job_name: &str) -> TriggerState {
        let armed = self
            .rules
            .values()
            .any(|rule| rule.trigger.enabled && rule.trigger.job_name == job_name);
        if armed {
            TriggerState::Armed
        } else {
            TriggerState::Unarmed
        }
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.rules.values().map(|rule| &rule.trigger)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Next firing of `rule_name` strictly after `reference`
    pub fn next_firing(&self, rule_name: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rules
            .get(rule_name)
            .and_then(|rule| rule.spec.next_after(reference).ok())
    }

    /// Firings per enabled rule in the window `(from, to]`, in rule name order
    pub fn due(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(String, usize)> {
        self.rules
            .values()
            .filter(|rule| rule.trigger.enabled)
            .map(|rule| (rule.trigger.rule_name.clone(), rule.spec.firings_between(from, to)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// One firing of `rule_name`: exactly one enqueue attempt
    ///
    /// A run still in flight from an earlier firing does not hold this one back.
    #[instrument(skip(self, queue))]
    pub async fn fire(
        &self,
        rule_name: &str,
        queue: &ComputeQueueManager,
    ) -> Result<JobHandle, QueueError> {
        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| QueueError::UnknownJob(rule_name.to_string()))?;

        counter!("backup_trigger_firings_total", "rule_name" => rule_name.to_string()).increment(1);
        queue.enqueue(&rule.descriptor, &rule.trigger.run_label).await
    }
}
