// Trigger engine: fires armed rules as their cron schedules come due

use crate::queue::ComputeQueueManager;
use crate::scheduler::TriggerScheduler;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

/// Configuration for the trigger engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often firings are evaluated (in milliseconds)
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

pub struct TriggerEngine {
    config: EngineConfig,
    scheduler: Arc<TriggerScheduler>,
    queue: ComputeQueueManager,
    last_tick: Mutex<DateTime<Utc>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TriggerEngine {
    pub fn new(
        config: EngineConfig,
        scheduler: Arc<TriggerScheduler>,
        queue: ComputeQueueManager,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            scheduler,
            queue,
            last_tick: Mutex::new(Utc::now()),
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Enqueue one run per firing in `(from, to]`; returns how many were enqueued
    ///
    /// A failed enqueue is logged and does not stop the remaining firings.
    #[instrument(skip(self))]
    pub async fn fire_due(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        let mut enqueued = 0;

        for (rule_name, firings) in self.scheduler.due(from, to) {
            for _ in 0..firings {
                match self.scheduler.fire(&rule_name, &self.queue).await {
                    Ok(handle) => {
                        debug!(rule_name = %rule_name, handle_id = %handle.id, "Rule fired");
                        enqueued += 1;
                    }
                    Err(e) => {
                        error!(rule_name = %rule_name, error = %e, "Failed to enqueue firing");
                    }
                }
            }
        }

        enqueued
    }

    /// Evaluate firings on every tick until [`TriggerEngine::stop`] is called
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            rules = self.scheduler.len(),
            "Starting trigger engine"
        );

        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let from = std::mem::replace(&mut *self.last_tick.lock().await, now);
                    let enqueued = self.fire_due(from, now).await;
                    if enqueued > 0 {
                        info!(enqueued, "Processed due firings");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping trigger engine");
                    break;
                }
            }
        }

        info!("Trigger engine stopped");
    }

    pub fn stop(&self) {
        info!("Stopping trigger engine");
        let _ = self.shutdown_tx.send(());
    }
}
