//! Lifecycle Manager - Background tasks for the message router
//!
//! Handles:
//! - Periodic telemetry: pool states to logs and gauges
//! - Health checks: open-request growth and stages falling behind
//! - Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wp_common::PriorityMessage;
use wp_config::LifecycleSettings;

use crate::router::MessageRouter;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for pool telemetry reports
    pub telemetry_interval: Duration,
    /// Interval for health checks
    pub health_interval: Duration,
    /// Open requests above this count are reported as a potential leak
    pub open_request_warning_threshold: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&LifecycleSettings::default())
    }
}

impl From<&LifecycleSettings> for LifecycleConfig {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            telemetry_interval: Duration::from_secs(settings.telemetry_interval_secs),
            health_interval: Duration::from_secs(settings.health_interval_secs),
            open_request_warning_threshold: settings.open_request_warning_threshold,
        }
    }
}

/// Manages lifecycle tasks for the message router
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start<T: PriorityMessage>(router: Arc<MessageRouter<T>>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        // Telemetry reporter
        {
            let router = router.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.telemetry_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for state in router.pool_states() {
                                metrics::gauge!("waypoint_router_stage_queue_length", "stage" => state.name.clone())
                                    .set(state.queue_length as f64);
                                metrics::gauge!("waypoint_router_stage_queue_count", "stage" => state.name.clone())
                                    .set(state.queue_count as f64);
                                debug!(
                                    stage = %state.name,
                                    queue_count = state.queue_count,
                                    queue_length = state.queue_length,
                                    processed = state.processed,
                                    avg_response_ms = state.average_response_latency.as_millis() as u64,
                                    "Stage telemetry"
                                );
                            }
                            metrics::gauge!("waypoint_router_open_requests").set(router.open_request_count() as f64);
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Telemetry reporter shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Health monitor
        {
            let router = router.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_interval;
            let threshold = config.open_request_warning_threshold;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let open = router.open_request_count();
                            if open > threshold {
                                warn!(open_requests = open, threshold, "Open request count above threshold - potential leak");
                            }

                            let lagging: Vec<String> = router
                                .pool_states()
                                .into_iter()
                                .filter(|state| state.is_falling_behind() || state.aborted_count > 0)
                                .map(|state| state.name)
                                .collect();
                            if !lagging.is_empty() {
                                warn!(stages = ?lagging, "Router stages falling behind or aborted");
                            } else {
                                debug!(open_requests = open, "Health check: OK");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health monitor shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!("Lifecycle manager started with all background tasks");

        Self {
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Signal shutdown to all lifecycle tasks and wait for them to exit
    pub async fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "Lifecycle task ended abnormally");
            }
        }
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|task| !task.is_finished()).count()
    }
}
