//! Waypoint Development Runner
//!
//! Single binary for exercising the router locally:
//! - In-memory repository and three demo stages plus a dead-letter stage
//! - Rule-based profiles (express messages skip enrichment)
//! - Lifecycle telemetry and an optional Prometheus endpoint
//! - Final pool states printed as JSON

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use dashmap::DashSet;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use wp_common::{PriorityMessage, RoutingError};
use wp_config::WaypointConfig;
use wp_queue::ProcessError;
use wp_router::{
    InMemoryRepository, LifecycleConfig, LifecycleManager, MessageHandler, MessageRouter,
    NotifyMessageRouted, RouteContainer, RoutingProfile, RoutingRequest, RuleProfileProvider,
    StageRoute, failure_policy_from_settings,
};

const DEAD_LETTER: &str = "dead-letter";

/// Waypoint Development Runner
#[derive(Parser, Debug)]
#[command(name = "wp-dev")]
#[command(about = "Route a batch of demo messages through in-memory stages")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "WAYPOINT_JSON_LOGS", default_value = "false")]
    json_logs: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "WAYPOINT_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Number of demo messages to route
    #[arg(long, default_value = "25")]
    messages: usize,

    /// Simulated work per stage in milliseconds
    #[arg(long, default_value = "20")]
    stage_delay_ms: u64,

    /// Keep running after the batch is delivered until Ctrl+C
    #[arg(long, default_value = "false")]
    hold: bool,
}

#[derive(Debug, Clone)]
struct Shipment {
    id: Uuid,
    number: usize,
    express: bool,
    requested: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl Shipment {
    fn demo(number: usize) -> Self {
        let requested = Utc::now();
        let express = number % 5 == 0;
        let minutes = if express { 2 } else { 30 + (number as i64 % 7) * 10 };
        Self {
            id: Uuid::new_v4(),
            number,
            express,
            requested,
            deadline: requested + chrono::Duration::minutes(minutes),
        }
    }
}

impl PriorityMessage for Shipment {
    fn message_id(&self) -> Uuid {
        self.id
    }

    fn request_time(&self) -> DateTime<Utc> {
        self.requested
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn escalation_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }
}

/// Simulated stage; every seventh shipment fails its first attempt.
struct DemoStage {
    name: &'static str,
    delay: Duration,
    flaky: bool,
    failed_once: DashSet<Uuid>,
}

impl DemoStage {
    fn new(name: &'static str, delay: Duration, flaky: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            flaky,
            failed_once: DashSet::new(),
        })
    }
}

#[async_trait]
impl MessageHandler<Shipment> for DemoStage {
    async fn handle(&self, shipment: &Shipment) -> Result<(), ProcessError> {
        tokio::time::sleep(self.delay).await;
        if self.flaky && shipment.number % 7 == 0 && self.failed_once.insert(shipment.id) {
            return Err(RoutingError::processing(
                Some(shipment.id),
                format!("{} temporarily unavailable", self.name),
            )
            .into());
        }
        Ok(())
    }
}

/// Counts deliveries and wakes the main task when the batch is done.
struct BatchTracker {
    expected: usize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
    done: Notify,
}

impl NotifyMessageRouted<Shipment> for BatchTracker {
    fn delivered(&self, request: &RoutingRequest<Shipment>) {
        if let Some(error) = request.error() {
            warn!(message_id = %request.message_id(), error = %error, "Shipment delivered with error");
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if self.delivered.fetch_add(1, Ordering::SeqCst) + 1 == self.expected {
            self.done.notify_one();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = WaypointConfig::load(args.config.as_deref())?;

    wp_common::logging::init(args.json_logs);
    info!("Starting Waypoint dev runner");

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Metrics available on http://{}/metrics", addr);
    }

    // 1. Stages
    let delay = Duration::from_millis(args.stage_delay_ms);
    let container = Arc::new(RouteContainer::<Shipment>::new());
    for (name, flaky) in [("validate", false), ("enrich", true), ("dispatch", false), (DEAD_LETTER, false)] {
        let stage = StageRoute::<Shipment>::from_config(name, DemoStage::new(name, delay, flaky), &config);
        container.register(stage)?;
    }
    info!(routes = ?container.names(), "Stages registered");

    // 2. Profiles
    let profiles = RuleProfileProvider::builder(DEAD_LETTER)
        .rule(
            |shipment: &Shipment| shipment.express,
            RoutingProfile::new("express", ["validate", "dispatch"]),
        )
        .default_profile(RoutingProfile::new("standard", ["validate", "enrich", "dispatch"]))
        .failure_policy(failure_policy_from_settings(&config.failure_policy))
        .build();

    // 3. Router and lifecycle
    let repository = Arc::new(InMemoryRepository::new());
    let router = MessageRouter::new(container, repository.clone(), Arc::new(profiles), &config);
    let lifecycle = LifecycleManager::start(router.clone(), LifecycleConfig::from(&config.lifecycle));

    // 4. Demo batch
    let tracker = Arc::new(BatchTracker {
        expected: args.messages,
        delivered: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
        done: Notify::new(),
    });
    for number in 0..args.messages {
        if let Err(e) = router.send_message(Shipment::demo(number), tracker.clone()).await {
            error!(number, error = %e, "Failed to send shipment");
        }
    }
    info!(messages = args.messages, "Demo batch submitted");

    if args.messages > 0 {
        tokio::select! {
            _ = tracker.done.notified() => {
                info!(
                    delivered = tracker.delivered.load(Ordering::SeqCst),
                    failed = tracker.failed.load(Ordering::SeqCst),
                    stored = repository.len(),
                    "Demo batch delivered"
                );
            }
            _ = shutdown_signal() => {
                warn!("Interrupted before the batch was delivered");
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&router.pool_states())?);

    if args.hold {
        info!("Holding, press Ctrl+C to shutdown");
        shutdown_signal().await;
    }

    info!("Shutting down...");
    lifecycle.shutdown().await;
    router.dispose();

    info!("Waypoint dev runner shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
