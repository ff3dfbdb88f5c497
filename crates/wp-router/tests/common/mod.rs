//! Shared fixtures for router integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;
use wp_common::{PriorityMessage, RoutingError};
use wp_config::{PoolSettings, WaypointConfig};
use wp_queue::{ProcessError, StaticQueuingPolicy};
use wp_router::{
    FailurePolicy, InMemoryRepository, MessageHandler, MessageRouter, NotifyMessageRouted,
    RouteContainer, RoutingProfile, RoutingRequest, RuleProfileProvider, StageRoute,
};

pub const FAILURE_ROUTE: &str = "dead-letter";

#[derive(Debug, Clone)]
pub struct TestMessage {
    pub id: Uuid,
    /// Messages with the same key are duplicates of each other
    pub key: String,
    pub seq: u32,
    pub requested: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub threshold: chrono::Duration,
}

impl TestMessage {
    pub fn new(key: &str) -> Self {
        Self::with_seq(key, 0)
    }

    pub fn with_seq(key: &str, seq: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            seq,
            requested: now,
            deadline: now + chrono::Duration::minutes(10),
            threshold: chrono::Duration::minutes(2),
        }
    }
}

impl PriorityMessage for TestMessage {
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
        self.threshold
    }
}

/// Records every hook as `(message id, "hook[:route]")`.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, String)>>,
    delivered: Mutex<Vec<(Uuid, Option<RoutingError>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, id: Uuid, event: String) {
        self.events.lock().push((id, event));
    }

    pub fn events_for(&self, id: Uuid) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(event_id, _)| *event_id == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn delivered_count(&self, id: Uuid) -> usize {
        self.delivered.lock().iter().filter(|(event_id, _)| *event_id == id).count()
    }

    pub fn is_delivered(&self, id: Uuid) -> bool {
        self.delivered_count(id) > 0
    }

    /// Error carried by the first delivery of `id`.
    pub fn outcome(&self, id: Uuid) -> Option<RoutingError> {
        self.delivered
            .lock()
            .iter()
            .find(|(event_id, _)| *event_id == id)
            .and_then(|(_, error)| error.clone())
    }
}

impl NotifyMessageRouted<TestMessage> for RecordingNotifier {
    fn evaluated(&self, request: &RoutingRequest<TestMessage>) {
        self.push(request.message_id(), "evaluated".to_string());
    }

    fn routing(&self, request: &RoutingRequest<TestMessage>, route: &str) {
        self.push(request.message_id(), format!("routing:{route}"));
    }

    fn received(&self, request: &RoutingRequest<TestMessage>, route: &str) {
        self.push(request.message_id(), format!("received:{route}"));
    }

    fn routed(&self, request: &RoutingRequest<TestMessage>, route: &str, _error: Option<&RoutingError>) {
        self.push(request.message_id(), format!("routed:{route}"));
    }

    fn returned(&self, request: &RoutingRequest<TestMessage>, route: &str) {
        self.push(request.message_id(), format!("returned:{route}"));
    }

    fn delivered(&self, request: &RoutingRequest<TestMessage>) {
        self.push(request.message_id(), "delivered".to_string());
        self.delivered.lock().push((request.message_id(), request.error()));
    }
}

/// Which stages each message visited, in order.
#[derive(Default)]
pub struct VisitLog {
    visits: Mutex<Vec<(Uuid, String)>>,
}

impl VisitLog {
    pub fn visits_for(&self, id: Uuid) -> Vec<String> {
        self.visits
            .lock()
            .iter()
            .filter(|(visit_id, _)| *visit_id == id)
            .map(|(_, stage)| stage.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.visits.lock().len()
    }
}

/// Scriptable stage handler.
pub struct Stage {
    pub name: String,
    log: Arc<VisitLog>,
    /// Domain failures still to produce; `u32::MAX` fails forever
    fail_times: AtomicU32,
    unexpected: bool,
    gate: Option<Semaphore>,
    entered: AtomicUsize,
}

impl Stage {
    fn build(name: &str, log: &Arc<VisitLog>, fail_times: u32, unexpected: bool, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            fail_times: AtomicU32::new(fail_times),
            unexpected,
            gate: gated.then(|| Semaphore::new(0)),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn ok(name: &str, log: &Arc<VisitLog>) -> Arc<Self> {
        Self::build(name, log, 0, false, false)
    }

    pub fn failing(name: &str, log: &Arc<VisitLog>, times: u32) -> Arc<Self> {
        Self::build(name, log, times, false, false)
    }

    pub fn broken(name: &str, log: &Arc<VisitLog>) -> Arc<Self> {
        Self::build(name, log, 0, true, false)
    }

    pub fn gated(name: &str, log: &Arc<VisitLog>) -> Arc<Self> {
        Self::build(name, log, 0, false, true)
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler<TestMessage> for Stage {
    async fn handle(&self, message: &TestMessage) -> Result<(), ProcessError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(ProcessError::unexpected)?.forget();
        }
        self.log.visits.lock().push((message.id, self.name.clone()));

        if self.unexpected {
            return Err(ProcessError::unexpected(anyhow::anyhow!("{} crashed", self.name)));
        }

        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(RoutingError::processing(Some(message.id), format!("{} failed", self.name)).into());
        }
        Ok(())
    }
}

pub struct Harness {
    pub router: Arc<MessageRouter<TestMessage>>,
    pub repository: Arc<InMemoryRepository<TestMessage>>,
    pub container: Arc<RouteContainer<TestMessage>>,
    pub notifier: Arc<RecordingNotifier>,
    pub log: Arc<VisitLog>,
}

impl Harness {
    pub fn new(profiles: RuleProfileProvider<TestMessage>) -> Self {
        wp_common::logging::init_for_tests();
        let repository = Arc::new(InMemoryRepository::new());
        let container = Arc::new(RouteContainer::new());
        let router = MessageRouter::new(
            container.clone(),
            repository.clone(),
            Arc::new(profiles),
            &WaypointConfig::default(),
        );
        Self {
            router,
            repository,
            container,
            notifier: RecordingNotifier::new(),
            log: Arc::new(VisitLog::default()),
        }
    }

    /// Register `stage` under its own name.
    pub fn register(&self, stage: &Arc<Stage>) {
        let route = StageRoute::new(
            stage.name.clone(),
            stage.clone(),
            Arc::new(StaticQueuingPolicy::new(1, 2)),
            PoolSettings::default(),
        );
        self.container.register(route).expect("route names are unique");
    }

    pub async fn send(&self, message: &TestMessage) -> Arc<RoutingRequest<TestMessage>> {
        self.router
            .send_message(message.clone(), self.notifier.clone())
            .await
            .expect("message dispatched")
    }

    pub async fn wait_delivered(&self, id: Uuid) {
        let notifier = self.notifier.clone();
        eventually("delivery", move || notifier.is_delivered(id)).await;
    }
}

/// Profiles routing every message through `path`.
pub fn profiles(
    path: &[&str],
    failure_policy: Arc<dyn FailurePolicy<TestMessage>>,
) -> RuleProfileProvider<TestMessage> {
    RuleProfileProvider::builder(FAILURE_ROUTE)
        .default_profile(RoutingProfile::new("standard", path.iter().copied()))
        .failure_policy(failure_policy)
        .build()
}

/// Profiles treating messages with the same key as duplicates, the higher
/// `seq` being the latest.
pub fn deduplicating_profiles(path: &[&str]) -> RuleProfileProvider<TestMessage> {
    let profile = RoutingProfile::new("deduplicated", path.iter().copied())
        .with_duplicates(|a: &TestMessage, b: &TestMessage| a.key == b.key)
        .with_sequence(Arc::new(|a: &TestMessage, b: &TestMessage| a.seq.cmp(&b.seq)));
    RuleProfileProvider::builder(FAILURE_ROUTE)
        .default_profile(profile)
        .build()
}

pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
