//! QueuePool - one logical stage over a self-scaling set of queue routes
//!
//! Items land in the pool's own sorted collection and are dispatched under a
//! pool-wide lock:
//! 1. the most available idle route is promoted and takes the item
//! 2. otherwise, if the queuing policy approves, a new route is created
//! 3. otherwise the most available active route takes it
//! 4. failing all of that a route is created anyway
//!
//! Route stops are folded back into the pool: idle routes are demoted,
//! aborted routes have their backlog resubmitted, faulted or canceled routes
//! have theirs parked in the aborted set.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wp_common::{Comparer, PoolState, QueueState, RoutingError};
use wp_config::PoolSettings;

use crate::availability::QueueAvailabilityComparer;
use crate::collection::ConcurrentSortedCollection;
use crate::error::{AbortError, SendError};
use crate::monitor::{QueueMonitor, StopReason, SubscriptionId, Subscribers};
use crate::policy::QueuingPolicy;
use crate::route::QueueRoute;
use crate::{QueueItem, QueueProcessor};

pub struct QueuePool<I: QueueItem> {
    id: Uuid,
    name: String,
    self_ref: Weak<QueuePool<I>>,
    comparer: Arc<dyn Comparer<I>>,
    processor: Arc<dyn QueueProcessor<I>>,
    policy: Arc<dyn QueuingPolicy>,
    settings: PoolSettings,

    /// Items not yet handed to a route
    items: ConcurrentSortedCollection<I>,
    /// Items lost to faulted or canceled routes
    aborted: ConcurrentSortedCollection<I>,

    active: DashMap<Uuid, Arc<QueueRoute<I>>>,
    idle: DashMap<Uuid, Arc<QueueRoute<I>>>,
    dispatch_lock: Mutex<()>,
    monitors: Subscribers<dyn QueueMonitor<I>>,

    requested: AtomicU64,
    processed: AtomicU64,
    resubmitted: AtomicU64,
    highest_concurrency: AtomicUsize,
    route_counter: AtomicU64,
    canceled: AtomicBool,
}

impl<I: QueueItem> QueuePool<I> {
    pub fn new(
        name: impl Into<String>,
        comparer: Arc<dyn Comparer<I>>,
        processor: Arc<dyn QueueProcessor<I>>,
        policy: Arc<dyn QueuingPolicy>,
        settings: PoolSettings,
    ) -> Arc<Self> {
        let name = name.into();
        let pool = Arc::new_cyclic(|self_ref| Self {
            id: Uuid::new_v4(),
            name,
            self_ref: self_ref.clone(),
            items: ConcurrentSortedCollection::new(comparer.clone()),
            aborted: ConcurrentSortedCollection::new(comparer.clone()),
            comparer,
            processor,
            policy,
            settings,
            active: DashMap::new(),
            idle: DashMap::new(),
            dispatch_lock: Mutex::new(()),
            monitors: Subscribers::new(),
            requested: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            resubmitted: AtomicU64::new(0),
            highest_concurrency: AtomicUsize::new(0),
            route_counter: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
        });

        pool.create_route(false);
        info!(pool = %pool.name, pool_id = %pool.id, "Queue pool created");
        pool
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, monitor: Arc<dyn QueueMonitor<I>>) -> SubscriptionId {
        self.monitors.subscribe(monitor)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.monitors.unsubscribe(id)
    }

    /// Queue an item for processing by one of the member routes.
    pub fn send_message(&self, item: I) -> Result<(), SendError<I>> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(SendError::Canceled(item));
        }

        let returned = item.clone();
        if !self.items.try_add(item) {
            return Err(SendError::Duplicate(returned));
        }
        self.requested.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("waypoint_pool_requested_total", "pool" => self.name.clone()).increment(1);

        self.dispatch();
        Ok(())
    }

    /// Cancel every member route. Queued and pending items move to the
    /// aborted set and are reported through [`StopReason::Canceled`].
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = {
            let _guard = self.dispatch_lock.lock();
            self.items.drain()
        };
        for item in &pending {
            self.aborted.try_add(item.clone());
        }

        let routes = self.routes();
        info!(
            pool = %self.name,
            pool_id = %self.id,
            routes = routes.len(),
            pending = pending.len(),
            "Canceling queue pool"
        );
        for route in routes {
            route.cancel();
        }

        if !pending.is_empty() {
            self.notify_stopped(&StopReason::Canceled { pending });
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// True when every requested item has been processed. Items parked in
    /// the aborted set keep this false.
    pub fn is_stopping(&self) -> bool {
        self.requested.load(Ordering::SeqCst) == self.processed.load(Ordering::SeqCst)
    }

    pub fn aborted_messages(&self) -> Vec<I> {
        self.aborted.to_vec()
    }

    pub fn resubmitted_count(&self) -> u64 {
        self.resubmitted.load(Ordering::SeqCst)
    }

    pub fn queue_count(&self) -> usize {
        self.active.len() + self.idle.len()
    }

    pub fn highest_concurrency(&self) -> usize {
        self.highest_concurrency.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PoolState {
        let queues: Vec<QueueState> = self.routes().iter().map(|route| route.state()).collect();
        let backlog: u64 = queues.iter().map(|queue| queue.queue_length).sum();

        PoolState {
            id: self.id,
            name: self.name.clone(),
            queue_count: queues.len(),
            active_count: self.active.len(),
            idle_count: self.idle.len(),
            highest_concurrency: self.highest_concurrency(),
            requested: self.requested.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            queue_length: self.items.len() as u64 + backlog,
            average_request_latency: mean_duration(queues.iter().map(|q| q.average_request_latency)),
            average_response_latency: mean_duration(queues.iter().map(|q| q.average_response_latency)),
            failure_rate: mean(queues.iter().map(|q| q.failure_rate)),
            aborted_count: self.aborted.len(),
            resubmitted_count: self.resubmitted_count(),
            canceled: self.is_canceled(),
            queues,
        }
    }

    /// The pool summarised as a single queue, for monitors of a wrapped pool.
    pub fn summary(&self) -> QueueState {
        let state = self.state();
        QueueState {
            id: state.id,
            name: state.name,
            requested: state.requested,
            processed: state.processed,
            queue_length: state.queue_length,
            average_request_latency: state.average_request_latency,
            average_response_latency: state.average_response_latency,
            failure_rate: state.failure_rate,
            aborted: state.canceled,
            busy: state.active_count > 0,
        }
    }

    fn routes(&self) -> Vec<Arc<QueueRoute<I>>> {
        self.active
            .iter()
            .chain(self.idle.iter())
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn dispatch(&self) {
        let rejected = self.dispatch_locked();
        for item in rejected {
            let error = RoutingError::policy(Some(item.correlation_id()), "item already queued on route");
            self.handle_completed(&item, Some(&error));
        }
    }

    /// Hands queued items to routes; returns the duplicates a route refused.
    fn dispatch_locked(&self) -> Vec<I> {
        let _guard = self.dispatch_lock.lock();
        let mut rejected = Vec::new();

        while let Some(item) = self.items.try_take() {
            if self.is_canceled() {
                self.aborted.try_add(item);
                continue;
            }

            let mut item = item;
            loop {
                let route = self.select_route();
                match route.send_message(item) {
                    Ok(()) => break,
                    Err(SendError::Canceled(returned)) => {
                        debug!(pool = %self.name, queue = %route.name(), "Route refused item, replacing");
                        self.remove_route(route.id());
                        item = returned;
                    }
                    Err(SendError::Duplicate(returned)) => {
                        warn!(pool = %self.name, item = %returned.describe(), "Item already queued on route, rejecting");
                        rejected.push(returned);
                        break;
                    }
                }
            }
        }
        rejected
    }

    fn select_route(&self) -> Arc<QueueRoute<I>> {
        let idle: Vec<_> = self.idle.iter().map(|entry| entry.value().clone()).collect();
        if let Some(route) = QueueAvailabilityComparer::most_available(&idle) {
            self.idle.remove(&route.id());
            self.active.insert(route.id(), route.clone());
            return route;
        }

        let decision = self.policy.allow_queue_creation(&self.state());
        if decision.approved {
            debug!(pool = %self.name, reason = %decision.reason, "Queue creation approved");
            return self.create_route(true);
        }

        let active: Vec<_> = self.active.iter().map(|entry| entry.value().clone()).collect();
        if let Some(route) = QueueAvailabilityComparer::most_available(&active) {
            return route;
        }

        warn!(pool = %self.name, reason = %decision.reason, "No route available, creating one despite policy");
        self.create_route(true)
    }

    fn create_route(&self, active: bool) -> Arc<QueueRoute<I>> {
        let number = self.route_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let route = QueueRoute::new(
            format!("{}-{}", self.name, number),
            self.comparer.clone(),
            self.processor.clone(),
            &self.settings.queue,
        );
        route.subscribe(Arc::new(RouteMonitor {
            pool: self.self_ref.clone(),
        }));

        if active {
            self.active.insert(route.id(), route.clone());
        } else {
            self.idle.insert(route.id(), route.clone());
        }

        let count = self.queue_count();
        self.highest_concurrency.fetch_max(count, Ordering::SeqCst);
        metrics::gauge!("waypoint_pool_queue_count", "pool" => self.name.clone()).set(count as f64);
        debug!(pool = %self.name, queue = %route.name(), queue_count = count, "Queue route created");
        route
    }

    fn remove_route(&self, id: Uuid) -> Option<Arc<QueueRoute<I>>> {
        let removed = self
            .active
            .remove(&id)
            .or_else(|| self.idle.remove(&id))
            .map(|(_, route)| route);
        if removed.is_some() {
            metrics::gauge!("waypoint_pool_queue_count", "pool" => self.name.clone())
                .set(self.queue_count() as f64);
        }
        removed
    }

    /// Keep a single idle route, cancel the rest.
    fn trim_idle_routes(&self) {
        let _guard = self.dispatch_lock.lock();
        let surplus: Vec<Arc<QueueRoute<I>>> = self
            .idle
            .iter()
            .skip(1)
            .map(|entry| entry.value().clone())
            .collect();
        if surplus.is_empty() {
            return;
        }

        debug!(pool = %self.name, trimmed = surplus.len(), "Trimming idle routes");
        for route in surplus {
            self.remove_route(route.id());
            route.cancel();
        }
    }

    /// Restore a single idle route once the last one has been dropped.
    fn ensure_route(&self) {
        if self.is_canceled() || self.queue_count() > 0 {
            return;
        }
        let _guard = self.dispatch_lock.lock();
        if !self.is_canceled() && self.queue_count() == 0 {
            let route = self.create_route(false);
            debug!(pool = %self.name, queue = %route.name(), "Replaced last stopped route");
        }
    }

    fn handle_completed(&self, item: &I, error: Option<&RoutingError>) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        for monitor in self.monitors.snapshot() {
            monitor.on_completed(self.id, item, error);
        }
    }

    fn handle_stopped(&self, source: Uuid, reason: &StopReason<I>) {
        match reason {
            StopReason::Idle => {
                if let Some((_, route)) = self.active.remove(&source) {
                    self.idle.insert(source, route);
                }
                if self.is_stopping() && self.settings.trim_idle_queues {
                    self.trim_idle_routes();
                }
                if !self.items.is_empty() {
                    self.dispatch();
                }
                if self.is_stopping() {
                    self.publish_state();
                    self.notify_stopped(&StopReason::Idle);
                }
            }
            StopReason::Aborted(abort) => {
                self.remove_route(source);
                self.ensure_route();
                let canceled = self.is_canceled();

                let mut lost = Vec::new();
                for item in &abort.pending {
                    if !canceled && self.items.try_add(item.clone()) {
                        self.resubmitted.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.aborted.try_add(item.clone());
                        lost.push(item.clone());
                    }
                }
                self.aborted.try_add(abort.aborted_item.clone());

                warn!(
                    pool = %self.name,
                    item = %abort.aborted_item.describe(),
                    resubmitted = abort.pending.len() - lost.len(),
                    reason = %abort.reason,
                    "Route aborted, resubmitting backlog"
                );
                metrics::counter!("waypoint_pool_aborted_total", "pool" => self.name.clone()).increment(1);

                self.dispatch();
                self.notify_stopped(&StopReason::Aborted(AbortError {
                    aborted_item: abort.aborted_item.clone(),
                    pending: lost,
                    reason: abort.reason.clone(),
                }));
            }
            StopReason::Faulted { error, pending } => {
                self.remove_route(source);
                self.ensure_route();
                for item in pending {
                    self.aborted.try_add(item.clone());
                }
                warn!(pool = %self.name, error = %error, pending = pending.len(), "Route faulted");
                self.notify_stopped(reason);
                if !self.items.is_empty() {
                    self.dispatch();
                }
            }
            StopReason::Canceled { pending } => {
                self.remove_route(source);
                self.ensure_route();
                for item in pending {
                    self.aborted.try_add(item.clone());
                }
                if !pending.is_empty() {
                    self.notify_stopped(reason);
                }
            }
        }
    }

    fn publish_state(&self) {
        let summary = self.summary();
        metrics::gauge!("waypoint_pool_queue_length", "pool" => self.name.clone())
            .set(summary.queue_length as f64);
        for monitor in self.monitors.snapshot() {
            monitor.on_state_changed(&summary);
        }
    }

    fn notify_stopped(&self, reason: &StopReason<I>) {
        for monitor in self.monitors.snapshot() {
            monitor.on_stopped(self.id, reason);
        }
    }
}

/// Route-to-pool adapter; holds the pool weakly so routes never keep it alive.
struct RouteMonitor<I: QueueItem> {
    pool: Weak<QueuePool<I>>,
}

impl<I: QueueItem> QueueMonitor<I> for RouteMonitor<I> {
    fn on_completed(&self, _source: Uuid, item: &I, error: Option<&RoutingError>) {
        if let Some(pool) = self.pool.upgrade() {
            pool.handle_completed(item, error);
        }
    }

    fn on_stopped(&self, source: Uuid, reason: &StopReason<I>) {
        if let Some(pool) = self.pool.upgrade() {
            pool.handle_stopped(source, reason);
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn mean_duration(values: impl Iterator<Item = Duration>) -> Duration {
    Duration::from_secs_f64(mean(values.map(|value| value.as_secs_f64())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::policy::StaticQueuingPolicy;
    use async_trait::async_trait;
    use tokio::sync::{Semaphore, mpsc};

    #[derive(Debug, Clone, PartialEq)]
    struct Job(u32);

    impl QueueItem for Job {
        fn describe(&self) -> String {
            format!("job-{}", self.0)
        }
    }

    fn by_seq() -> Arc<dyn Comparer<Job>> {
        Arc::new(|a: &Job, b: &Job| a.0.cmp(&b.0))
    }

    /// Blocks until the gate opens; aborts the worker on job 0.
    struct GatedProcessor {
        gate: Semaphore,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl GatedProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.gate.add_permits(10_000);
        }
    }

    #[async_trait]
    impl QueueProcessor<Job> for GatedProcessor {
        async fn process(&self, item: &Job) -> Result<(), ProcessError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(ProcessError::unexpected);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            permit?.forget();
            if item.0 == 0 {
                return Err(ProcessError::unexpected(anyhow::anyhow!("job zero is poison")));
            }
            Ok(())
        }
    }

    struct CompletionCounter(mpsc::UnboundedSender<u32>);

    impl QueueMonitor<Job> for CompletionCounter {
        fn on_completed(&self, _source: Uuid, item: &Job, _error: Option<&RoutingError>) {
            let _ = self.0.send(item.0);
        }
    }

    fn pool(policy: StaticQueuingPolicy, processor: Arc<GatedProcessor>) -> (Arc<QueuePool<Job>>, mpsc::UnboundedReceiver<u32>) {
        let pool = QueuePool::new("test", by_seq(), processor, Arc::new(policy), PoolSettings::default());
        let (tx, rx) = mpsc::unbounded_channel();
        pool.subscribe(Arc::new(CompletionCounter(tx)));
        (pool, rx)
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<u32>, count: usize) -> Vec<u32> {
        let mut seen = Vec::with_capacity(count);
        while seen.len() < count {
            let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for completions")
                .expect("completion channel closed");
            seen.push(next);
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_starts_with_single_idle_route() {
        let (pool, _rx) = pool(StaticQueuingPolicy::new(1, 4), GatedProcessor::new());
        let state = pool.state();
        assert_eq!(state.queue_count, 1);
        assert_eq!(state.idle_count, 1);
        assert_eq!(state.active_count, 0);
        assert!(pool.is_stopping());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scaling_respects_static_policy() {
        let processor = GatedProcessor::new();
        let (pool, mut rx) = pool(StaticQueuingPolicy::new(1, 3), processor.clone());

        for seq in 1..=10 {
            pool.send_message(Job(seq)).unwrap();
            assert!(pool.queue_count() <= 3);
        }
        assert_eq!(pool.state().active_count, 3);

        processor.open();
        let mut done = collect(&mut rx, 10).await;
        done.sort_unstable();
        assert_eq!(done, (1..=10).collect::<Vec<_>>());

        assert_eq!(pool.highest_concurrency(), 3);
        assert!(processor.max_concurrent.load(Ordering::SeqCst) <= 3);
        assert!(pool.is_stopping());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_loses_nothing() {
        const PENDING: u32 = 5;
        let processor = GatedProcessor::new();
        let (pool, mut rx) = pool(StaticQueuingPolicy::new(1, 1), processor.clone());

        for seq in 0..=PENDING {
            pool.send_message(Job(seq)).unwrap();
        }
        assert_eq!(pool.queue_count(), 1);

        processor.open();
        let mut done = collect(&mut rx, PENDING as usize).await;
        done.sort_unstable();
        assert_eq!(done, (1..=PENDING).collect::<Vec<_>>());

        let aborted = pool.aborted_messages();
        assert_eq!(aborted, vec![Job(0)]);
        assert_eq!(pool.resubmitted_count() + aborted.len() as u64, u64::from(PENDING) + 1);
        // The aborted item is never processed, so the pool never reports stopping.
        assert!(!pool.is_stopping());
        assert_eq!(pool.state().aborted_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_of_last_route_restores_one() {
        let processor = GatedProcessor::new();
        let (pool, mut rx) = pool(StaticQueuingPolicy::new(1, 1), processor.clone());

        pool.send_message(Job(0)).unwrap();
        processor.open();

        for _ in 0..100 {
            if !pool.aborted_messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.aborted_messages(), vec![Job(0)]);
        assert_eq!(pool.queue_count(), 1);

        pool.send_message(Job(7)).unwrap();
        assert_eq!(collect(&mut rx, 1).await, vec![7]);
        assert_eq!(pool.queue_count(), 1);
    }

    struct ErrorRecorder(mpsc::UnboundedSender<(u32, Option<RoutingError>)>);

    impl QueueMonitor<Job> for ErrorRecorder {
        fn on_completed(&self, _source: Uuid, item: &Job, error: Option<&RoutingError>) {
            let _ = self.0.send((item.0, error.cloned()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_item_already_on_route_completes_with_policy_error() {
        let processor = GatedProcessor::new();
        let (pool, _rx) = pool(StaticQueuingPolicy::new(1, 1), processor.clone());
        let (tx, mut errors) = mpsc::unbounded_channel();
        pool.subscribe(Arc::new(ErrorRecorder(tx)));

        pool.send_message(Job(1)).unwrap();
        pool.send_message(Job(2)).unwrap();
        // Job 1 blocks the worker so Job 2 stays queued on the route.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.send_message(Job(2)).unwrap();

        let (seq, error) = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("timed out waiting for rejection")
            .expect("completion channel closed");
        assert_eq!(seq, 2);
        assert!(matches!(error, Some(RoutingError::Policy { .. })));

        processor.open();
        let mut rest = Vec::new();
        while rest.len() < 2 {
            let (seq, error) = tokio::time::timeout(Duration::from_secs(5), errors.recv())
                .await
                .expect("timed out waiting for completions")
                .expect("completion channel closed");
            assert!(error.is_none());
            rest.push(seq);
        }
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trims_idle_routes_once_drained() {
        let processor = GatedProcessor::new();
        let (pool, mut rx) = pool(StaticQueuingPolicy::new(1, 4), processor.clone());
        for seq in 1..=4 {
            pool.send_message(Job(seq)).unwrap();
        }
        assert_eq!(pool.queue_count(), 4);

        processor.open();
        collect(&mut rx, 4).await;

        for _ in 0..50 {
            if pool.queue_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.queue_count(), 1);
        assert_eq!(pool.highest_concurrency(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_parks_backlog() {
        let processor = GatedProcessor::new();
        let (pool, _rx) = pool(StaticQueuingPolicy::new(1, 1), processor.clone());
        for seq in 1..=3 {
            pool.send_message(Job(seq)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.cancel();
        assert!(matches!(pool.send_message(Job(9)), Err(SendError::Canceled(_))));
        processor.open();

        for _ in 0..50 {
            if pool.aborted_messages().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Job 1 was in flight and completes; 2 and 3 are handed back.
        assert_eq!(pool.aborted_messages(), vec![Job(2), Job(3)]);
        assert!(pool.state().canceled);
    }
}
