//! QueueRoute - a single sequential worker over a priority-ordered backlog
//!
//! State machine: `Idle -> Running -> Stopping -> Idle`, with `Aborted` as the
//! terminal state after an unexpected failure or cancellation.
//! - One drain task at a time, spawned on demand by `send_message`
//! - Domain failures are reported per item, the worker keeps going
//! - Unexpected failures and panics abort the route and hand back every item

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wp_common::{Comparer, QueueState, RoutingError};
use wp_config::QueueSettings;

use crate::collection::ConcurrentSortedCollection;
use crate::error::{AbortError, ProcessError, SendError};
use crate::monitor::{QueueMonitor, StopReason, SubscriptionId, Subscribers};
use crate::telemetry::QueueTelemetry;
use crate::{QueueItem, QueueProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Idle,
    Running,
    Stopping,
    Aborted,
}

#[derive(Clone)]
struct Queued<I> {
    item: I,
    enqueued_at: Instant,
}

pub struct QueueRoute<I: QueueItem> {
    id: Uuid,
    name: String,
    items: ConcurrentSortedCollection<Queued<I>>,
    processor: Arc<dyn QueueProcessor<I>>,
    monitors: Subscribers<dyn QueueMonitor<I>>,
    status: Mutex<RouteStatus>,
    requested: AtomicU64,
    processed: AtomicU64,
    canceled: AtomicBool,
    telemetry: Mutex<QueueTelemetry>,
    in_flight: Mutex<Option<I>>,
}

impl<I: QueueItem> QueueRoute<I> {
    pub fn new(
        name: impl Into<String>,
        comparer: Arc<dyn Comparer<I>>,
        processor: Arc<dyn QueueProcessor<I>>,
        settings: &QueueSettings,
    ) -> Arc<Self> {
        let queued_comparer: Arc<dyn Comparer<Queued<I>>> =
            Arc::new(move |a: &Queued<I>, b: &Queued<I>| comparer.compare(&a.item, &b.item));

        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            items: ConcurrentSortedCollection::new(queued_comparer),
            processor,
            monitors: Subscribers::new(),
            status: Mutex::new(RouteStatus::Idle),
            requested: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
            telemetry: Mutex::new(QueueTelemetry::new(settings)),
            in_flight: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> RouteStatus {
        *self.status.lock()
    }

    pub fn subscribe(&self, monitor: Arc<dyn QueueMonitor<I>>) -> SubscriptionId {
        self.monitors.subscribe(monitor)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.monitors.unsubscribe(id)
    }

    /// Enqueue an item and make sure a drain task is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send_message(self: &Arc<Self>, item: I) -> Result<(), SendError<I>> {
        let mut status = self.status.lock();
        if self.canceled.load(Ordering::SeqCst) || *status == RouteStatus::Aborted {
            return Err(SendError::Canceled(item));
        }

        let returned = item.clone();
        if !self.items.try_add(Queued {
            item,
            enqueued_at: Instant::now(),
        }) {
            return Err(SendError::Duplicate(returned));
        }
        self.requested.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("waypoint_queue_requested_total", "queue" => self.name.clone()).increment(1);

        if matches!(*status, RouteStatus::Idle | RouteStatus::Stopping) {
            *status = RouteStatus::Running;
            self.spawn_drain();
        }
        drop(status);

        self.publish_state();
        Ok(())
    }

    /// Cancel the route. An idle route stops immediately; a running one stops
    /// before its next item. Pending items are reported through
    /// [`StopReason::Canceled`], then every monitor is dropped.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        let status = self.status.lock();
        let stop_now = matches!(*status, RouteStatus::Idle | RouteStatus::Stopping);
        let already_aborted = *status == RouteStatus::Aborted;
        drop(status);

        if stop_now {
            self.finish_canceled();
        } else if already_aborted {
            self.monitors.clear();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == RouteStatus::Aborted
    }

    /// True when every requested item has been processed.
    pub fn is_stopping(&self) -> bool {
        self.processed.load(Ordering::SeqCst) == self.requested.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> u64 {
        self.requested
            .load(Ordering::SeqCst)
            .saturating_sub(self.processed.load(Ordering::SeqCst))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> QueueState {
        let status = self.status();
        let requested = self.requested.load(Ordering::SeqCst);
        let processed = self.processed.load(Ordering::SeqCst);
        let telemetry = self.telemetry.lock();
        QueueState {
            id: self.id,
            name: self.name.clone(),
            requested,
            processed,
            queue_length: requested.saturating_sub(processed),
            average_request_latency: telemetry.average_request_latency(),
            average_response_latency: telemetry.average_response_latency(),
            failure_rate: telemetry.failure_rate(),
            aborted: status == RouteStatus::Aborted,
            busy: status == RouteStatus::Running,
        }
    }

    fn spawn_drain(self: &Arc<Self>) {
        let worker = tokio::spawn(self.clone().drain());
        let route = self.clone();
        tokio::spawn(async move {
            if let Err(join_error) = worker.await {
                route.fault(join_error.to_string());
            }
        });
    }

    async fn drain(self: Arc<Self>) {
        debug!(queue = %self.name, queue_id = %self.id, "Queue route drain started");

        loop {
            if self.canceled.load(Ordering::SeqCst) {
                self.finish_canceled();
                return;
            }

            let Some(queued) = self.items.try_take() else {
                let mut status = self.status.lock();
                if !self.items.is_empty() {
                    continue;
                }
                if self.canceled.load(Ordering::SeqCst) {
                    drop(status);
                    self.finish_canceled();
                    return;
                }
                *status = RouteStatus::Stopping;
                drop(status);

                debug!(queue = %self.name, queue_id = %self.id, "Queue route drained");
                self.publish_state();
                self.notify_stopped(&StopReason::Idle);

                let mut status = self.status.lock();
                if *status == RouteStatus::Stopping {
                    *status = RouteStatus::Idle;
                }
                return;
            };

            self.telemetry.lock().record_request(queued.enqueued_at.elapsed());
            let item = queued.item;

            if item.is_canceled() {
                debug!(queue = %self.name, item = %item.describe(), "Skipping canceled item");
                self.processed.fetch_add(1, Ordering::SeqCst);
                let error = RoutingError::canceled(item.correlation_id(), "canceled while queued");
                self.notify_completed(&item, Some(&error));
                continue;
            }

            *self.in_flight.lock() = Some(item.clone());
            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.processor.process(&item))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed();
            *self.in_flight.lock() = None;

            metrics::histogram!("waypoint_queue_response_seconds", "queue" => self.name.clone())
                .record(elapsed.as_secs_f64());

            match outcome {
                Ok(Ok(())) => {
                    self.telemetry.lock().record_response(elapsed, false);
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    self.notify_completed(&item, None);
                }
                Ok(Err(ProcessError::Domain(routing_error))) => {
                    warn!(
                        queue = %self.name,
                        item = %item.describe(),
                        error = %routing_error,
                        "Item failed"
                    );
                    self.telemetry.lock().record_response(elapsed, true);
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("waypoint_queue_failed_total", "queue" => self.name.clone())
                        .increment(1);
                    self.notify_completed(&item, Some(&routing_error));
                }
                Ok(Err(ProcessError::Unexpected(cause))) => {
                    self.abort(item, format!("{cause:#}"));
                    return;
                }
                Err(panic) => {
                    self.abort(item, panic_message(panic.as_ref()));
                    return;
                }
            }

            self.publish_state();
        }
    }

    fn abort(&self, item: I, reason: String) {
        *self.status.lock() = RouteStatus::Aborted;
        let pending: Vec<I> = self.items.drain().into_iter().map(|queued| queued.item).collect();

        error!(
            queue = %self.name,
            queue_id = %self.id,
            item = %item.describe(),
            pending = pending.len(),
            reason = %reason,
            "Queue route aborted"
        );
        metrics::counter!("waypoint_queue_aborted_total", "queue" => self.name.clone()).increment(1);

        self.publish_state();
        self.notify_stopped(&StopReason::Aborted(AbortError {
            aborted_item: item,
            pending,
            reason,
        }));
    }

    fn fault(&self, error: String) {
        *self.status.lock() = RouteStatus::Aborted;
        let mut pending: Vec<I> = self.in_flight.lock().take().into_iter().collect();
        pending.extend(self.items.drain().into_iter().map(|queued| queued.item));

        error!(
            queue = %self.name,
            queue_id = %self.id,
            pending = pending.len(),
            error = %error,
            "Queue route drain task faulted"
        );

        self.publish_state();
        self.notify_stopped(&StopReason::Faulted { error, pending });
    }

    fn finish_canceled(&self) {
        *self.status.lock() = RouteStatus::Aborted;
        let pending: Vec<I> = self.items.drain().into_iter().map(|queued| queued.item).collect();

        info!(
            queue = %self.name,
            queue_id = %self.id,
            pending = pending.len(),
            "Queue route canceled"
        );

        self.notify_stopped(&StopReason::Canceled { pending });
        self.monitors.clear();
    }

    fn publish_state(&self) {
        let state = self.state();
        metrics::gauge!("waypoint_queue_length", "queue" => self.name.clone())
            .set(state.queue_length as f64);
        for monitor in self.monitors.snapshot() {
            monitor.on_state_changed(&state);
        }
    }

    fn notify_completed(&self, item: &I, error: Option<&RoutingError>) {
        for monitor in self.monitors.snapshot() {
            monitor.on_completed(self.id, item, error);
        }
    }

    fn notify_stopped(&self, reason: &StopReason<I>) {
        for monitor in self.monitors.snapshot() {
            monitor.on_stopped(self.id, reason);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}
