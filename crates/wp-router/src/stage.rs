//! Service routes: the stages a request is pushed through.
//!
//! A route accepts requests with `send` and reports every outcome back to its
//! subscribers as a [`RouteResponse`]. [`StageRoute`] is the stock
//! implementation, running a [`MessageHandler`] on a self-scaling queue pool.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;
use wp_common::{Comparer, PoolState, PriorityComparer, PriorityMessage, RoutingError};
use wp_config::{PoolSettings, WaypointConfig};
use wp_queue::{
    ProcessError, QueueItem, QueueMonitor, QueuePool, QueueProcessor, QueuingPolicy, SendError,
    StopReason, SubscriptionId, Subscribers, queuing_policy_from_settings,
};

use crate::request::RoutingRequest;

/// Outcome of one request's visit to a route.
pub struct RouteResponse<T: PriorityMessage> {
    pub request: Arc<RoutingRequest<T>>,
    pub route_name: String,
    pub error: Option<RoutingError>,
}

impl<T: PriorityMessage> Clone for RouteResponse<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            route_name: self.route_name.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T: PriorityMessage> fmt::Debug for RouteResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteResponse")
            .field("message_id", &self.request.message_id())
            .field("route_name", &self.route_name)
            .field("error", &self.error)
            .finish()
    }
}

impl<T: PriorityMessage> QueueItem for RouteResponse<T> {
    fn correlation_id(&self) -> Uuid {
        self.request.message_id()
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.request.message_id(), self.route_name)
    }
}

pub trait RouteListener<T: PriorityMessage>: Send + Sync {
    fn on_response(&self, response: RouteResponse<T>);
}

/// A named, independently running stage.
pub trait ServiceRoute<T: PriorityMessage>: Send + Sync {
    fn name(&self) -> &str;

    /// Hand a request to the route. The outcome arrives later through
    /// [`RouteListener::on_response`].
    fn send(&self, request: Arc<RoutingRequest<T>>) -> Result<(), RoutingError>;

    fn subscribe(&self, listener: Arc<dyn RouteListener<T>>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn cancel(&self);

    fn state(&self) -> PoolState;
}

/// Business logic run for each message reaching a [`StageRoute`].
///
/// Return [`ProcessError::Domain`] for an expected failure the router should
/// retry or divert; [`ProcessError::Unexpected`] aborts the worker and the
/// request is reported as failed.
#[async_trait]
pub trait MessageHandler<T: PriorityMessage>: Send + Sync + 'static {
    async fn handle(&self, message: &T) -> Result<(), ProcessError>;
}

/// Request as queued inside a stage pool.
pub(crate) struct StageItem<T: PriorityMessage>(pub(crate) Arc<RoutingRequest<T>>);

impl<T: PriorityMessage> Clone for StageItem<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: PriorityMessage> QueueItem for StageItem<T> {
    fn is_canceled(&self) -> bool {
        self.0.is_canceled()
    }

    fn correlation_id(&self) -> Uuid {
        self.0.message_id()
    }

    fn describe(&self) -> String {
        self.0.message_id().to_string()
    }
}

/// Orders requests by message priority, falling back to request identity so
/// two requests for the same message never collide in a sorted collection.
pub(crate) fn request_order<T: PriorityMessage>(
    priority: Arc<dyn Comparer<T>>,
) -> impl Fn(&RoutingRequest<T>, &RoutingRequest<T>) -> std::cmp::Ordering + Send + Sync + 'static {
    move |a: &RoutingRequest<T>, b: &RoutingRequest<T>| {
        priority
            .compare(a.message(), b.message())
            .then_with(|| a.id().cmp(&b.id()))
    }
}

struct StageProcessor<T: PriorityMessage> {
    handler: Arc<dyn MessageHandler<T>>,
}

#[async_trait]
impl<T: PriorityMessage> QueueProcessor<StageItem<T>> for StageProcessor<T> {
    async fn process(&self, item: &StageItem<T>) -> Result<(), ProcessError> {
        self.handler.handle(item.0.message()).await
    }
}

/// Turns pool events into route responses.
struct StageMonitor<T: PriorityMessage> {
    route_name: String,
    listeners: Arc<Subscribers<dyn RouteListener<T>>>,
}

impl<T: PriorityMessage> StageMonitor<T> {
    fn respond(&self, request: &Arc<RoutingRequest<T>>, error: Option<RoutingError>) {
        for listener in self.listeners.snapshot() {
            listener.on_response(RouteResponse {
                request: request.clone(),
                route_name: self.route_name.clone(),
                error: error.clone(),
            });
        }
    }
}

impl<T: PriorityMessage> QueueMonitor<StageItem<T>> for StageMonitor<T> {
    fn on_completed(&self, _source: Uuid, item: &StageItem<T>, error: Option<&RoutingError>) {
        self.respond(&item.0, error.cloned());
    }

    fn on_stopped(&self, _source: Uuid, reason: &StopReason<StageItem<T>>) {
        match reason {
            StopReason::Idle => {}
            StopReason::Aborted(abort) => {
                let id = abort.aborted_item.0.message_id();
                self.respond(
                    &abort.aborted_item.0,
                    Some(RoutingError::processing(Some(id), abort.reason.clone())),
                );
                for item in &abort.pending {
                    let id = item.0.message_id();
                    self.respond(
                        &item.0,
                        Some(RoutingError::processing(Some(id), "lost when route aborted")),
                    );
                }
            }
            StopReason::Faulted { error, pending } => {
                for item in pending {
                    let id = item.0.message_id();
                    self.respond(&item.0, Some(RoutingError::processing(Some(id), error.clone())));
                }
            }
            StopReason::Canceled { pending } => {
                for item in pending {
                    let id = item.0.message_id();
                    self.respond(&item.0, Some(RoutingError::canceled(id, "route canceled")));
                }
            }
        }
    }
}

/// A [`ServiceRoute`] that runs a handler on a [`QueuePool`], most urgent
/// message first.
pub struct StageRoute<T: PriorityMessage> {
    name: String,
    pool: Arc<QueuePool<StageItem<T>>>,
    listeners: Arc<Subscribers<dyn RouteListener<T>>>,
}

impl<T: PriorityMessage> StageRoute<T> {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler<T>>,
        policy: Arc<dyn QueuingPolicy>,
        settings: PoolSettings,
    ) -> Arc<Self> {
        Self::with_comparer(name, handler, Arc::new(PriorityComparer::<T>::new()), policy, settings)
    }

    pub fn with_comparer(
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler<T>>,
        priority: Arc<dyn Comparer<T>>,
        policy: Arc<dyn QueuingPolicy>,
        settings: PoolSettings,
    ) -> Arc<Self> {
        let name = name.into();
        let order = request_order(priority);
        let comparer: Arc<dyn Comparer<StageItem<T>>> =
            Arc::new(move |a: &StageItem<T>, b: &StageItem<T>| order(&*a.0, &*b.0));

        let pool = QueuePool::new(
            name.clone(),
            comparer,
            Arc::new(StageProcessor { handler }),
            policy,
            settings,
        );
        let listeners: Arc<Subscribers<dyn RouteListener<T>>> = Arc::new(Subscribers::new());
        pool.subscribe(Arc::new(StageMonitor {
            route_name: name.clone(),
            listeners: listeners.clone(),
        }));

        Arc::new(Self {
            name,
            pool,
            listeners,
        })
    }

    /// Stage sized by the `[queuing_policy]` and `[pool]` settings.
    pub fn from_config(
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler<T>>,
        config: &WaypointConfig,
    ) -> Arc<Self> {
        Self::new(
            name,
            handler,
            queuing_policy_from_settings(&config.queuing_policy),
            config.pool.clone(),
        )
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T: PriorityMessage> ServiceRoute<T> for StageRoute<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: Arc<RoutingRequest<T>>) -> Result<(), RoutingError> {
        let message_id = request.message_id();
        request.notification().received(&request, &self.name);

        match self.pool.send_message(StageItem(request)) {
            Ok(()) => {
                debug!(route = %self.name, message_id = %message_id, "Request queued on stage");
                Ok(())
            }
            Err(SendError::Canceled(_)) => {
                warn!(route = %self.name, message_id = %message_id, "Stage is canceled");
                Err(RoutingError::processing(
                    Some(message_id),
                    format!("route {} is canceled", self.name),
                ))
            }
            Err(SendError::Duplicate(_)) => Err(RoutingError::policy(
                Some(message_id),
                format!("request already queued on route {}", self.name),
            )),
        }
    }

    fn subscribe(&self, listener: Arc<dyn RouteListener<T>>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn cancel(&self) {
        self.pool.cancel();
    }

    fn state(&self) -> PoolState {
        self.pool.state()
    }
}
