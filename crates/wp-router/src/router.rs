//! Message Router - drives requests from submission to delivery
//!
//! A request flows through three internal queue pools, each ordered by message
//! priority:
//! 1. pending: resolves the routing configuration (and re-entry point for
//!    resumed messages)
//! 2. routing: decides the next hop, applies the failure policy and sends the
//!    request into a service route
//! 3. response: reacts to a service route's completion
//!
//! Every request ends in `finalize`, which records delivery and fires the
//! `delivered` hook exactly once.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wp_common::{Comparer, PoolState, PriorityMessage, RoutingError};
use wp_config::WaypointConfig;
use wp_queue::{
    ProcessError, QueueItem, QueueMonitor, QueuePool, QueueProcessor, SendError,
    StaticQueuingPolicy, StopReason, SubscriptionId,
};

use crate::configuration::RoutingConfiguration;
use crate::container::RouteContainer;
use crate::error::RouterError;
use crate::notification::NotifyMessageRouted;
use crate::profile::{ProfileProvider, RoutingProfile};
use crate::repository::{MessageRepository, RoutingEvent, RoutingStatus};
use crate::request::{Finalization, RouteLocation, RoutingRequest};
use crate::stage::{RouteListener, RouteResponse, ServiceRoute, request_order};
use crate::Result;

/// Location a request occupies while its configuration is being resolved.
pub const PENDING_ROUTE: &str = "__pending__";

/// Request as queued in the router's own stages.
struct RouterItem<T: PriorityMessage>(Arc<RoutingRequest<T>>);

impl<T: PriorityMessage> Clone for RouterItem<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

// Cancellation is handled by the stages themselves, so the default
// `is_canceled` is kept: a canceled request must still be finalized.
impl<T: PriorityMessage> QueueItem for RouterItem<T> {
    fn correlation_id(&self) -> Uuid {
        self.0.message_id()
    }

    fn describe(&self) -> String {
        self.0.message_id().to_string()
    }
}

trait CarriesRequest<T: PriorityMessage> {
    fn request(&self) -> &Arc<RoutingRequest<T>>;
}

impl<T: PriorityMessage> CarriesRequest<T> for RouterItem<T> {
    fn request(&self) -> &Arc<RoutingRequest<T>> {
        &self.0
    }
}

impl<T: PriorityMessage> CarriesRequest<T> for RouteResponse<T> {
    fn request(&self) -> &Arc<RoutingRequest<T>> {
        &self.request
    }
}

pub struct MessageRouter<T: PriorityMessage> {
    id: Uuid,
    self_ref: Weak<MessageRouter<T>>,
    container: Arc<RouteContainer<T>>,
    repository: Arc<dyn MessageRepository<T>>,
    profiles: Arc<dyn ProfileProvider<T>>,

    /// Serializes submission: save, duplicate check and open-set insertion
    message_lock: tokio::sync::Mutex<()>,
    open_requests: DashMap<Uuid, Arc<RoutingRequest<T>>>,

    pending_pool: Arc<QueuePool<RouterItem<T>>>,
    routing_pool: Arc<QueuePool<RouterItem<T>>>,
    response_pool: Arc<QueuePool<RouteResponse<T>>>,

    /// Service routes this router listens to, by name
    subscriptions: DashMap<String, (Arc<dyn ServiceRoute<T>>, SubscriptionId)>,
    canceled: AtomicBool,
    disposed: AtomicBool,
}

impl<T: PriorityMessage> MessageRouter<T> {
    pub fn new(
        container: Arc<RouteContainer<T>>,
        repository: Arc<dyn MessageRepository<T>>,
        profiles: Arc<dyn ProfileProvider<T>>,
        config: &WaypointConfig,
    ) -> Arc<Self> {
        let order = Arc::new(request_order(profiles.priority_comparer()));
        let item_order = order.clone();
        let item_comparer: Arc<dyn Comparer<RouterItem<T>>> =
            Arc::new(move |a: &RouterItem<T>, b: &RouterItem<T>| item_order(&*a.0, &*b.0));
        let response_comparer: Arc<dyn Comparer<RouteResponse<T>>> =
            Arc::new(move |a: &RouteResponse<T>, b: &RouteResponse<T>| {
                order(&*a.request, &*b.request).then_with(|| a.route_name.cmp(&b.route_name))
            });

        let router = Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let pending_pool = QueuePool::new(
                "router-pending",
                item_comparer.clone(),
                Arc::new(PendingProcessor { router: self_ref.clone() }),
                Arc::new(StaticQueuingPolicy::new(
                    1,
                    config.router.effective_pending_pool_max_queues(),
                )),
                config.pool.clone(),
            );
            let routing_pool = QueuePool::new(
                "router-routing",
                item_comparer,
                Arc::new(RoutingProcessor { router: self_ref.clone() }),
                Arc::new(StaticQueuingPolicy::single()),
                config.pool.clone(),
            );
            let response_pool = QueuePool::new(
                "router-response",
                response_comparer,
                Arc::new(ResponseProcessor { router: self_ref.clone() }),
                Arc::new(StaticQueuingPolicy::single()),
                config.pool.clone(),
            );

            pending_pool.subscribe(Arc::new(LostRequestMonitor::<T, RouterItem<T>>::new(self_ref.clone())));
            routing_pool.subscribe(Arc::new(LostRequestMonitor::<T, RouterItem<T>>::new(self_ref.clone())));
            response_pool.subscribe(Arc::new(LostRequestMonitor::<T, RouteResponse<T>>::new(self_ref.clone())));

            Self {
                id: Uuid::new_v4(),
                self_ref: self_ref.clone(),
                container,
                repository,
                profiles,
                message_lock: tokio::sync::Mutex::new(()),
                open_requests: DashMap::new(),
                pending_pool,
                routing_pool,
                response_pool,
                subscriptions: DashMap::new(),
                canceled: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }
        });

        info!(router_id = %router.id, "Message router created");
        router
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn container(&self) -> &Arc<RouteContainer<T>> {
        &self.container
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Persist and route a new request.
    ///
    /// Once the message is saved it is always driven to `delivered`: a
    /// failure after that point finalizes the request and is reported as
    /// [`RouterError::Dispatch`].
    pub async fn send(&self, request: Arc<RoutingRequest<T>>) -> Result<()> {
        self.ensure_running()?;
        let message_id = request.message_id();

        let _guard = self.message_lock.lock().await;
        if self.open_requests.contains_key(&message_id) {
            return Err(RoutingError::policy(Some(message_id), "message is already active").into());
        }

        let message = request.message();
        self.repository
            .save_message(message, message.transaction())
            .await
            .map_err(RouterError::Repository)?;
        metrics::counter!("waypoint_router_submitted_total").increment(1);

        self.dispatch_saved(request).await
    }

    /// Wrap `message` in a new request and [`send`](Self::send) it.
    pub async fn send_message(
        &self,
        message: T,
        notification: Arc<dyn NotifyMessageRouted<T>>,
    ) -> Result<Arc<RoutingRequest<T>>> {
        let request = RoutingRequest::new(message, notification);
        self.send(request.clone()).await?;
        Ok(request)
    }

    /// Restart a message from the top of its path.
    ///
    /// An active message is flagged and restarts when its current stage
    /// responds; otherwise it is reanimated from the repository.
    pub async fn requeue(&self, message: T, notification: Arc<dyn NotifyMessageRouted<T>>) -> Result<()> {
        self.ensure_running()?;
        let message_id = message.message_id();

        let _guard = self.message_lock.lock().await;
        if let Some(open) = self.active_request(message_id) {
            if open.request_requeue() {
                info!(message_id = %message_id, "Requeue flagged on active request");
                return Ok(());
            }
        }

        let request = self.reanimate(message, notification).await?;
        info!(message_id = %message_id, "Requeuing message");
        self.dispatch_saved(request).await
    }

    /// Cancel a saved, undelivered message. The request terminates on its
    /// next tick and still reaches `delivered`.
    pub async fn cancel_request(
        &self,
        status: &RoutingStatus<T>,
        notification: Arc<dyn NotifyMessageRouted<T>>,
    ) -> Result<()> {
        self.ensure_running()?;
        let message = &status.message;
        let message_id = message.message_id();
        let reason = || RoutingError::canceled(message_id, "canceled by request");

        let _guard = self.message_lock.lock().await;
        if !self.repository.is_saved(message).await.map_err(RouterError::Repository)? {
            return Err(RouterError::NotSaved { message_id });
        }
        if self.repository.is_delivered(message).await.map_err(RouterError::Repository)? {
            return Err(RouterError::AlreadyDelivered { message_id });
        }

        if let Some(open) = self.active_request(message_id) {
            info!(message_id = %message_id, "Canceling active request");
            open.cancel(reason());
            return Ok(());
        }

        info!(message_id = %message_id, route = %status.route_name, "Canceling inactive request");
        let request = RoutingRequest::resumed(message.clone(), notification, resume_location(status));
        request.cancel(reason());
        self.dispatch_saved(request).await
    }

    /// Reanimate every saved, undelivered message that is not already active.
    /// Returns how many were dispatched.
    pub async fn recover_pending(&self, notification: Arc<dyn NotifyMessageRouted<T>>) -> Result<usize> {
        self.ensure_running()?;
        let statuses = self
            .repository
            .select_pending_requests()
            .await
            .map_err(RouterError::Repository)?;

        let mut recovered = 0;
        for status in statuses {
            let message_id = status.message.message_id();
            let _guard = self.message_lock.lock().await;
            if self.open_requests.contains_key(&message_id) {
                continue;
            }

            let initial = resume_location(&status);
            let request = RoutingRequest::resumed(status.message, notification.clone(), initial);
            match self.dispatch_saved(request).await {
                Ok(()) => recovered += 1,
                Err(error) => warn!(message_id = %message_id, error = %error, "Failed to recover request"),
            }
        }

        info!(router_id = %self.id, recovered, "Pending requests recovered");
        Ok(recovered)
    }

    pub fn is_active(&self, message: &T) -> bool {
        self.open_requests.contains_key(&message.message_id())
    }

    pub fn open_request_count(&self) -> usize {
        self.open_requests.len()
    }

    /// Pending, routing and response stage snapshots, in that order.
    pub fn pool_states(&self) -> Vec<PoolState> {
        vec![
            self.pending_pool.state(),
            self.routing_pool.state(),
            self.response_pool.state(),
        ]
    }

    /// Stop accepting work, cancel the internal stages and stop listening to
    /// every service route. In-flight requests are abandoned where they are.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        self.pending_pool.cancel();
        self.routing_pool.cancel();
        self.response_pool.cancel();

        let names: Vec<String> = self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, (route, subscription))) = self.subscriptions.remove(&name) {
                route.unsubscribe(subscription);
            }
        }

        info!(router_id = %self.id, open_requests = self.open_requests.len(), "Message router canceled");
    }

    pub fn dispose(&self) {
        self.cancel();
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.open_requests.clear();
            info!(router_id = %self.id, "Message router disposed");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RouterError::Disposed);
        }
        if self.canceled.load(Ordering::SeqCst) {
            return Err(RouterError::Canceled);
        }
        Ok(())
    }

    fn active_request(&self, message_id: Uuid) -> Option<Arc<RoutingRequest<T>>> {
        self.open_requests.get(&message_id).map(|entry| entry.value().clone())
    }

    async fn reanimate(
        &self,
        message: T,
        notification: Arc<dyn NotifyMessageRouted<T>>,
    ) -> Result<Arc<RoutingRequest<T>>> {
        let message_id = message.message_id();
        if !self.repository.is_saved(&message).await.map_err(RouterError::Repository)? {
            return Err(RouterError::NotSaved { message_id });
        }

        if self.repository.is_delivered(&message).await.map_err(RouterError::Repository)? {
            let reopened = self
                .repository
                .reopen_request(&message)
                .await
                .map_err(RouterError::Repository)?;
            debug!(message_id = %message_id, "Reopened delivered message");
            return Ok(RoutingRequest::new(reopened, notification));
        }

        let initial = self
            .repository
            .routing_status(&message)
            .await
            .map_err(RouterError::Repository)?
            .and_then(|status| resume_location(&status));
        Ok(RoutingRequest::resumed(message, notification, initial))
    }

    /// Dispatch a request whose message is already saved; any failure
    /// finalizes it.
    async fn dispatch_saved(&self, request: Arc<RoutingRequest<T>>) -> Result<()> {
        let message_id = request.message_id();
        match self.dispatch_new(&request).await {
            Ok(()) => Ok(()),
            Err(cause) => {
                warn!(message_id = %message_id, error = %cause, "Dispatch failed, terminating request");
                if !request.is_canceled() {
                    request.set_error(cause.clone());
                }
                self.finalize(&request).await;
                Err(RouterError::Dispatch {
                    message_id,
                    source: anyhow::Error::from(cause),
                })
            }
        }
    }

    async fn dispatch_new(&self, request: &Arc<RoutingRequest<T>>) -> std::result::Result<(), RoutingError> {
        let message_id = request.message_id();
        request.notification().evaluated(request);

        if !request.is_canceled() {
            let profile = self.profiles.resolve_profile(request.message()).await?;
            request.set_profile(profile.clone());
            self.supersede(request, &profile)?;
        }

        self.open_requests.insert(message_id, request.clone());
        let location = request.park(PENDING_ROUTE);
        self.record(RoutingEvent::entry(message_id, &location)).await;

        self.pending_pool
            .send_message(RouterItem(request.clone()))
            .map_err(|_| RoutingError::processing(Some(message_id), "pending stage refused request"))?;

        debug!(message_id = %message_id, "Request dispatched");
        metrics::gauge!("waypoint_router_open_requests").set(self.open_requests.len() as f64);
        Ok(())
    }

    /// Among `request` and the open requests the profile deems duplicates of
    /// it, keep the latest by sequence and cancel the rest.
    fn supersede(
        &self,
        request: &Arc<RoutingRequest<T>>,
        profile: &RoutingProfile<T>,
    ) -> std::result::Result<(), RoutingError> {
        let Some(duplicates) = &profile.duplicate_comparer else {
            return Ok(());
        };

        let message_id = request.message_id();
        let mut candidates: Vec<Arc<RoutingRequest<T>>> = self
            .open_requests
            .iter()
            .filter(|entry| *entry.key() != message_id && !entry.value().is_canceled())
            .filter(|entry| duplicates.equals(entry.value().message(), request.message()))
            .map(|entry| entry.value().clone())
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.push(request.clone());

        let Some(latest) = candidates
            .iter()
            .max_by(|a, b| profile.sequence_comparer.compare(a.message(), b.message()))
            .cloned()
        else {
            return Ok(());
        };

        for candidate in candidates.iter().filter(|candidate| !Arc::ptr_eq(candidate, &latest)) {
            info!(
                message_id = %candidate.message_id(),
                superseded_by = %latest.message_id(),
                "Superseding duplicate message"
            );
            metrics::counter!("waypoint_router_superseded_total").increment(1);
            candidate.cancel(RoutingError::superseded(candidate.message_id()));
        }

        if Arc::ptr_eq(&latest, request) {
            Ok(())
        } else {
            Err(RoutingError::superseded(message_id))
        }
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn resolve_pending(&self, request: Arc<RoutingRequest<T>>) {
        if request.is_canceled() {
            self.submit_routing(request);
            return;
        }

        let profile = match request.profile() {
            Some(profile) => profile,
            None => match self.profiles.resolve_profile(request.message()).await {
                Ok(profile) => {
                    request.set_profile(profile.clone());
                    profile
                }
                Err(error) => {
                    warn!(message_id = %request.message_id(), error = %error, "Profile resolution failed");
                    request.set_error(error);
                    self.finalize(&request).await;
                    return;
                }
            },
        };

        let configuration = profile.configuration(self.profiles.failure_route());
        if let Some(initial) = request.initial_location() {
            let resume_at = self.profiles.continuation().resume_route(&configuration, &initial);
            debug!(
                message_id = %request.message_id(),
                initial = %initial.route,
                resume_at = ?resume_at,
                "Resuming request"
            );
            request.set_resume_at(resume_at);
        }
        request.set_configuration(Arc::new(configuration));

        self.submit_routing(request);
    }

    async fn route_request(&self, request: Arc<RoutingRequest<T>>) {
        let message_id = request.message_id();
        if request.is_canceled() {
            self.finalize(&request).await;
            return;
        }

        let Some(configuration) = request.configuration() else {
            request.set_error(RoutingError::configuration(
                Some(message_id),
                "request reached routing without a configuration",
            ));
            self.finalize(&request).await;
            return;
        };
        let current = request
            .current_location()
            .map(|location| location.route)
            .filter(|route| route != PENDING_ROUTE);

        if let Some(failure) = request.error() {
            if current.as_deref() == Some(configuration.failure_route()) {
                error!(message_id = %message_id, error = %failure, "Failure route failed, terminating request");
                self.finalize(&request).await;
                return;
            }

            let response = self.profiles.failure_policy().failure_response(request.message(), &failure);
            if response.retry {
                request.clear_error();
                if let Some(route) = &current {
                    request.resume_at_if_unset(route);
                }
                debug!(
                    message_id = %message_id,
                    error = %failure,
                    wait_ms = response.wait_time.as_millis() as u64,
                    block_queue = response.block_queue,
                    "Retrying request"
                );
                metrics::counter!("waypoint_router_retries_total").increment(1);
                self.retry(request, response.wait_time, response.block_queue).await;
                return;
            }

            request.take_resume_at();
            let failure_route = configuration.failure_route().to_string();
            warn!(message_id = %message_id, error = %failure, route = %failure_route, "Sending request to failure route");
            self.enter_route(&request, &configuration, failure_route).await;
            return;
        }

        let next = match request.take_resume_at() {
            Some(route) => Some(route),
            None if request.is_new() => configuration.first().map(str::to_string),
            None => current
                .as_deref()
                .and_then(|route| configuration.next_after(route))
                .map(str::to_string),
        };

        let Some(next) = next else {
            error!(message_id = %message_id, current = ?current, "No route to continue to");
            request.set_error(RoutingError::configuration(
                Some(message_id),
                format!("no route follows {}", current.as_deref().unwrap_or(PENDING_ROUTE)),
            ));
            self.finalize(&request).await;
            return;
        };

        self.enter_route(&request, &configuration, next).await;
    }

    async fn retry(&self, request: Arc<RoutingRequest<T>>, wait: std::time::Duration, block_queue: bool) {
        if wait.is_zero() {
            self.submit_routing(request);
        } else if block_queue {
            tokio::time::sleep(wait).await;
            self.submit_routing(request);
        } else {
            let router = self.self_ref.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(router) = router.upgrade() {
                    router.submit_routing(request);
                }
            });
        }
    }

    async fn enter_route(
        &self,
        request: &Arc<RoutingRequest<T>>,
        configuration: &RoutingConfiguration,
        name: String,
    ) {
        let message_id = request.message_id();
        let is_failure_route = configuration.is_failure_route(&name);

        let route = match self.container.resolve(&name) {
            Ok(route) => route,
            Err(_) => {
                warn!(message_id = %message_id, route = %name, "Route not found");
                request.set_error(RoutingError::route_not_found(Some(message_id), &name));
                if is_failure_route {
                    self.finalize(request).await;
                } else {
                    request.set_resume_at(Some(name));
                    self.submit_routing(request.clone());
                }
                return;
            }
        };

        self.ensure_subscribed(&route);
        let (location, left) = request.enter(&name);
        if let Some(left) = left {
            self.record(RoutingEvent::exit(message_id, &left, None)).await;
        }
        self.record(RoutingEvent::entry(message_id, &location)).await;

        debug!(message_id = %message_id, route = %name, "Routing request");
        request.notification().routing(request, &name);
        metrics::counter!("waypoint_router_routed_total", "route" => name.clone()).increment(1);

        if let Err(failure) = route.send(request.clone()) {
            warn!(message_id = %message_id, route = %name, error = %failure, "Route refused request");
            if let Some(left) = request.leave() {
                self.record(RoutingEvent::exit(message_id, &left, Some(&failure))).await;
            }
            request.set_error(failure);
            if is_failure_route {
                self.finalize(request).await;
            } else {
                request.set_resume_at(Some(name));
                self.submit_routing(request.clone());
            }
        }
    }

    async fn handle_response(&self, response: RouteResponse<T>) {
        let RouteResponse {
            request,
            route_name,
            error: failure,
        } = response;
        let message_id = request.message_id();
        request.notification().returned(&request, &route_name);

        if request.is_canceled() {
            if let Some(left) = request.leave() {
                self.record(RoutingEvent::exit(message_id, &left, request.error().as_ref())).await;
            }
            self.finalize(&request).await;
            return;
        }

        let Some(configuration) = request.configuration() else {
            request.set_error(RoutingError::configuration(
                Some(message_id),
                "response for a request without a configuration",
            ));
            self.finalize(&request).await;
            return;
        };

        let in_place = request
            .current_location()
            .is_some_and(|location| location.route == route_name)
            && self.container.contains(&route_name);
        if !in_place {
            let not_found = RoutingError::route_not_found(Some(message_id), &route_name);
            warn!(message_id = %message_id, route = %route_name, "Response from a route the request is not in");
            if let Some(left) = request.leave() {
                self.record(RoutingEvent::exit(message_id, &left, Some(&not_found))).await;
            }
            request.set_error(not_found);
            self.submit_routing(request);
            return;
        }

        if let Some(left) = request.leave() {
            self.record(RoutingEvent::exit(message_id, &left, failure.as_ref())).await;
        }

        if let Some(failure) = failure {
            if failure.is_canceled() {
                request.cancel(failure);
                self.finalize(&request).await;
            } else {
                request.set_error(failure);
                self.submit_routing(request);
            }
            return;
        }

        if request.take_requeue() {
            info!(message_id = %message_id, "Restarting requeued request");
            self.submit_routing(request);
            return;
        }

        if configuration.is_failure_route(&route_name) || configuration.is_last(&route_name) {
            self.finalize(&request).await;
        } else {
            self.submit_routing(request);
        }
    }

    async fn finalize(&self, request: &Arc<RoutingRequest<T>>) {
        let message_id = request.message_id();
        match request.begin_finalization() {
            Finalization::Proceed => {}
            Finalization::AlreadyFinalized => return,
            Finalization::Requeued => {
                info!(message_id = %message_id, "Requeue arrived before delivery, restarting request");
                self.submit_routing(request.clone());
                return;
            }
        }

        self.profiles.failure_policy().finalize_message(request.message());
        if let Err(error) = self.profiles.finalize_request(request).await {
            warn!(message_id = %message_id, error = %error, "Profile provider failed to finalize request");
        }

        let failure = request.error();
        if let Some(left) = request.leave() {
            self.record(RoutingEvent::exit(message_id, &left, failure.as_ref())).await;
        }
        self.record(RoutingEvent::delivered(message_id, failure.as_ref())).await;
        self.open_requests.remove_if(&message_id, |_, open| Arc::ptr_eq(open, request));

        let outcome = match &failure {
            None => "delivered",
            Some(error) if error.is_canceled() => "canceled",
            Some(_) => "failed",
        };
        match &failure {
            None => debug!(message_id = %message_id, "Request delivered"),
            Some(error) => info!(message_id = %message_id, outcome, error = %error, "Request delivered"),
        }
        metrics::counter!("waypoint_router_delivered_total", "outcome" => outcome).increment(1);
        metrics::gauge!("waypoint_router_open_requests").set(self.open_requests.len() as f64);

        request.notification().delivered(request);
    }

    /// Terminate a request lost to an aborted router stage.
    async fn abandon(&self, request: Arc<RoutingRequest<T>>, reason: String) {
        error!(message_id = %request.message_id(), reason = %reason, "Router stage lost request");
        request.set_error(RoutingError::processing(Some(request.message_id()), reason));
        self.finalize(&request).await;
    }

    fn submit_routing(&self, request: Arc<RoutingRequest<T>>) {
        match self.routing_pool.send_message(RouterItem(request)) {
            Ok(()) | Err(SendError::Duplicate(_)) => {}
            Err(SendError::Canceled(item)) => {
                debug!(message_id = %item.0.message_id(), "Routing stage canceled, request parked");
            }
        }
    }

    fn submit_response(&self, response: RouteResponse<T>) {
        if let Err(SendError::Canceled(response)) = self.response_pool.send_message(response) {
            debug!(message_id = %response.request.message_id(), "Response stage canceled, response dropped");
        }
    }

    fn ensure_subscribed(&self, route: &Arc<dyn ServiceRoute<T>>) {
        if self.subscriptions.contains_key(route.name()) {
            return;
        }
        if let Entry::Vacant(slot) = self.subscriptions.entry(route.name().to_string()) {
            let subscription = route.subscribe(Arc::new(RouterListener {
                router: self.self_ref.clone(),
            }));
            debug!(router_id = %self.id, route = %route.name(), "Subscribed to route");
            slot.insert((route.clone(), subscription));
        }
    }

    fn owns(&self, request: &Arc<RoutingRequest<T>>) -> bool {
        self.open_requests
            .get(&request.message_id())
            .is_some_and(|open| Arc::ptr_eq(open.value(), request))
    }

    async fn record(&self, event: RoutingEvent) {
        let message_id = event.message_id;
        if let Err(error) = self.repository.record_event(event).await {
            warn!(message_id = %message_id, error = %error, "Failed to record routing event");
        }
    }
}

/// Where a stored status says a resumed request should pick up, if anywhere.
fn resume_location<T: PriorityMessage>(status: &RoutingStatus<T>) -> Option<RouteLocation> {
    (status.route_name != PENDING_ROUTE).then(|| status.location())
}

struct PendingProcessor<T: PriorityMessage> {
    router: Weak<MessageRouter<T>>,
}

#[async_trait]
impl<T: PriorityMessage> QueueProcessor<RouterItem<T>> for PendingProcessor<T> {
    async fn process(&self, item: &RouterItem<T>) -> std::result::Result<(), ProcessError> {
        if let Some(router) = self.router.upgrade() {
            router.resolve_pending(item.0.clone()).await;
        }
        Ok(())
    }
}

struct RoutingProcessor<T: PriorityMessage> {
    router: Weak<MessageRouter<T>>,
}

#[async_trait]
impl<T: PriorityMessage> QueueProcessor<RouterItem<T>> for RoutingProcessor<T> {
    async fn process(&self, item: &RouterItem<T>) -> std::result::Result<(), ProcessError> {
        if let Some(router) = self.router.upgrade() {
            router.route_request(item.0.clone()).await;
        }
        Ok(())
    }
}

struct ResponseProcessor<T: PriorityMessage> {
    router: Weak<MessageRouter<T>>,
}

#[async_trait]
impl<T: PriorityMessage> QueueProcessor<RouteResponse<T>> for ResponseProcessor<T> {
    async fn process(&self, item: &RouteResponse<T>) -> std::result::Result<(), ProcessError> {
        if let Some(router) = self.router.upgrade() {
            router.handle_response(item.clone()).await;
        }
        Ok(())
    }
}

/// Receives service route responses on behalf of one router.
struct RouterListener<T: PriorityMessage> {
    router: Weak<MessageRouter<T>>,
}

impl<T: PriorityMessage> RouteListener<T> for RouterListener<T> {
    fn on_response(&self, response: RouteResponse<T>) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        if !router.owns(&response.request) {
            return;
        }
        response
            .request
            .notification()
            .routed(&response.request, &response.route_name, response.error.as_ref());
        router.submit_response(response);
    }
}

/// Finalizes requests an internal stage could not salvage.
struct LostRequestMonitor<T: PriorityMessage, I> {
    router: Weak<MessageRouter<T>>,
    _item: PhantomData<fn(&I)>,
}

impl<T: PriorityMessage, I> LostRequestMonitor<T, I> {
    fn new(router: Weak<MessageRouter<T>>) -> Self {
        Self {
            router,
            _item: PhantomData,
        }
    }

    fn abandon_all<'a>(&self, items: impl IntoIterator<Item = &'a I>, reason: &str)
    where
        I: CarriesRequest<T> + 'a,
    {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        for item in items {
            let router = router.clone();
            let request = item.request().clone();
            let reason = reason.to_string();
            tokio::spawn(async move { router.abandon(request, reason).await });
        }
    }
}

impl<T, I> QueueMonitor<I> for LostRequestMonitor<T, I>
where
    T: PriorityMessage,
    I: QueueItem + CarriesRequest<T>,
{
    fn on_stopped(&self, _source: Uuid, reason: &StopReason<I>) {
        match reason {
            StopReason::Aborted(abort) => self.abandon_all(
                std::iter::once(&abort.aborted_item).chain(abort.pending.iter()),
                &abort.reason,
            ),
            StopReason::Faulted { error, pending } => self.abandon_all(pending, error),
            StopReason::Idle | StopReason::Canceled { .. } => {}
        }
    }
}
