//! Routing Request - a message plus the state the router keeps for it

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wp_common::{PriorityMessage, RoutingError};

use crate::configuration::RoutingConfiguration;
use crate::notification::NotifyMessageRouted;
use crate::profile::RoutingProfile;
use crate::repository::RoutingStatus;

/// Where a request is (or was): route name, entry time and the id of the
/// entry event recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLocation {
    pub route: String,
    pub entered_at: DateTime<Utc>,
    pub event_id: Uuid,
}

impl RouteLocation {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            entered_at: Utc::now(),
            event_id: Uuid::new_v4(),
        }
    }
}

struct RequestState<T> {
    current: Option<RouteLocation>,
    /// Set while the request sits inside `current` and no exit was recorded
    in_route: bool,
    initial: Option<RouteLocation>,
    error: Option<RoutingError>,
    canceled: bool,
    requeue_pending: bool,
    is_new: bool,
    profile: Option<Arc<RoutingProfile<T>>>,
    configuration: Option<Arc<RoutingConfiguration>>,
    /// Route the next routing tick must enter instead of computing a hop
    resume_at: Option<String>,
    finalized: bool,
}

pub struct RoutingRequest<T: PriorityMessage> {
    id: Uuid,
    message: T,
    notification: Arc<dyn NotifyMessageRouted<T>>,
    state: Mutex<RequestState<T>>,
}

impl<T: PriorityMessage> RoutingRequest<T> {
    pub fn new(message: T, notification: Arc<dyn NotifyMessageRouted<T>>) -> Arc<Self> {
        Self::resumed(message, notification, None)
    }

    /// A request rebuilt from storage; `initial` is where it was last seen.
    pub fn resumed(
        message: T,
        notification: Arc<dyn NotifyMessageRouted<T>>,
        initial: Option<RouteLocation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            message,
            notification,
            state: Mutex::new(RequestState {
                current: None,
                in_route: false,
                initial,
                error: None,
                canceled: false,
                requeue_pending: false,
                is_new: true,
                profile: None,
                configuration: None,
                resume_at: None,
                finalized: false,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message_id(&self) -> Uuid {
        self.message.message_id()
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn notification(&self) -> &Arc<dyn NotifyMessageRouted<T>> {
        &self.notification
    }

    pub fn current_location(&self) -> Option<RouteLocation> {
        self.state.lock().current.clone()
    }

    pub fn initial_location(&self) -> Option<RouteLocation> {
        self.state.lock().initial.clone()
    }

    pub fn error(&self) -> Option<RoutingError> {
        self.state.lock().error.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().error.is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    pub fn is_requeue_pending(&self) -> bool {
        self.state.lock().requeue_pending
    }

    pub fn is_new(&self) -> bool {
        self.state.lock().is_new
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    pub fn profile(&self) -> Option<Arc<RoutingProfile<T>>> {
        self.state.lock().profile.clone()
    }

    pub fn configuration(&self) -> Option<Arc<RoutingConfiguration>> {
        self.state.lock().configuration.clone()
    }

    /// Snapshot of where the request currently is.
    pub fn status(&self) -> Option<RoutingStatus<T>> {
        let state = self.state.lock();
        state.current.as_ref().map(|location| RoutingStatus {
            message: self.message.clone(),
            route_name: location.route.clone(),
            event_id: location.event_id,
            entered_at: location.entered_at,
        })
    }

    pub(crate) fn cancel(&self, error: RoutingError) {
        let mut state = self.state.lock();
        state.canceled = true;
        state.error = Some(error);
    }

    pub(crate) fn set_error(&self, error: RoutingError) {
        self.state.lock().error = Some(error);
    }

    pub(crate) fn clear_error(&self) {
        self.state.lock().error = None;
    }

    /// Flag the request to restart from the top once its current stage
    /// responds. Refused once finalization has begun.
    pub(crate) fn request_requeue(&self) -> bool {
        let mut state = self.state.lock();
        if state.finalized {
            return false;
        }
        state.requeue_pending = true;
        true
    }

    /// Clear a pending requeue and rewind to the start of the path.
    pub(crate) fn take_requeue(&self) -> bool {
        let mut state = self.state.lock();
        if !state.requeue_pending {
            return false;
        }
        state.rewind();
        true
    }

    pub(crate) fn set_profile(&self, profile: Arc<RoutingProfile<T>>) {
        self.state.lock().profile = Some(profile);
    }

    pub(crate) fn set_configuration(&self, configuration: Arc<RoutingConfiguration>) {
        self.state.lock().configuration = Some(configuration);
    }

    pub(crate) fn set_resume_at(&self, route: Option<String>) {
        self.state.lock().resume_at = route;
    }

    pub(crate) fn take_resume_at(&self) -> Option<String> {
        self.state.lock().resume_at.take()
    }

    /// Re-entry point for a retry, unless one was already chosen.
    pub(crate) fn resume_at_if_unset(&self, route: &str) {
        let mut state = self.state.lock();
        if state.resume_at.is_none() {
            state.resume_at = Some(route.to_string());
        }
    }

    /// Move into `route`. Returns the location left behind, if the request
    /// had not already exited it.
    pub(crate) fn enter(&self, route: &str) -> (RouteLocation, Option<RouteLocation>) {
        let location = RouteLocation::new(route);
        let mut state = self.state.lock();
        let left = if state.in_route { state.current.clone() } else { None };
        state.current = Some(location.clone());
        state.in_route = true;
        state.is_new = false;
        (location, left)
    }

    /// Park the request at a location without consuming its "new" status.
    pub(crate) fn park(&self, route: &str) -> RouteLocation {
        let location = RouteLocation::new(route);
        let mut state = self.state.lock();
        state.current = Some(location.clone());
        state.in_route = true;
        location
    }

    /// Mark the current location exited; returns it if an exit is due.
    pub(crate) fn leave(&self) -> Option<RouteLocation> {
        let mut state = self.state.lock();
        if !state.in_route {
            return None;
        }
        state.in_route = false;
        state.current.clone()
    }

    /// Claim the right to finalize. A live request with a requeue pending is
    /// rewound instead and must be routed again.
    pub(crate) fn begin_finalization(&self) -> Finalization {
        let mut state = self.state.lock();
        if state.finalized {
            return Finalization::AlreadyFinalized;
        }
        if state.requeue_pending && !state.canceled {
            state.rewind();
            return Finalization::Requeued;
        }
        state.finalized = true;
        state.requeue_pending = false;
        Finalization::Proceed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finalization {
    Proceed,
    AlreadyFinalized,
    Requeued,
}

impl<T> RequestState<T> {
    fn rewind(&mut self) {
        self.requeue_pending = false;
        self.error = None;
        self.is_new = true;
        self.resume_at = None;
    }
}

impl<T: PriorityMessage> fmt::Debug for RoutingRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RoutingRequest")
            .field("id", &self.id)
            .field("message_id", &self.message.message_id())
            .field("current", &state.current.as_ref().map(|l| l.route.as_str()))
            .field("canceled", &state.canceled)
            .field("error", &state.error)
            .finish()
    }
}
