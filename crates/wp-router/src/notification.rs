//! Caller-facing routing callbacks.

use wp_common::{PriorityMessage, RoutingError};

use crate::request::RoutingRequest;

/// Hooks fired as a request moves through the router, in the order
/// `evaluated`, then per route `routing`, `received`, `routed`, `returned`,
/// and finally `delivered`. Every request reaches `delivered` exactly once,
/// whether it succeeded, failed or was canceled.
pub trait NotifyMessageRouted<T: PriorityMessage>: Send + Sync {
    /// Saved and about to be resolved.
    fn evaluated(&self, _request: &RoutingRequest<T>) {}

    /// Being sent into `route`.
    fn routing(&self, _request: &RoutingRequest<T>, _route: &str) {}

    /// `route` accepted the request.
    fn received(&self, _request: &RoutingRequest<T>, _route: &str) {}

    /// `route` produced a response.
    fn routed(&self, _request: &RoutingRequest<T>, _route: &str, _error: Option<&RoutingError>) {}

    /// The response from `route` is being acted on.
    fn returned(&self, _request: &RoutingRequest<T>, _route: &str) {}

    /// Terminally resolved; `request.error()` says how.
    fn delivered(&self, _request: &RoutingRequest<T>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotification;

impl<T: PriorityMessage> NotifyMessageRouted<T> for NoopNotification {}
