//! Failure policies: retry a failed request or send it to the failure route.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;
use wp_common::{PriorityMessage, RoutingError};
use wp_config::{FailurePolicyKind, FailurePolicySettings};

/// What to do with a request whose last stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureResponse {
    pub retry: bool,
    pub wait_time: Duration,
    /// Sleep inside the routing stage rather than scheduling the resend
    pub block_queue: bool,
}

impl FailureResponse {
    pub fn retry_after(wait_time: Duration, block_queue: bool) -> Self {
        Self {
            retry: true,
            wait_time,
            block_queue,
        }
    }

    pub fn send_to_failure_route() -> Self {
        Self {
            retry: false,
            wait_time: Duration::ZERO,
            block_queue: false,
        }
    }

    pub fn is_send_to_failure_route(&self) -> bool {
        !self.retry
    }
}

pub trait FailurePolicy<T: PriorityMessage>: Send + Sync {
    fn failure_response(&self, message: &T, error: &RoutingError) -> FailureResponse;

    /// Drop any bookkeeping held for `message`.
    fn finalize_message(&self, message: &T);
}

/// Retries with a fixed wait until `max_attempts` failures have been seen
/// for a message, then sends it to the failure route.
pub struct BoundedRetryPolicy {
    max_attempts: u32,
    wait_time: Duration,
    block_queue: bool,
    attempts: DashMap<Uuid, u32>,
}

impl BoundedRetryPolicy {
    pub fn new(max_attempts: u32, wait_time: Duration, block_queue: bool) -> Self {
        Self {
            max_attempts,
            wait_time,
            block_queue,
            attempts: DashMap::new(),
        }
    }

    pub fn attempts(&self, message_id: Uuid) -> u32 {
        self.attempts.get(&message_id).map(|count| *count).unwrap_or(0)
    }
}

impl<T: PriorityMessage> FailurePolicy<T> for BoundedRetryPolicy {
    fn failure_response(&self, message: &T, error: &RoutingError) -> FailureResponse {
        if error.is_canceled() {
            return FailureResponse::send_to_failure_route();
        }

        let attempt = {
            let mut count = self.attempts.entry(message.message_id()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt < self.max_attempts {
            debug!(
                message_id = %message.message_id(),
                attempt,
                max_attempts = self.max_attempts,
                "Retrying failed message"
            );
            FailureResponse::retry_after(self.wait_time, self.block_queue)
        } else {
            FailureResponse::send_to_failure_route()
        }
    }

    fn finalize_message(&self, message: &T) {
        self.attempts.remove(&message.message_id());
    }
}

/// Every failure goes straight to the failure route.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl<T: PriorityMessage> FailurePolicy<T> for NoRetryPolicy {
    fn failure_response(&self, _message: &T, _error: &RoutingError) -> FailureResponse {
        FailureResponse::send_to_failure_route()
    }

    fn finalize_message(&self, _message: &T) {}
}

pub fn failure_policy_from_settings<T: PriorityMessage>(
    settings: &FailurePolicySettings,
) -> Arc<dyn FailurePolicy<T>> {
    match settings.kind {
        FailurePolicyKind::BoundedRetry => Arc::new(BoundedRetryPolicy::new(
            settings.max_attempts,
            settings.wait(),
            settings.block_queue,
        )),
        FailurePolicyKind::NoRetry => Arc::new(NoRetryPolicy),
    }
}
