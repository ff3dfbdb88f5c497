use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod logging;
pub mod priority;

pub use priority::{PriorityComparer, priority_value};

// ============================================================================
// Core Message Contract
// ============================================================================

/// Transaction scope a message was created in.
///
/// Repositories that support transactions persist the message inside the
/// scope identified here instead of in a standalone write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub id: Uuid,
    pub isolation: Option<String>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            isolation: None,
        }
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A deadline-bearing message that can be ordered by urgency.
///
/// The identifier must never change once the message exists: it is the key
/// used for duplicate detection, retry bookkeeping and the router's open set.
pub trait PriorityMessage: Clone + Send + Sync + 'static {
    fn message_id(&self) -> Uuid;

    fn request_time(&self) -> DateTime<Utc>;

    fn deadline(&self) -> DateTime<Utc>;

    /// Width of the window before the deadline during which priority escalates.
    fn escalation_threshold(&self) -> chrono::Duration;

    fn transaction(&self) -> Option<&TransactionContext> {
        None
    }
}

// ============================================================================
// Comparers
// ============================================================================

/// Total ordering strategy injected into sorted collections and pools.
pub trait Comparer<T: ?Sized>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

impl<T: ?Sized, F> Comparer<T> for F
where
    F: Fn(&T, &T) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Equality strategy, used by routing profiles to spot duplicate messages.
pub trait EqualityComparer<T: ?Sized>: Send + Sync {
    fn equals(&self, a: &T, b: &T) -> bool;
}

impl<T: ?Sized, F> EqualityComparer<T> for F
where
    F: Fn(&T, &T) -> bool + Send + Sync,
{
    fn equals(&self, a: &T, b: &T) -> bool {
        self(a, b)
    }
}

/// Orders messages by identity only.
pub fn identity_comparer<T: PriorityMessage>() -> Arc<dyn Comparer<T>> {
    Arc::new(|a: &T, b: &T| a.message_id().cmp(&b.message_id()))
}

/// Orders messages by request time, oldest first, falling back to identity.
pub fn sequence_comparer<T: PriorityMessage>() -> Arc<dyn Comparer<T>> {
    Arc::new(|a: &T, b: &T| {
        a.request_time()
            .cmp(&b.request_time())
            .then_with(|| a.message_id().cmp(&b.message_id()))
    })
}

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Domain errors. These never crash a worker: they are recorded on the
/// request and folded into the routing decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Message {correlation_id} canceled: {reason}")]
    MessageCanceled { correlation_id: Uuid, reason: String },

    #[error("Route not found: {name}")]
    RouteNotFound { correlation_id: Option<Uuid>, name: String },

    #[error("Duplicate route: {name}")]
    DuplicateRoute { name: String },

    #[error("Routing configuration error: {message}")]
    Configuration { correlation_id: Option<Uuid>, message: String },

    #[error("Processing error: {message}")]
    Processing { correlation_id: Option<Uuid>, message: String },

    #[error("Policy violation: {message}")]
    Policy { correlation_id: Option<Uuid>, message: String },
}

impl RoutingError {
    pub fn canceled(correlation_id: Uuid, reason: impl Into<String>) -> Self {
        Self::MessageCanceled {
            correlation_id,
            reason: reason.into(),
        }
    }

    pub fn superseded(correlation_id: Uuid) -> Self {
        Self::canceled(correlation_id, "superseded by newer message")
    }

    pub fn route_not_found(correlation_id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self::RouteNotFound {
            correlation_id,
            name: name.into(),
        }
    }

    pub fn configuration(correlation_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Configuration {
            correlation_id,
            message: message.into(),
        }
    }

    pub fn processing(correlation_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Processing {
            correlation_id,
            message: message.into(),
        }
    }

    pub fn policy(correlation_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Policy {
            correlation_id,
            message: message.into(),
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCanceled { correlation_id, .. } => Some(*correlation_id),
            Self::RouteNotFound { correlation_id, .. }
            | Self::Configuration { correlation_id, .. }
            | Self::Processing { correlation_id, .. }
            | Self::Policy { correlation_id, .. } => *correlation_id,
            Self::DuplicateRoute { .. } => None,
        }
    }

    /// Canceled messages terminate without retry.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::MessageCanceled { .. })
    }
}

// ============================================================================
// Policy Types
// ============================================================================

/// Outcome of a queuing policy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub approved: bool,
    pub reason: String,
}

impl PolicyDecision {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

/// Snapshot of a single queue route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub id: Uuid,
    pub name: String,
    pub requested: u64,
    pub processed: u64,
    pub queue_length: u64,
    /// Rolling average time an item waited before being dequeued
    #[serde(with = "duration_millis")]
    pub average_request_latency: Duration,
    /// Rolling average processing time
    #[serde(with = "duration_millis")]
    pub average_response_latency: Duration,
    /// Fraction of failed items over the failure window (0.0 - 1.0)
    pub failure_rate: f64,
    pub aborted: bool,
    pub busy: bool,
}

/// Snapshot of a queue pool and its member routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub id: Uuid,
    pub name: String,
    pub queue_count: usize,
    pub active_count: usize,
    pub idle_count: usize,
    pub highest_concurrency: usize,
    pub requested: u64,
    pub processed: u64,
    /// Items waiting in the pool itself plus every member route
    pub queue_length: u64,
    #[serde(with = "duration_millis")]
    pub average_request_latency: Duration,
    #[serde(with = "duration_millis")]
    pub average_response_latency: Duration,
    pub failure_rate: f64,
    pub aborted_count: usize,
    pub resubmitted_count: u64,
    pub canceled: bool,
    pub queues: Vec<QueueState>,
}

impl PoolState {
    /// True when the pool is draining work slower than it is arriving.
    pub fn is_falling_behind(&self) -> bool {
        self.average_response_latency >= self.average_request_latency
            && !self.average_request_latency.is_zero()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(millis.max(0.0) / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_correlation_id() {
        let id = Uuid::new_v4();
        assert_eq!(RoutingError::superseded(id).correlation_id(), Some(id));
        assert!(RoutingError::superseded(id).is_canceled());
        assert_eq!(
            RoutingError::DuplicateRoute { name: "a".to_string() }.correlation_id(),
            None
        );
        assert!(!RoutingError::processing(Some(id), "boom").is_canceled());
    }

    #[test]
    fn test_pool_state_serializes_latency_as_millis() {
        let state = PoolState {
            id: Uuid::nil(),
            name: "stage".to_string(),
            queue_count: 1,
            active_count: 0,
            idle_count: 1,
            highest_concurrency: 1,
            requested: 0,
            processed: 0,
            queue_length: 0,
            average_request_latency: Duration::from_millis(250),
            average_response_latency: Duration::from_millis(10),
            failure_rate: 0.0,
            aborted_count: 0,
            resubmitted_count: 0,
            canceled: false,
            queues: Vec::new(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["average_request_latency"], serde_json::json!(250.0));
        assert!(!state.is_falling_behind());
    }
}
