//! Waypoint queuing engine
//!
//! This crate provides the worker machinery the router is built on:
//! - ConcurrentSortedCollection: lock-protected min-priority multiset
//! - QueueRoute: a single sequential worker with latency/failure telemetry
//! - QueuePool: a self-scaling set of QueueRoutes presenting one logical stage
//! - QueuingPolicy: strategies deciding whether a pool may add a worker
//! - Subscribers/QueueMonitor: explicit event fan-out from routes to owners

pub mod availability;
pub mod collection;
pub mod error;
pub mod monitor;
pub mod policy;
pub mod pool;
pub mod route;
pub mod telemetry;

use async_trait::async_trait;
use uuid::Uuid;

pub use availability::QueueAvailabilityComparer;
pub use collection::ConcurrentSortedCollection;
pub use error::{AbortError, ProcessError, SendError};
pub use monitor::{QueueMonitor, StopReason, SubscriptionId, Subscribers};
pub use policy::{
    CpuSampler, QueuingPolicy, ResourceQueuingPolicy, StaticQueuingPolicy, SystemCpuSampler,
    queuing_policy_from_settings,
};
pub use pool::QueuePool;
pub use route::{QueueRoute, RouteStatus};
pub use telemetry::{QueueTelemetry, RollingWindow};

/// An item that can travel through a queue route.
pub trait QueueItem: Clone + Send + Sync + 'static {
    /// Canceled items are skipped by the worker instead of processed.
    fn is_canceled(&self) -> bool {
        false
    }

    /// Identifier carried by errors raised for this item.
    fn correlation_id(&self) -> Uuid {
        Uuid::nil()
    }

    /// Identifier used in logs.
    fn describe(&self) -> String;
}

/// Per-item processing strategy injected into routes and pools.
#[async_trait]
pub trait QueueProcessor<I>: Send + Sync + 'static {
    async fn process(&self, item: &I) -> Result<(), ProcessError>;
}
