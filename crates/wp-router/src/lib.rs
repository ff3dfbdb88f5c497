//! Waypoint Message Router
//!
//! This crate drives prioritised messages through ordered service routes:
//! - MessageRouter: persists, deduplicates and pipelines requests to delivery
//! - RoutingRequest / RoutingStatus: per-message routing state and its durable shape
//! - RoutingConfiguration / RouteContainer: the path a message follows and where routes live
//! - ProfileProvider / FailurePolicy: rule-based routing profiles and retry strategy
//! - StageRoute: a self-scaling service route over a wp-queue pool
//! - MessageRepository: persistence contract plus an in-memory implementation
//! - Lifecycle: background telemetry and health tasks

pub mod configuration;
pub mod container;
pub mod error;
pub mod failure;
pub mod lifecycle;
pub mod memory;
pub mod notification;
pub mod profile;
pub mod repository;
pub mod request;
pub mod router;
pub mod stage;

pub use configuration::RoutingConfiguration;
pub use container::RouteContainer;
pub use error::RouterError;
pub use failure::{
    BoundedRetryPolicy, FailurePolicy, FailureResponse, NoRetryPolicy, failure_policy_from_settings,
};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use memory::InMemoryRepository;
pub use notification::{NoopNotification, NotifyMessageRouted};
pub use profile::{
    ContinuationProvider, ProfileProvider, RestartStageContinuation, RoutingProfile,
    RuleProfileProvider,
};
pub use repository::{MessageRepository, RoutingEvent, RoutingEventKind, RoutingStatus};
pub use request::{RouteLocation, RoutingRequest};
pub use router::{MessageRouter, PENDING_ROUTE};
pub use stage::{MessageHandler, RouteListener, RouteResponse, ServiceRoute, StageRoute};

pub type Result<T> = std::result::Result<T, RouterError>;
