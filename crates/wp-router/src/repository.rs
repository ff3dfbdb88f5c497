//! Persistence contract the router depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wp_common::{PriorityMessage, RoutingError, TransactionContext};

use crate::request::RouteLocation;

/// Where a message currently is, in the shape a repository stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStatus<T> {
    pub message: T,
    pub route_name: String,
    pub event_id: Uuid,
    pub entered_at: DateTime<Utc>,
}

impl<T: PriorityMessage> RoutingStatus<T> {
    pub fn location(&self) -> RouteLocation {
        RouteLocation {
            route: self.route_name.clone(),
            entered_at: self.entered_at,
            event_id: self.event_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingEventKind {
    Entry,
    Exit,
    Delivered,
}

/// Immutable record of a routing transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub event_id: Uuid,
    pub message_id: Uuid,
    pub kind: RoutingEventKind,
    pub route_name: Option<String>,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RoutingEvent {
    pub fn entry(message_id: Uuid, location: &RouteLocation) -> Self {
        Self {
            event_id: location.event_id,
            message_id,
            kind: RoutingEventKind::Entry,
            route_name: Some(location.route.clone()),
            at: location.entered_at,
            error: None,
        }
    }

    pub fn exit(message_id: Uuid, location: &RouteLocation, error: Option<&RoutingError>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            message_id,
            kind: RoutingEventKind::Exit,
            route_name: Some(location.route.clone()),
            at: Utc::now(),
            error: error.map(ToString::to_string),
        }
    }

    pub fn delivered(message_id: Uuid, error: Option<&RoutingError>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            message_id,
            kind: RoutingEventKind::Delivered,
            route_name: None,
            at: Utc::now(),
            error: error.map(ToString::to_string),
        }
    }
}

#[async_trait]
pub trait MessageRepository<T: PriorityMessage>: Send + Sync {
    /// Persist a new message, inside `transaction` when one is given.
    async fn save_message(&self, message: &T, transaction: Option<&TransactionContext>) -> anyhow::Result<T>;

    async fn is_saved(&self, message: &T) -> anyhow::Result<bool>;

    async fn is_delivered(&self, message: &T) -> anyhow::Result<bool>;

    async fn routing_status(&self, message: &T) -> anyhow::Result<Option<RoutingStatus<T>>>;

    /// Mark a delivered message undelivered again and return it.
    async fn reopen_request(&self, message: &T) -> anyhow::Result<T>;

    /// Every saved message that has not been delivered.
    async fn select_pending_requests(&self) -> anyhow::Result<Vec<RoutingStatus<T>>>;

    async fn record_event(&self, event: RoutingEvent) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let id = Uuid::new_v4();
        let error = RoutingError::processing(Some(id), "timeout");
        let event = RoutingEvent::exit(id, &RouteLocation::new("billing"), Some(&error));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "exit");
        assert_eq!(json["route_name"], "billing");
        assert_eq!(json["error"], "Processing error: timeout");

        let back: RoutingEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
