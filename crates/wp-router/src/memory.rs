//! In-memory MessageRepository for tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;
use wp_common::{PriorityMessage, TransactionContext};

use crate::repository::{MessageRepository, RoutingEvent, RoutingEventKind, RoutingStatus};
use crate::router::PENDING_ROUTE;

struct Record<T> {
    message: T,
    status: RoutingStatus<T>,
    delivered: bool,
    transaction: Option<Uuid>,
}

pub struct InMemoryRepository<T: PriorityMessage> {
    records: DashMap<Uuid, Record<T>>,
    events: Mutex<Vec<RoutingEvent>>,
}

impl<T: PriorityMessage> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<RoutingEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, message_id: Uuid) -> Vec<RoutingEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Transaction a message was saved in, if any.
    pub fn transaction_of(&self, message_id: Uuid) -> Option<Uuid> {
        self.records.get(&message_id).and_then(|record| record.transaction)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T: PriorityMessage> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: PriorityMessage> MessageRepository<T> for InMemoryRepository<T> {
    async fn save_message(&self, message: &T, transaction: Option<&TransactionContext>) -> anyhow::Result<T> {
        let id = message.message_id();
        self.records.insert(
            id,
            Record {
                message: message.clone(),
                status: RoutingStatus {
                    message: message.clone(),
                    route_name: PENDING_ROUTE.to_string(),
                    event_id: Uuid::new_v4(),
                    entered_at: Utc::now(),
                },
                delivered: false,
                transaction: transaction.map(|context| context.id),
            },
        );
        debug!(message_id = %id, transactional = transaction.is_some(), "Message saved");
        Ok(message.clone())
    }

    async fn is_saved(&self, message: &T) -> anyhow::Result<bool> {
        Ok(self.records.contains_key(&message.message_id()))
    }

    async fn is_delivered(&self, message: &T) -> anyhow::Result<bool> {
        Ok(self
            .records
            .get(&message.message_id())
            .map(|record| record.delivered)
            .unwrap_or(false))
    }

    async fn routing_status(&self, message: &T) -> anyhow::Result<Option<RoutingStatus<T>>> {
        Ok(self
            .records
            .get(&message.message_id())
            .map(|record| record.status.clone()))
    }

    async fn reopen_request(&self, message: &T) -> anyhow::Result<T> {
        let id = message.message_id();
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("message {id} is not saved"))?;
        record.delivered = false;
        record.status.route_name = PENDING_ROUTE.to_string();
        record.status.event_id = Uuid::new_v4();
        record.status.entered_at = Utc::now();
        Ok(record.message.clone())
    }

    async fn select_pending_requests(&self) -> anyhow::Result<Vec<RoutingStatus<T>>> {
        let mut pending: Vec<RoutingStatus<T>> = self
            .records
            .iter()
            .filter(|record| !record.delivered)
            .map(|record| record.status.clone())
            .collect();
        pending.sort_by_key(|status| status.entered_at);
        Ok(pending)
    }

    async fn record_event(&self, event: RoutingEvent) -> anyhow::Result<()> {
        if let Some(mut record) = self.records.get_mut(&event.message_id) {
            match event.kind {
                RoutingEventKind::Entry => {
                    if let Some(route) = &event.route_name {
                        record.status.route_name = route.clone();
                    }
                    record.status.event_id = event.event_id;
                    record.status.entered_at = event.at;
                }
                RoutingEventKind::Exit => {}
                RoutingEventKind::Delivered => record.delivered = true,
            }
        }
        self.events.lock().push(event);
        Ok(())
    }
}
