//! Explicit event fan-out from queue routes and pools to their owners.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use uuid::Uuid;
use wp_common::{QueueState, RoutingError};

use crate::error::AbortError;

/// Why a route or pool stopped processing.
#[derive(Debug, Clone)]
pub enum StopReason<I> {
    /// Drained everything; the worker is free.
    Idle,
    /// The processor failed unexpectedly; carries the in-flight item and the backlog.
    Aborted(AbortError<I>),
    /// The drain task itself died outside the processor.
    Faulted { error: String, pending: Vec<I> },
    /// The owner canceled the route.
    Canceled { pending: Vec<I> },
}

impl<I> StopReason<I> {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Aborted(_) => "aborted",
            Self::Faulted { .. } => "faulted",
            Self::Canceled { .. } => "canceled",
        }
    }
}

/// Observer of a route or pool. Every method has a no-op default.
pub trait QueueMonitor<I>: Send + Sync {
    fn on_state_changed(&self, _state: &QueueState) {}

    /// One item finished. `error` is set for domain failures and skipped
    /// (canceled) items.
    fn on_completed(&self, _source: Uuid, _item: &I, _error: Option<&RoutingError>) {}

    fn on_stopped(&self, _source: Uuid, _reason: &StopReason<I>) {}
}

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Registry of listeners keyed by subscription id.
pub struct Subscribers<L: ?Sized> {
    next_id: AtomicU64,
    listeners: DashMap<u64, Arc<L>>,
}

impl<L: ?Sized> Subscribers<L> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: DashMap::new(),
        }
    }

    pub fn subscribe(&self, listener: Arc<L>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, listener);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    /// Listeners are invoked from a snapshot so callbacks may (un)subscribe.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        let mut entries: Vec<(u64, Arc<L>)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, listener)| listener).collect()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<L: ?Sized> Default for Subscribers<L> {
    fn default() -> Self {
        Self::new()
    }
}
