//! Deadline-driven message priority.
//!
//! Priority is never stored. It is recomputed at comparison time so that a
//! message waiting in a queue becomes more urgent as its deadline approaches.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{Clock, Comparer, PriorityMessage, SystemClock};

/// Urgency of `message` at `now`, in milliseconds. Lower is more urgent.
///
/// - Before the escalation window opens the value is the message's full
///   budget (`deadline - request_time`) and does not move.
/// - Inside the window the budget is discounted linearly by the elapsed
///   fraction of the window, reaching zero at the deadline.
/// - Past the deadline the value is the negative overdue time.
pub fn priority_value<T: PriorityMessage>(message: &T, now: DateTime<Utc>) -> f64 {
    let deadline = message.deadline();
    let budget = millis(deadline - message.request_time()).max(0.0);

    if now >= deadline {
        return -millis(now - deadline);
    }

    let threshold = millis(message.escalation_threshold()).max(0.0);
    let remaining = millis(deadline - now);
    if threshold <= 0.0 || remaining >= threshold {
        return budget;
    }

    budget * (remaining / threshold)
}

fn millis(duration: chrono::Duration) -> f64 {
    duration.num_microseconds()
        .map(|micros| micros as f64 / 1000.0)
        .unwrap_or_else(|| duration.num_milliseconds() as f64)
}

/// Compares messages by current priority, tie-breaking on identity.
pub struct PriorityComparer<T> {
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: PriorityMessage> PriorityComparer<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            _marker: PhantomData,
        }
    }

    pub fn priority(&self, message: &T) -> f64 {
        priority_value(message, self.clock.now())
    }
}

impl<T: PriorityMessage> Default for PriorityComparer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PriorityMessage> Comparer<T> for PriorityComparer<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        let now = self.clock.now();
        priority_value(a, now)
            .total_cmp(&priority_value(b, now))
            .then_with(|| a.message_id().cmp(&b.message_id()))
    }
}
