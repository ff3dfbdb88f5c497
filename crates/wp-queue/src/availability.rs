//! Ranks queue routes by how soon they can take more work.

use std::cmp::Ordering;
use std::sync::Arc;

use wp_common::{Comparer, QueueState};

use crate::QueueItem;
use crate::route::QueueRoute;

/// Most available first: not aborted, shortest backlog, lowest failure rate,
/// lowest average response latency, then route id for a total order.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueAvailabilityComparer;

impl QueueAvailabilityComparer {
    pub fn compare_states(a: &QueueState, b: &QueueState) -> Ordering {
        a.aborted
            .cmp(&b.aborted)
            .then_with(|| a.queue_length.cmp(&b.queue_length))
            .then_with(|| a.failure_rate.total_cmp(&b.failure_rate))
            .then_with(|| a.average_response_latency.cmp(&b.average_response_latency))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// The most available route, if any.
    pub fn most_available<'a, I, It>(routes: It) -> Option<Arc<QueueRoute<I>>>
    where
        I: QueueItem,
        It: IntoIterator<Item = &'a Arc<QueueRoute<I>>>,
    {
        routes
            .into_iter()
            .map(|route| (route.state(), route))
            .min_by(|(a, _), (b, _)| Self::compare_states(a, b))
            .map(|(_, route)| route.clone())
    }
}

impl<I: QueueItem> Comparer<Arc<QueueRoute<I>>> for QueueAvailabilityComparer {
    fn compare(&self, a: &Arc<QueueRoute<I>>, b: &Arc<QueueRoute<I>>) -> Ordering {
        Self::compare_states(&a.state(), &b.state())
    }
}
