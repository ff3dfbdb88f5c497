//! Cancellation tests
//!
//! Tests for:
//! - Canceling a saved message that is not routing
//! - Canceling a request parked in a busy stage
//! - Rejecting unsaved and already delivered messages

mod common;

use std::sync::Arc;

use common::{Harness, Stage, TestMessage, eventually, profiles};
use wp_common::RoutingError;
use wp_router::{MessageRepository, NoRetryPolicy, RouterError, RoutingEvent};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_saved_message_delivers_without_routing() {
    let h = Harness::new(profiles(&["A", "B"], Arc::new(NoRetryPolicy)));
    h.register(&Stage::ok("A", &h.log));
    h.register(&Stage::ok("B", &h.log));

    let message = TestMessage::new("parked");
    h.repository.save_message(&message, None).await.unwrap();
    let status = h.repository.routing_status(&message).await.unwrap().unwrap();

    h.router.cancel_request(&status, h.notifier.clone()).await.unwrap();
    h.wait_delivered(message.id).await;

    assert_eq!(h.notifier.events_for(message.id), vec!["evaluated", "delivered"]);
    assert!(matches!(
        h.notifier.outcome(message.id),
        Some(RoutingError::MessageCanceled { .. })
    ));
    assert!(h.log.visits_for(message.id).is_empty());
    assert!(h.repository.is_delivered(&message).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_active_request_stops_after_current_stage() {
    let h = Harness::new(profiles(&["A", "B"], Arc::new(NoRetryPolicy)));
    let gate = Stage::gated("A", &h.log);
    h.register(&gate);
    h.register(&Stage::ok("B", &h.log));

    let message = TestMessage::new("busy");
    let request = h.send(&message).await;
    eventually("request to reach A", || gate.entered() == 1).await;

    let status = h.repository.routing_status(&message).await.unwrap().unwrap();
    assert_eq!(status.route_name, "A");
    h.router.cancel_request(&status, h.notifier.clone()).await.unwrap();
    assert!(request.is_canceled());

    gate.release(1);
    h.wait_delivered(message.id).await;

    assert_eq!(h.log.visits_for(message.id), vec!["A"]);
    assert!(matches!(
        h.notifier.outcome(message.id),
        Some(RoutingError::MessageCanceled { .. })
    ));
    assert_eq!(h.notifier.delivered_count(message.id), 1);
    assert!(!h.router.is_active(&message));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_request_skips_stage() {
    let h = Harness::new(profiles(&["A"], Arc::new(NoRetryPolicy)));
    let gate = Stage::gated("A", &h.log);
    h.register(&gate);

    // two queues at most, so the third message waits in the stage backlog
    let blockers = [TestMessage::new("first"), TestMessage::new("second")];
    for blocker in &blockers {
        h.send(blocker).await;
    }
    eventually("both queues busy", || gate.entered() == 2).await;

    let waiting = TestMessage::new("waiting");
    h.send(&waiting).await;
    let status = h.repository.routing_status(&waiting).await.unwrap().unwrap();
    h.router.cancel_request(&status, h.notifier.clone()).await.unwrap();

    gate.release(2);
    h.wait_delivered(waiting.id).await;
    for blocker in &blockers {
        h.wait_delivered(blocker.id).await;
        assert_eq!(h.notifier.outcome(blocker.id), None);
    }

    assert!(h.log.visits_for(waiting.id).is_empty());
    assert!(matches!(
        h.notifier.outcome(waiting.id),
        Some(RoutingError::MessageCanceled { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_unsaved_message_is_rejected() {
    let h = Harness::new(profiles(&["A"], Arc::new(NoRetryPolicy)));
    let message = TestMessage::new("ghost");
    h.repository.save_message(&message, None).await.unwrap();
    let status = h.repository.routing_status(&message).await.unwrap().unwrap();

    let other = Harness::new(profiles(&["A"], Arc::new(NoRetryPolicy)));
    let error = other.router.cancel_request(&status, other.notifier.clone()).await.unwrap_err();
    assert!(matches!(error, RouterError::NotSaved { message_id } if message_id == message.id));
    assert!(other.notifier.events_for(message.id).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_delivered_message_is_rejected() {
    let h = Harness::new(profiles(&["A"], Arc::new(NoRetryPolicy)));
    let message = TestMessage::new("finished");
    h.repository.save_message(&message, None).await.unwrap();
    h.repository
        .record_event(RoutingEvent::delivered(message.id, None))
        .await
        .unwrap();
    let status = h.repository.routing_status(&message).await.unwrap().unwrap();

    let error = h.router.cancel_request(&status, h.notifier.clone()).await.unwrap_err();
    assert!(matches!(error, RouterError::AlreadyDelivered { .. }));
    assert!(h.notifier.events_for(message.id).is_empty());
}
