//! Subscriber registration tests.

use super::harness::{eventually, positions, TestHarness};
use crate::error::OutboxError;
use crate::events::EventKind;
use parking_lot::Mutex;
use std::sync::Arc;

#[tokio::test]
async fn panicking_handler_does_not_break_delivery() {
    let h = TestHarness::new();
    h.runner.on_change(|_| panic!("subscriber bug"));
    let ids = h.source.append_all(&["e1", "e2"]);

    h.start().await;
    h.wait_committed(2).await;

    assert_eq!(h.publisher.delivered(), ids);
    assert_eq!(h.recorder.count(EventKind::Restarting), 0);

    h.runner.stop().await.unwrap();
}

#[tokio::test]
async fn typed_helpers_receive_payloads() {
    let h = TestHarness::new();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let committed = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(Mutex::new(Vec::new()));

    let c = changes.clone();
    let k = committed.clone();
    let r = running.clone();
    h.runner
        .on_change(move |event| c.lock().push(event.full_document["event"].clone()))
        .on_committed(move |token| k.lock().push(token.clone()))
        .on_running(move |filter, options| {
            r.lock().push((filter.operation_type(), options.resume_after.clone()))
        });

    let ids = h.source.append_all(&["orders.created"]);
    h.start().await;
    h.wait_committed(1).await;

    assert_eq!(*changes.lock(), vec![serde_json::json!("orders.created")]);
    assert_eq!(positions(&committed.lock()), positions(&ids));
    assert_eq!(running.lock().len(), 1);
    assert_eq!(running.lock()[0].1, None);

    h.runner.stop().await.unwrap();
}

#[tokio::test]
async fn error_handler_receives_publish_failure() {
    let h = TestHarness::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    h.runner.on_error(move |err| {
        e.lock().push(matches!(err, OutboxError::Publish(_)));
    });

    let ids = h.source.append_all(&["e1"]);
    h.publisher.fail_at(&ids[0], 1);

    h.start().await;
    h.wait_committed(1).await;

    assert_eq!(*errors.lock(), vec![true]);

    h.runner.stop().await.unwrap();
}

#[tokio::test]
async fn late_subscriber_sees_only_later_events() {
    let h = TestHarness::new();
    h.source.append_all(&["e1"]);
    h.start().await;
    h.wait_committed(1).await;

    let late = Arc::new(Mutex::new(Vec::new()));
    let l = late.clone();
    h.runner.on_committed(move |token| l.lock().push(token.to_string()));

    h.source.append_all(&["e2"]);
    eventually("late commit", || late.lock().len() == 1).await;

    assert_eq!(*late.lock(), vec!["2-0".to_string()]);

    h.runner.stop().await.unwrap();
}
