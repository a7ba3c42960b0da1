use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use serde_json::json;

use super::*;

fn counting_handler() -> (SharedHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler = handler_fn(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (handler, count)
}

fn event(kind: &str) -> Envelope {
    Envelope::new(kind, json!({ "id": 1 }))
}

#[test]
fn registering_same_handler_twice_invokes_it_once() {
    let dispatcher = EventDispatcher::new();
    let (handler, count) = counting_handler();

    assert!(dispatcher.on("post_created", Arc::clone(&handler)));
    assert!(!dispatcher.on("post_created", Arc::clone(&handler)));
    dispatcher.dispatch(&event("post_created"));

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.handler_count("post_created"), 1);
}

#[test]
fn distinct_handlers_for_same_event_all_run() {
    let dispatcher = EventDispatcher::new();
    let (first, first_count) = counting_handler();
    let (second, second_count) = counting_handler();
    dispatcher.on("message_received", first);
    dispatcher.on("message_received", second);

    dispatcher.dispatch(&event("message_received"));

    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[test]
fn handlers_only_see_their_event_type() {
    let dispatcher = EventDispatcher::new();
    let (handler, count) = counting_handler();
    dispatcher.on("notification", handler);

    dispatcher.dispatch(&event("group_updated"));

    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn handler_receives_payload_and_channel() {
    let dispatcher = EventDispatcher::new();
    let seen = Arc::new(std::sync::Mutex::new(None));
    let sink = Arc::clone(&seen);
    dispatcher.on(
        "session_booked",
        handler_fn(move |envelope| {
            *sink.lock().unwrap() = Some((envelope.payload.clone(), envelope.channel.clone()));
            Ok(())
        }),
    );

    dispatcher.dispatch(
        &Envelope::new("session_booked", json!({ "tutor": "ada" })).with_channel("tutoring:9"),
    );

    assert_eq!(
        *seen.lock().unwrap(),
        Some((json!({ "tutor": "ada" }), Some("tutoring:9".to_string())))
    );
}

#[test]
fn off_removes_handler_and_drops_empty_subscription() {
    let dispatcher = EventDispatcher::new();
    let (handler, count) = counting_handler();
    dispatcher.on("notification", Arc::clone(&handler));

    assert!(dispatcher.off("notification", &handler));
    assert!(!dispatcher.off("notification", &handler));
    dispatcher.dispatch(&event("notification"));

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(dispatcher.event_types().is_empty());
}

#[test]
fn failing_handler_does_not_stop_siblings_or_later_dispatches() {
    let dispatcher = EventDispatcher::new();
    dispatcher.on("notification", handler_fn(|_| Err(anyhow!("bad payload"))));
    let (healthy, count) = counting_handler();
    dispatcher.on("notification", healthy);

    let faults = dispatcher.dispatch(&event("notification"));
    assert_eq!(
        faults,
        vec![HandlerFault {
            event_type: "notification".to_string(),
            message: "bad payload".to_string(),
        }]
    );

    dispatcher.dispatch(&event("notification"));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_handler_is_isolated() {
    let dispatcher = EventDispatcher::new();
    dispatcher.on("notification", handler_fn(|_| panic!("handler exploded")));
    let (healthy, count) = counting_handler();
    dispatcher.on("notification", healthy);

    let faults = dispatcher.dispatch(&event("notification"));
    dispatcher.dispatch(&event("notification"));

    assert_eq!(faults.len(), 1);
    assert!(faults[0].message.contains("handler exploded"));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn handler_may_unregister_itself_during_dispatch() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let slot: Arc<std::sync::Mutex<Option<SharedHandler>>> = Arc::new(std::sync::Mutex::new(None));
    let weak_dispatcher = Arc::downgrade(&dispatcher);
    let own = Arc::clone(&slot);
    let handler = handler_fn(move |_| {
        if let (Some(dispatcher), Some(me)) = (weak_dispatcher.upgrade(), own.lock().unwrap().clone())
        {
            dispatcher.off("once", &me);
        }
        Ok(())
    });
    *slot.lock().unwrap() = Some(Arc::clone(&handler));
    dispatcher.on("once", handler);

    assert!(dispatcher.dispatch(&event("once")).is_empty());
    assert_eq!(dispatcher.handler_count("once"), 0);
}
