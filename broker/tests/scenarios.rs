//! End-to-end scenarios for the request processor, run against the
//! in-memory store with scripted upstream outcomes and paused time.
//!
//! Each test inserts configuration and request events the way the ingress
//! would, lets the processor's follow loop react, and asserts on the
//! resulting event log - the only interface the pieces share.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use courier_broker::{
    AttemptState, Outcome, RequestProcessor, RequestProjection, ScriptedApi,
};
use courier_core::{Envelope, Event, EventStore, EventStoreError};
use courier_testing::MemoryEventStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn configuration(retries: i32, timeout: f64) -> Event {
    Event::Configuration { retries, timeout }
}

fn request(payload: &str) -> Event {
    Event::Request {
        request: payload.to_string(),
    }
}

fn spawn_processor(
    store: &Arc<dyn EventStore>,
    outcomes: impl IntoIterator<Item = Outcome>,
) -> JoinHandle<Result<(), EventStoreError>> {
    let api = Arc::new(ScriptedApi::new(outcomes));
    let mut processor = RequestProcessor::new(Arc::clone(store), api);
    tokio::spawn(async move { processor.run(0).await })
}

async fn snapshot(store: &Arc<dyn EventStore>) -> Vec<Envelope> {
    store
        .load_events(0)
        .await
        .expect("load events")
        .collect()
        .await
}

fn count(events: &[Envelope], class: &str) -> usize {
    events
        .iter()
        .filter(|envelope| envelope.event.class() == class)
        .count()
}

fn classes(events: &[Envelope]) -> Vec<&'static str> {
    events
        .iter()
        .map(|envelope| envelope.event.class())
        .collect()
}

/// Poll the log until the condition holds. Virtual time advances through
/// the poll sleeps, so pending timers fire along the way.
async fn wait_until(
    store: &Arc<dyn EventStore>,
    condition: impl Fn(&[Envelope]) -> bool,
) -> Vec<Envelope> {
    for _ in 0..2_000 {
        let events = snapshot(store).await;
        if condition(&events) {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = snapshot(store).await;
    panic!("condition not reached, log: {:?}", classes(&events));
}

fn final_state(events: &[Envelope], request_id: i32) -> Option<AttemptState> {
    let mut projection = RequestProjection::new();
    for envelope in events {
        projection.apply(envelope);
    }
    projection.state_of(request_id)
}

#[tokio::test(start_paused = true)]
async fn happy_path_records_attempt_response_and_ignored_timeout() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(&store, [Outcome::Response("HELLO".to_string())]);

    store
        .insert(Uuid::nil(), configuration(0, 5.0), 0)
        .await
        .expect("configure");
    let submitted = store
        .insert(Uuid::new_v4(), request("hello"), 0)
        .await
        .expect("submit");

    // the timeout event still arrives after 5s; the processor ignores it
    let events = wait_until(&store, |events| count(events, "api-timeout") == 1).await;
    assert_eq!(
        classes(&events),
        vec![
            "configuration",
            "request",
            "api-request",
            "api-response",
            "api-timeout"
        ]
    );
    for (index, envelope) in events.iter().enumerate() {
        let expected = i32::try_from(index).expect("small index") + 1;
        assert_eq!(envelope.id, expected, "ids must be dense");
    }
    for envelope in &events[2..] {
        assert_eq!(envelope.causation_id, submitted.id);
    }
    assert_eq!(
        events[3].event,
        Event::ApiResponse {
            attempt: 0,
            response: "HELLO".to_string(),
        }
    );

    // the ignored timeout must not have triggered anything further
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(snapshot(&store).await.len(), 5);
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Success));
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn failure_is_retried_until_success() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(
        &store,
        [
            Outcome::Failure("net".to_string()),
            Outcome::Response("ok".to_string()),
        ],
    );

    store
        .insert(Uuid::nil(), configuration(1, 5.0), 0)
        .await
        .expect("configure");
    let submitted = store
        .insert(Uuid::new_v4(), request("x"), 0)
        .await
        .expect("submit");

    let events = wait_until(&store, |events| count(events, "api-timeout") == 2).await;
    assert_eq!(
        classes(&events)[..6],
        [
            "configuration",
            "request",
            "api-request",
            "api-failure",
            "api-request",
            "api-response"
        ]
    );
    assert_eq!(events[2].event, Event::ApiRequest { attempt: 0 });
    assert_eq!(
        events[3].event,
        Event::ApiFailure {
            attempt: 0,
            failure: "net".to_string(),
        }
    );
    assert_eq!(events[4].event, Event::ApiRequest { attempt: 1 });
    assert_eq!(
        events[5].event,
        Event::ApiResponse {
            attempt: 1,
            response: "ok".to_string(),
        }
    );
    // the late timeouts changed nothing: two attempts, no more
    assert_eq!(count(&events, "api-request"), 2);
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Success));
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_the_request_failed() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(
        &store,
        [
            Outcome::Failure("down".to_string()),
            Outcome::Failure("still down".to_string()),
        ],
    );

    // timeout 0 disables the timeout policy entirely
    store
        .insert(Uuid::nil(), configuration(1, 0.0), 0)
        .await
        .expect("configure");
    let submitted = store
        .insert(Uuid::new_v4(), request("x"), 0)
        .await
        .expect("submit");

    let events = wait_until(&store, |events| count(events, "api-failure") == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events_after = snapshot(&store).await;
    assert_eq!(
        classes(&events_after),
        vec![
            "configuration",
            "request",
            "api-request",
            "api-failure",
            "api-request",
            "api-failure"
        ],
        "no further attempt may be dispatched"
    );
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Failure));
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn timeout_triggers_the_retry_when_the_upstream_stays_silent() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(
        &store,
        [Outcome::Silent, Outcome::Response("ok".to_string())],
    );

    store
        .insert(Uuid::nil(), configuration(1, 1.0), 0)
        .await
        .expect("configure");
    let submitted = store
        .insert(Uuid::new_v4(), request("x"), 0)
        .await
        .expect("submit");

    let events = wait_until(&store, |events| count(events, "api-timeout") == 2).await;
    assert_eq!(
        classes(&events)[..6],
        [
            "configuration",
            "request",
            "api-request",
            "api-timeout",
            "api-request",
            "api-response"
        ]
    );
    assert_eq!(events[4].event, Event::ApiRequest { attempt: 1 });
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Success));

    // a late response for the timed-out attempt flips its slot but the
    // request is already terminal: nothing new is dispatched
    store
        .insert(
            Uuid::nil(),
            Event::ApiResponse {
                attempt: 0,
                response: "late".to_string(),
            },
            submitted.id,
        )
        .await
        .expect("late response");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = snapshot(&store).await;
    assert_eq!(count(&events, "api-request"), 2);
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Success));
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_is_rejected_and_processed_once() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(&store, [Outcome::Response("done".to_string())]);

    store
        .insert(Uuid::nil(), configuration(0, 0.0), 0)
        .await
        .expect("configure");

    let key = Uuid::new_v4();
    store
        .insert(key, request("once"), 0)
        .await
        .expect("first submission");
    let duplicate = store.insert(key, request("twice"), 0).await;
    assert_eq!(duplicate, Err(EventStoreError::DuplicateEventUuid));

    let events = wait_until(&store, |events| count(events, "api-response") == 1).await;
    assert_eq!(count(&events, "request"), 1);
    for (index, envelope) in events.iter().enumerate() {
        let expected = i32::try_from(index).expect("small index") + 1;
        assert_eq!(envelope.id, expected, "rejected insert must not burn an id");
    }
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn silent_upstream_without_budget_ends_in_timeout() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(&store, [Outcome::Silent]);

    store
        .insert(Uuid::nil(), configuration(0, 2.0), 0)
        .await
        .expect("configure");
    let submitted = store
        .insert(Uuid::new_v4(), request("x"), 0)
        .await
        .expect("submit");

    let events = wait_until(&store, |events| count(events, "api-timeout") == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events_after = snapshot(&store).await;
    assert_eq!(
        classes(&events_after),
        vec!["configuration", "request", "api-request", "api-timeout"]
    );
    assert_eq!(count(&events_after, "api-response"), 0);
    assert_eq!(count(&events_after, "api-failure"), 0);
    assert_eq!(final_state(&events, submitted.id), Some(AttemptState::Timeout));
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn requests_inherit_the_retry_budget_in_effect_at_submission() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let worker = spawn_processor(
        &store,
        [
            Outcome::Failure("a".to_string()),
            Outcome::Failure("b".to_string()),
            Outcome::Failure("c".to_string()),
        ],
    );

    store
        .insert(Uuid::nil(), configuration(2, 0.0), 0)
        .await
        .expect("configure");
    store
        .insert(Uuid::new_v4(), request("x"), 0)
        .await
        .expect("submit");

    let events = wait_until(&store, |events| count(events, "api-failure") == 3).await;
    // three attempts issued in order, and not one more than the budget
    let attempts: Vec<usize> = events
        .iter()
        .filter_map(|envelope| match envelope.event {
            Event::ApiRequest { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    worker.abort();
}
