//! Streaming behavior of the in-memory event store: bounded replay,
//! blocking follow, notification fan-out, shutdown.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use courier_core::{Event, EventStore, EventStoreError};
use courier_testing::MemoryEventStore;
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

fn simple(message: &str) -> Event {
    Event::Simple {
        message: message.to_string(),
    }
}

#[tokio::test]
async fn load_events_replays_and_terminates() {
    let store = MemoryEventStore::new();
    for message in ["a", "b", "c"] {
        store
            .insert(Uuid::nil(), simple(message), 0)
            .await
            .expect("insert");
    }

    let stream = store.load_events(0).await.expect("load");
    let ids: Vec<i32> = stream.map(|envelope| envelope.id).collect().await;
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(store.error(), None);
}

#[tokio::test]
async fn load_events_honors_start_after() {
    let store = MemoryEventStore::new();
    for message in ["a", "b", "c"] {
        store
            .insert(Uuid::nil(), simple(message), 0)
            .await
            .expect("insert");
    }

    let stream = store.load_events(2).await.expect("load");
    let ids: Vec<i32> = stream.map(|envelope| envelope.id).collect().await;
    assert_eq!(ids, vec![3]);
}

#[tokio::test]
async fn load_events_rejects_unknown_start_after() {
    let store = MemoryEventStore::new();
    let result = store.load_events(9).await;
    assert!(matches!(result, Err(EventStoreError::NotFound(9))));
}

#[tokio::test]
async fn follow_events_blocks_at_the_tip_until_an_insert() {
    let store = MemoryEventStore::new();
    store
        .insert(Uuid::nil(), simple("existing"), 0)
        .await
        .expect("insert");

    let mut stream = store.follow_events(0).await.expect("follow");
    let first = stream.next().await.expect("catch-up event");
    assert_eq!(first.id, 1);

    // caught up: the stream must suspend, not end
    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err(), "follow must block past the tip");

    store
        .insert(Uuid::nil(), simple("new"), 0)
        .await
        .expect("insert");
    let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("wake up on insert")
        .expect("stream still open");
    assert_eq!(second.id, 2);
}

#[tokio::test]
async fn follow_events_delivers_in_strict_id_order() {
    let store = MemoryEventStore::new();
    let mut stream = store.follow_events(0).await.expect("follow");

    for message in ["a", "b", "c", "d"] {
        store
            .insert(Uuid::nil(), simple(message), 0)
            .await
            .expect("insert");
    }

    let mut ids = Vec::new();
    for _ in 0..4 {
        let envelope = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery")
            .expect("stream open");
        ids.push(envelope.id);
    }
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn follow_notifications_announces_each_insert() {
    let store = MemoryEventStore::new();
    let mut notifications = store.follow_notifications().await.expect("follow");

    store
        .insert(Uuid::nil(), simple("a"), 0)
        .await
        .expect("insert");
    store
        .insert(Uuid::nil(), simple("b"), 0)
        .await
        .expect("insert");

    let first = tokio::time::timeout(Duration::from_secs(1), notifications.next())
        .await
        .expect("delivery")
        .expect("stream open");
    let second = tokio::time::timeout(Duration::from_secs(1), notifications.next())
        .await
        .expect("delivery")
        .expect("stream open");
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
}

#[tokio::test]
async fn duplicate_uuid_produces_no_notification() {
    let store = MemoryEventStore::new();
    let mut notifications = store.follow_notifications().await.expect("follow");

    let key = Uuid::new_v4();
    store.insert(key, simple("a"), 0).await.expect("first");
    let duplicate = store.insert(key, simple("b"), 0).await;
    assert_eq!(duplicate, Err(EventStoreError::DuplicateEventUuid));

    let first = tokio::time::timeout(Duration::from_secs(1), notifications.next())
        .await
        .expect("delivery")
        .expect("stream open");
    assert_eq!(first.id, 1);

    let silence = tokio::time::timeout(Duration::from_millis(50), notifications.next()).await;
    assert!(silence.is_err(), "rejected insert must not notify");
}

#[tokio::test]
async fn close_terminates_followers() {
    let store = MemoryEventStore::new();
    let mut stream = store.follow_events(0).await.expect("follow");

    store.close().await.expect("close");

    let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("follower must terminate");
    assert!(ended.is_none(), "stream must close on shutdown");
    assert_eq!(store.error(), Some(EventStoreError::Closed));
}
