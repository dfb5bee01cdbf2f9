//! In-memory event store.
//!
//! Events live in a `Vec` guarded by a mutex; the envelope with id `n` sits
//! at index `n - 1`, which makes the dense-id invariant structural.
//! Notification fan-out uses a broadcast channel seeded at stream creation,
//! mirroring the capped, tail-readable notification queue of the durable
//! backends: a lagging follower may lose wake-up hints, never events,
//! because followers re-query the log for everything beyond the last id
//! they emitted.

use chrono::Utc;
use courier_core::{
    Envelope, EnvelopeStream, Event, EventStore, EventStoreError, Notification, NotificationStream,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Room for wake-up hints a slow follower has not consumed yet. Overflow
/// drops hints, not events.
const NOTIFICATION_BACKLOG: usize = 256;

struct Shared {
    events: Vec<Envelope>,
    uuids: HashMap<Uuid, i32>,
    error: Option<EventStoreError>,
}

/// In-memory implementation of the event store contract.
pub struct MemoryEventStore {
    shared: Arc<Mutex<Shared>>,
    notify: broadcast::Sender<Notification>,
    shutdown: CancellationToken,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFICATION_BACKLOG);
        Self {
            shared: Arc::new(Mutex::new(Shared {
                events: Vec::new(),
                uuids: HashMap::new(),
                error: None,
            })),
            notify,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(shared: &Mutex<Shared>) -> Result<MutexGuard<'_, Shared>, EventStoreError> {
        shared
            .lock()
            .map_err(|_| EventStoreError::Storage("store mutex poisoned".to_string()))
    }

    /// Fail fast when the store already carries a sticky error, and check
    /// that a nonzero `start_after` references a persisted event.
    fn check_start(&self, start_after: i32) -> Result<(), EventStoreError> {
        let guard = Self::lock(&self.shared)?;
        if let Some(error) = &guard.error {
            return Err(error.clone());
        }
        if start_after != 0 && envelope_at(&guard, start_after).is_none() {
            return Err(EventStoreError::NotFound(start_after));
        }
        Ok(())
    }
}

/// The envelope with the given id, if persisted. Ids are the index plus one.
fn envelope_at(shared: &Shared, id: i32) -> Option<&Envelope> {
    usize::try_from(id)
        .ok()
        .filter(|id| *id > 0)
        .and_then(|id| shared.events.get(id - 1))
}

impl EventStore for MemoryEventStore {
    fn error(&self) -> Option<EventStoreError> {
        Self::lock(&self.shared).map_or_else(Some, |guard| guard.error.clone())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!("closing event store");
            let mut guard = Self::lock(&self.shared)?;
            if guard.error.is_none() {
                guard.error = Some(EventStoreError::Closed);
            }
            drop(guard);
            self.shutdown.cancel();
            Ok(())
        })
    }

    fn insert(
        &self,
        external_uuid: Uuid,
        event: Event,
        causation_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(class = event.class(), causation_id, "inserting event");
            let mut guard = Self::lock(&self.shared)?;
            if let Some(error) = &guard.error {
                return Err(error.clone());
            }
            if causation_id != 0 && envelope_at(&guard, causation_id).is_none() {
                return Err(EventStoreError::InvalidEventId(causation_id.to_string()));
            }
            if !external_uuid.is_nil() && guard.uuids.contains_key(&external_uuid) {
                // no id is consumed and no notification goes out
                return Err(EventStoreError::DuplicateEventUuid);
            }

            let id = i32::try_from(guard.events.len() + 1)
                .map_err(|_| EventStoreError::Storage("event id space exhausted".to_string()))?;
            let envelope = Envelope {
                id,
                external_uuid,
                created: Utc::now(),
                causation_id,
                event,
            };
            guard.events.push(envelope.clone());
            if !external_uuid.is_nil() {
                guard.uuids.insert(external_uuid, id);
            }
            // still holding the lock, so notifications keep id order
            let _ = self.notify.send(Notification { id });
            Ok(envelope)
        })
    }

    fn resolve_uuid(
        &self,
        external_uuid: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<i32, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if external_uuid.is_nil() {
                return Err(EventStoreError::NilUuid);
            }
            let guard = Self::lock(&self.shared)?;
            if let Some(error) = &guard.error {
                return Err(error.clone());
            }
            guard
                .uuids
                .get(&external_uuid)
                .copied()
                .ok_or(EventStoreError::UuidNotFound(external_uuid))
        })
    }

    fn retrieve_one(
        &self,
        id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if id <= 0 {
                return Err(EventStoreError::InvalidEventId(id.to_string()));
            }
            let guard = Self::lock(&self.shared)?;
            if let Some(error) = &guard.error {
                return Err(error.clone());
            }
            envelope_at(&guard, id)
                .cloned()
                .ok_or(EventStoreError::NotFound(id))
        })
    }

    fn load_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_after, "loading events");
            self.check_start(start_after)?;

            let (tx, rx) = mpsc::channel(1);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut last = start_after;
                loop {
                    let next = match Self::lock(&shared) {
                        Ok(guard) => envelope_at(&guard, last + 1).cloned(),
                        Err(_) => return,
                    };
                    let Some(envelope) = next else { return };
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                    last += 1;
                }
            });

            let stream: EnvelopeStream = Box::pin(ReceiverStream::new(rx));
            Ok(stream)
        })
    }

    fn follow_notifications(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            debug!("following notifications");
            if let Some(error) = self.error() {
                return Err(error);
            }

            let (tx, rx) = mpsc::channel(1);
            let mut notifications = self.notify.subscribe();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        received = notifications.recv() => match received {
                            Ok(notification) => {
                                if tx.send(notification).await.is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });

            let stream: NotificationStream = Box::pin(ReceiverStream::new(rx));
            Ok(stream)
        })
    }

    fn follow_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_after, "following events");
            self.check_start(start_after)?;

            let (tx, rx) = mpsc::channel(1);
            let shared = Arc::clone(&self.shared);
            // subscribe before the catch-up read so no wake-up is missed
            let mut notifications = self.notify.subscribe();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut last = start_after;
                loop {
                    // drain everything currently visible
                    loop {
                        let next = match Self::lock(&shared) {
                            Ok(guard) => envelope_at(&guard, last + 1).cloned(),
                            Err(_) => return,
                        };
                        let Some(envelope) = next else { break };
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                        last += 1;
                    }
                    // park until something happens; the hint's id does not
                    // matter, the drain above re-queries past `last`
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        received = notifications.recv() => match received {
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });

            let stream: EnvelopeStream = Box::pin(ReceiverStream::new(rx));
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new()
    }

    fn simple(message: &str) -> Event {
        Event::Simple {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn ids_are_dense_and_monotonic() {
        let store = store();
        for expected in 1..=5 {
            let envelope = store
                .insert(Uuid::nil(), simple("x"), 0)
                .await
                .expect("insert");
            assert_eq!(envelope.id, expected);
        }
    }

    #[tokio::test]
    async fn duplicate_uuid_is_rejected_without_consuming_an_id() {
        let store = store();
        let key = Uuid::new_v4();
        store.insert(key, simple("a"), 0).await.expect("first");
        let result = store.insert(key, simple("b"), 0).await;
        assert_eq!(result, Err(EventStoreError::DuplicateEventUuid));

        let next = store.insert(Uuid::nil(), simple("c"), 0).await.expect("next");
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn nil_uuid_never_collides() {
        let store = store();
        store.insert(Uuid::nil(), simple("a"), 0).await.expect("a");
        store.insert(Uuid::nil(), simple("b"), 0).await.expect("b");
    }

    #[tokio::test]
    async fn resolve_uuid_round_trips() {
        let store = store();
        let key = Uuid::new_v4();
        let envelope = store.insert(key, simple("a"), 0).await.expect("insert");
        assert_eq!(store.resolve_uuid(key).await, Ok(envelope.id));
        assert_eq!(store.resolve_uuid(Uuid::nil()).await, Err(EventStoreError::NilUuid));
        let unknown = Uuid::new_v4();
        assert_eq!(
            store.resolve_uuid(unknown).await,
            Err(EventStoreError::UuidNotFound(unknown))
        );
    }

    #[tokio::test]
    async fn insert_validates_causation() {
        let store = store();
        let result = store.insert(Uuid::nil(), simple("a"), 7).await;
        assert!(matches!(result, Err(EventStoreError::InvalidEventId(_))));
    }

    #[tokio::test]
    async fn closed_store_rejects_calls_and_reports_error() {
        let store = store();
        store.close().await.expect("close");
        assert_eq!(store.error(), Some(EventStoreError::Closed));
        let result = store.insert(Uuid::nil(), simple("a"), 0).await;
        assert_eq!(result, Err(EventStoreError::Closed));
    }
}
