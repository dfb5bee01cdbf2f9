//! Logging decorator for the event store contract.
//!
//! The goal is to add logging to the event stores without repeating it in
//! every backend. Every method delegates to the wrapped store and emits a
//! structured `tracing` record on entry and on outcome; streaming methods
//! interpose an intermediate channel that logs each emitted element without
//! altering ordering. The decorator contributes zero new failure modes.

use crate::envelope::Envelope;
use crate::event::Event;
use crate::store::{EnvelopeStream, EventStore, EventStoreError, NotificationStream};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

/// Transparent wrapper emitting structured log records on every call.
pub struct LoggingEventStore {
    inner: Arc<dyn EventStore>,
}

impl LoggingEventStore {
    /// Wrap an event store.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self { inner }
    }
}

impl EventStore for LoggingEventStore {
    fn error(&self) -> Option<EventStoreError> {
        self.inner.error()
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!("closing event store");
            match self.inner.close().await {
                Ok(()) => {
                    debug!("closed event store");
                    Ok(())
                }
                Err(error) => {
                    debug!(%error, "failed to close event store");
                    Err(error)
                }
            }
        })
    }

    fn insert(
        &self,
        external_uuid: Uuid,
        event: Event,
        causation_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(class = event.class(), causation_id, %external_uuid, "inserting event");
            match self.inner.insert(external_uuid, event, causation_id).await {
                Ok(envelope) => {
                    debug!(id = envelope.id, "inserted event");
                    Ok(envelope)
                }
                Err(error) => {
                    debug!(%error, "failed to insert event");
                    Err(error)
                }
            }
        })
    }

    fn resolve_uuid(
        &self,
        external_uuid: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<i32, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(%external_uuid, "resolving external UUID");
            match self.inner.resolve_uuid(external_uuid).await {
                Ok(id) => {
                    debug!(id, "resolved external UUID");
                    Ok(id)
                }
                Err(error) => {
                    debug!(%error, "failed to resolve external UUID");
                    Err(error)
                }
            }
        })
    }

    fn retrieve_one(
        &self,
        id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(id, "loading event");
            match self.inner.retrieve_one(id).await {
                Ok(envelope) => {
                    debug!(
                        class = envelope.event.class(),
                        causation_id = envelope.causation_id,
                        created = %envelope.created,
                        "loaded event"
                    );
                    Ok(envelope)
                }
                Err(error) => {
                    debug!(%error, "failed to load event");
                    Err(error)
                }
            }
        })
    }

    fn load_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_after, "loading events");
            match self.inner.load_events(start_after).await {
                Ok(stream) => Ok(log_envelopes(stream)),
                Err(error) => {
                    debug!(%error, "failed to load events");
                    Err(error)
                }
            }
        })
    }

    fn follow_notifications(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            debug!("following notifications");
            match self.inner.follow_notifications().await {
                Ok(mut stream) => {
                    let (tx, rx) = mpsc::channel(1);
                    tokio::spawn(async move {
                        while let Some(notification) = stream.next().await {
                            debug!(id = notification.id, "notification");
                            if tx.send(notification).await.is_err() {
                                break;
                            }
                        }
                    });
                    let logged: NotificationStream = Box::pin(ReceiverStream::new(rx));
                    Ok(logged)
                }
                Err(error) => {
                    debug!(%error, "failed to follow notifications");
                    Err(error)
                }
            }
        })
    }

    fn follow_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_after, "following events");
            match self.inner.follow_events(start_after).await {
                Ok(stream) => Ok(log_envelopes(stream)),
                Err(error) => {
                    debug!(%error, "failed to follow events");
                    Err(error)
                }
            }
        })
    }
}

/// Interpose a channel that logs every envelope crossing the stream.
fn log_envelopes(mut stream: EnvelopeStream) -> EnvelopeStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(envelope) = stream.next().await {
            debug!(
                id = envelope.id,
                class = envelope.event.class(),
                causation_id = envelope.causation_id,
                "event"
            );
            if tx.send(envelope).await.is_err() {
                break;
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}
