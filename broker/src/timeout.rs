//! Timeout policy as an event store decorator.
//!
//! Wrapping the store keeps the timeout concern out of the consumers: they
//! see a uniform event stream in which `api-timeout` events simply appear.
//! The decorator hooks into two paths:
//!
//! - On `follow_events` it interposes a pass-through that picks the
//!   configured timeout up from `configuration` events crossing the stream.
//! - On `insert` of an `api-request` event it schedules a delayed insert of
//!   the matching `api-timeout` event, with the same attempt and causation.
//!
//! The timeout event is always inserted on expiry, independent of whether a
//! response or failure already arrived; consumers interpret it in light of
//! earlier attempt outcomes. Scheduling is best-effort: closing the store
//! cancels timers that have not fired yet.

use courier_core::{
    Envelope, EnvelopeStream, Event, EventStore, EventStoreError, NotificationStream,
};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event store decorator that emits `api-timeout` events.
pub struct TimeoutEventStore {
    inner: Arc<dyn EventStore>,
    timeout: Arc<RwLock<Option<Duration>>>,
    shutdown: CancellationToken,
}

impl TimeoutEventStore {
    /// Wrap an event store. No timeout is scheduled until a configuration
    /// event with a positive timeout crosses a followed stream.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            timeout: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    fn current_timeout(&self) -> Option<Duration> {
        self.timeout.read().map(|slot| *slot).unwrap_or(None)
    }
}

impl EventStore for TimeoutEventStore {
    fn error(&self) -> Option<EventStoreError> {
        self.inner.error()
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            // cancel pending timers before the store goes away; an expiry
            // racing the shutdown must not observe a half-closed store
            self.shutdown.cancel();
            self.inner.close().await
        })
    }

    fn insert(
        &self,
        external_uuid: Uuid,
        event: Event,
        causation_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let envelope = self.inner.insert(external_uuid, event, causation_id).await?;

            if let Event::ApiRequest { attempt } = envelope.event {
                // the duration is a snapshot; a reconfiguration after
                // scheduling does not touch timers already running
                if let Some(timeout) = self.current_timeout() {
                    let inner = Arc::clone(&self.inner);
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = shutdown.cancelled() => {
                                debug!(attempt, causation_id, "store closed, skipping timeout event");
                            }
                            () = tokio::time::sleep(timeout) => {
                                let result = inner
                                    .insert(Uuid::nil(), Event::ApiTimeout { attempt }, causation_id)
                                    .await;
                                if let Err(error) = result {
                                    warn!(%error, attempt, causation_id, "failed to insert timeout event");
                                }
                            }
                        }
                    });
                }
            }

            Ok(envelope)
        })
    }

    fn resolve_uuid(
        &self,
        external_uuid: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<i32, EventStoreError>> + Send + '_>> {
        self.inner.resolve_uuid(external_uuid)
    }

    fn retrieve_one(
        &self,
        id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>> {
        self.inner.retrieve_one(id)
    }

    fn load_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        self.inner.load_events(start_after)
    }

    fn follow_notifications(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, EventStoreError>> + Send + '_>>
    {
        self.inner.follow_notifications()
    }

    fn follow_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut stream = self.inner.follow_events(start_after).await?;

            let (tx, rx) = mpsc::channel(1);
            let timeout = Arc::clone(&self.timeout);
            tokio::spawn(async move {
                while let Some(envelope) = stream.next().await {
                    if let Event::Configuration { timeout: seconds, .. } = envelope.event {
                        // negative leaves the current value alone, zero
                        // disables the policy, positive replaces it
                        if seconds >= 0.0 {
                            let updated = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
                            if let Ok(mut slot) = timeout.write() {
                                *slot = updated;
                            }
                            debug!(value = ?updated, "adjusted timeout");
                        }
                    }
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }
            });

            let stream: EnvelopeStream = Box::pin(ReceiverStream::new(rx));
            Ok(stream)
        })
    }
}
