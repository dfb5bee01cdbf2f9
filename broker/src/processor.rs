//! The request processor state machine.
//!
//! A long-running consumer of the event stream that drives each client
//! request through up to `retries + 1` upstream attempts. Every decision is
//! made from consumed events, never from call results, so a cold restart at
//! any position reconstructs exactly the state the live processor held
//! there.
//!
//! Ownership rules keep the processor lock-free: the `requests` map lives
//! in the follow loop and is mutated only there. Attempt tasks talk back
//! exclusively through the event store.

use crate::state::{locate, AttemptState, RequestData};
use crate::timeout::TimeoutEventStore;
use crate::upstream::{Outcome, UpstreamApi};
use courier_core::{Event, EventStore, EventStoreError};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Working data for the request processor.
///
/// Controls communication with the upstream API and the related policy:
/// retries and, through the [`TimeoutEventStore`] it installs over the
/// store, per-attempt timeouts.
pub struct RequestProcessor {
    store: Arc<dyn EventStore>,
    api: Arc<dyn UpstreamApi>,
    /// Retry budget applied to newly seen requests.
    retries: usize,
    /// Per-attempt timeout; applied by the store decorator, kept here for
    /// the configuration log line.
    timeout: Duration,
}

impl RequestProcessor {
    /// Build a processor over the given store and upstream adapter.
    ///
    /// The store is wrapped in the timeout decorator here, so every
    /// consumer of this processor's inserts sees timeout events without
    /// further wiring.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, api: Arc<dyn UpstreamApi>) -> Self {
        let store: Arc<dyn EventStore> = Arc::new(TimeoutEventStore::new(store));
        Self {
            store,
            api,
            retries: 0,
            timeout: Duration::ZERO,
        }
    }

    /// Process request events from the store, starting after the given id.
    ///
    /// Runs until the stream ends: on cancellation (the store was closed)
    /// or on a storage failure. Upstream failures are not errors - they
    /// become events.
    ///
    /// # Errors
    ///
    /// Returns the store's sticky error when the follow stream ends
    /// abnormally.
    pub async fn run(&mut self, start_after: i32) -> Result<(), EventStoreError> {
        let mut events = self.store.follow_events(start_after).await?;

        // key is the id of the initial request event, which every follow-up
        // event carries as its causation id
        let mut requests: HashMap<i32, RequestData> = HashMap::new();

        while let Some(envelope) = events.next().await {
            debug!(
                id = envelope.id,
                class = envelope.event.class(),
                causation_id = envelope.causation_id,
                "processing event"
            );

            match envelope.event.clone() {
                Event::Simple { .. } => {}

                Event::Configuration { retries, timeout } => {
                    if let Ok(retries) = usize::try_from(retries) {
                        self.retries = retries;
                    }
                    if timeout >= 0.0 {
                        self.timeout = Duration::from_secs_f64(timeout);
                    }
                    info!(
                        retries = self.retries,
                        timeout = ?self.timeout,
                        "updated API configuration"
                    );
                }

                Event::Request { .. } => {
                    info!(id = envelope.id, "starting request processing");
                    let id = envelope.id;
                    requests.insert(id, RequestData::new(envelope, self.retries));
                    if let Some(request) = requests.get(&id) {
                        self.start_api_call(request).await;
                    }
                }

                Event::ApiRequest { attempt } => {
                    let Some(request) = locate(&mut requests, &envelope) else {
                        continue;
                    };
                    if !request.set_attempt(attempt, AttemptState::Pending) {
                        error!(attempt, "attempt index outside the request's budget");
                        continue;
                    }
                    info!(attempt, "starting API call");
                }

                Event::ApiResponse { attempt, .. } => {
                    let Some(request) = locate(&mut requests, &envelope) else {
                        continue;
                    };
                    // success is terminal, no retry decision to make
                    request.set_attempt(attempt, AttemptState::Success);
                    info!(attempt, "completed API call");
                }

                Event::ApiFailure { attempt, .. } => {
                    let Some(request) = locate(&mut requests, &envelope) else {
                        continue;
                    };
                    request.set_attempt(attempt, AttemptState::Failure);
                    info!(attempt, "failed API call");
                    self.consider_retry(request, attempt).await;
                }

                Event::ApiTimeout { attempt } => {
                    let Some(request) = locate(&mut requests, &envelope) else {
                        continue;
                    };
                    // a timeout only voids a pending attempt; failure and
                    // success outcomes are final
                    if request.attempt(attempt) != Some(AttemptState::Pending) {
                        continue;
                    }
                    request.set_attempt(attempt, AttemptState::Timeout);
                    info!(attempt, "API call timed out");
                    self.consider_retry(request, attempt).await;
                }
            }
        }

        match self.store.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Decide whether the failed or timed-out attempt warrants a retry, and
    /// dispatch it.
    async fn consider_retry(&self, request: &RequestData, attempt: usize) {
        if attempt == request.retries() {
            info!("retries exhausted");
            return;
        }
        // a retry for this attempt may already be running; that happens
        // when the timeout elapsed before the failure arrived, or the
        // other way around
        if attempt + 1 != request.next_attempt() {
            info!("retry attempt already started");
            return;
        }
        if request.succeeded() {
            info!("request already succeeded, no need for a retry");
            return;
        }
        self.start_api_call(request).await;
    }

    /// Dispatch the next attempt for a request: record the attempt marker,
    /// then invoke the upstream from a detached task.
    async fn start_api_call(&self, request: &RequestData) {
        let attempt = request.next_attempt();
        let causation_id = request.id();
        let payload = request.request().to_string();

        // the marker must be durable before the upstream call starts; it is
        // also what arms the timeout decorator
        let marker = self
            .store
            .insert(Uuid::nil(), Event::ApiRequest { attempt }, causation_id)
            .await;
        if let Err(error) = marker {
            error!(%error, attempt, causation_id, "failed to record attempt start");
            return;
        }

        let store = Arc::clone(&self.store);
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let result = match api.process(&payload).await {
                Outcome::Response(response) => {
                    store
                        .insert(
                            Uuid::nil(),
                            Event::ApiResponse { attempt, response },
                            causation_id,
                        )
                        .await
                }
                Outcome::Failure(failure) => {
                    store
                        .insert(
                            Uuid::nil(),
                            Event::ApiFailure { attempt, failure },
                            causation_id,
                        )
                        .await
                }
                Outcome::Silent => {
                    info!(attempt, causation_id, "no response from API");
                    return;
                }
            };
            if let Err(error) = result {
                error!(%error, attempt, causation_id, "failed to record attempt outcome");
            }
        });
    }
}
