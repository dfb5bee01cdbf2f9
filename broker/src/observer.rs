//! Read-only request observer.
//!
//! Consumes the same stream as the processor and reconstructs the same
//! per-request state, but dispatches nothing and inserts nothing: it only
//! reports each transition together with the request's overall state.
//! Operators run it to watch progress; it doubles as the reference for
//! state reconstruction from history alone.

use crate::state::RequestProjection;
use courier_core::{Event, EventStore, EventStoreError};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

/// Working data for a request observer.
pub struct RequestWatcher {
    store: Arc<dyn EventStore>,
    projection: RequestProjection,
}

impl RequestWatcher {
    /// Build a watcher over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            projection: RequestProjection::new(),
        }
    }

    /// Watch requests as they are processed, starting after the given id.
    ///
    /// # Errors
    ///
    /// Returns the store's sticky error when the follow stream ends
    /// abnormally.
    pub async fn run(&mut self, start_after: i32) -> Result<(), EventStoreError> {
        let mut events = self.store.follow_events(start_after).await?;

        while let Some(envelope) = events.next().await {
            let verb = match &envelope.event {
                Event::Request { .. } => "request received",
                Event::ApiRequest { .. } => "API request starting",
                Event::ApiResponse { .. } => "API request succeeded",
                Event::ApiFailure { .. } => "API request failed",
                Event::ApiTimeout { .. } => "API request timeout elapsed",
                Event::Simple { .. } | Event::Configuration { .. } => {
                    self.projection.apply(&envelope);
                    continue;
                }
            };

            if let Some(request_id) = self.projection.apply(&envelope) {
                if let Some(state) = self.projection.state_of(request_id) {
                    info!(request_id, state = %state, "{verb}");
                }
            }
        }

        match self.store.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
