//! `PostgreSQL` event store backend for Courier.
//!
//! This crate implements the [`EventStore`] contract from `courier-core` on
//! top of `PostgreSQL` using sqlx. Design points:
//!
//! - **Dense ids.** The writer assigns `max(id) + 1` and retries on a
//!   primary-key collision. A database sequence would leave gaps on rolled
//!   back inserts; the log's ids must stay dense and strictly monotonic.
//! - **Idempotency.** A partial unique index on `external_uuid` (ignoring
//!   `NULL`) enforces the idempotency constraint. A collision against that
//!   index surfaces [`EventStoreError::DuplicateEventUuid`] immediately and
//!   is never retried; only primary-key collisions are.
//! - **Fan-out.** Every durable insert is announced with
//!   `pg_notify('courier_events', id)`. Followers treat the payload as a
//!   wake-up hint and re-query the log for everything beyond the last id
//!   they emitted, so delayed or reordered hints are harmless.
//!
//! # Example
//!
//! ```no_run
//! use courier_postgres::PostgresEventStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresEventStore::connect("postgres://localhost/courier").await?;
//! store.run_migrations().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codecs;

use chrono::{DateTime, Utc};
use courier_core::{
    Envelope, EnvelopeStream, Event, EventStore, EventStoreError, Notification, NotificationStream,
};
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub use codecs::{CodecRegistry, EventCodec};

/// Channel used for insert notifications.
const NOTIFY_CHANNEL: &str = "courier_events";

const NEXT_EVENT_SQL: &str = "SELECT id, external_uuid, created, causation_id, class, payload \
     FROM events WHERE id > $1 ORDER BY id ASC LIMIT 1";

const CATCH_UP_SQL: &str = "SELECT id, external_uuid, created, causation_id, class, payload \
     FROM events WHERE id > $1 ORDER BY id ASC";

/// Sticky error state shared with the producer tasks of active streams.
struct StoreState {
    error: Mutex<Option<EventStoreError>>,
    shutdown: CancellationToken,
}

impl StoreState {
    /// Record the first failure; later ones keep the original.
    fn stick(&self, error: EventStoreError) -> EventStoreError {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
        error
    }

    fn current(&self) -> Option<EventStoreError> {
        self.error
            .lock()
            .map_or(Some(EventStoreError::Closed), |slot| slot.clone())
    }

    fn check(&self) -> Result<(), EventStoreError> {
        self.current().map_or(Ok(()), Err)
    }
}

/// Event store on top of a `PostgreSQL` database.
pub struct PostgresEventStore {
    pool: PgPool,
    codecs: CodecRegistry,
    state: Arc<StoreState>,
}

impl PostgresEventStore {
    /// Connect to the given database URL with a small connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when the URL is invalid or the
    /// database cannot be reached.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        debug!(database_url, "creating event store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Ok(Self::from_pool(pool))
    }

    /// Build an event store from an existing connection pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            codecs: CodecRegistry::with_defaults(),
            state: Arc::new(StoreState {
                error: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run the schema migrations. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when a migration fails.
    pub async fn run_migrations(&self) -> Result<(), EventStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(format!("migration failed: {e}")))?;
        debug!("database migrations completed");
        Ok(())
    }

    /// Announce a durable insert. Failure to notify is non-fatal: followers
    /// re-query on the next hint.
    async fn notify(pool: &PgPool, id: i32) {
        let result = sqlx::query("SELECT pg_notify($1, $2::text)")
            .bind(NOTIFY_CHANNEL)
            .bind(id)
            .execute(pool)
            .await;
        if let Err(error) = result {
            warn!(%error, id, "failed to publish insert notification");
        }
    }

    async fn exists(&self, id: i32) -> Result<bool, EventStoreError> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.state.stick(storage(e)))?;
        Ok(row.is_some())
    }

    /// Validate the starting position of a range read.
    async fn check_start(&self, start_after: i32) -> Result<(), EventStoreError> {
        self.state.check()?;
        if start_after != 0 && !self.exists(start_after).await? {
            return Err(EventStoreError::NotFound(start_after));
        }
        Ok(())
    }
}

fn storage(error: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(error.to_string())
}

fn decode_row(codecs: &CodecRegistry, row: &PgRow) -> Result<Envelope, EventStoreError> {
    let id: i32 = row.try_get("id").map_err(storage)?;
    let external_uuid: Option<Uuid> = row.try_get("external_uuid").map_err(storage)?;
    let created: DateTime<Utc> = row.try_get("created").map_err(storage)?;
    let causation_id: i32 = row.try_get("causation_id").map_err(storage)?;
    let class: String = row.try_get("class").map_err(storage)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(storage)?;

    let event = codecs.get(&class)?.deserialize(&payload)?;
    Ok(Envelope {
        id,
        external_uuid: external_uuid.unwrap_or_else(Uuid::nil),
        created,
        causation_id,
        event,
    })
}

impl EventStore for PostgresEventStore {
    fn error(&self) -> Option<EventStoreError> {
        self.state.current()
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!("closing event store");
            if let Ok(mut slot) = self.state.error.lock() {
                if slot.is_none() {
                    *slot = Some(EventStoreError::Closed);
                }
            }
            self.state.shutdown.cancel();
            self.pool.close().await;
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
            self.state.check()?;
            debug!(class = event.class(), causation_id, "inserting event");

            let payload = self.codecs.get(event.class())?.serialize(&event)?;
            // nil marks internal events; stored as NULL so the partial
            // unique index ignores it
            let uuid_param = (!external_uuid.is_nil()).then_some(external_uuid);

            let mut attempted = 0i32;
            loop {
                let next_id: i32 =
                    sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM events")
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| self.state.stick(storage(e)))?;
                if next_id == attempted {
                    // the same id failed twice without anyone else claiming
                    // it; not a livable race, give up
                    return Err(self
                        .state
                        .stick(EventStoreError::Storage(format!(
                            "id {next_id} keeps colliding without progress"
                        ))));
                }
                attempted = next_id;

                let created = Utc::now();
                let result = sqlx::query(
                    "INSERT INTO events (id, external_uuid, created, causation_id, class, payload) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(next_id)
                .bind(uuid_param)
                .bind(created)
                .bind(causation_id)
                .bind(event.class())
                .bind(&payload)
                .execute(&self.pool)
                .await;

                match result {
                    Ok(_) => {
                        Self::notify(&self.pool, next_id).await;
                        return Ok(Envelope {
                            id: next_id,
                            external_uuid,
                            created,
                            causation_id,
                            event,
                        });
                    }
                    Err(error) => {
                        if let Some(db_error) = error.as_database_error() {
                            // 23505 is unique_violation; the constraint name
                            // tells the uuid index apart from an id race
                            if db_error.code().as_deref() == Some("23505") {
                                match db_error.constraint() {
                                    Some("events_external_uuid_key") => {
                                        return Err(EventStoreError::DuplicateEventUuid);
                                    }
                                    Some("events_pkey") => {
                                        debug!(id = next_id, "id collision, retrying");
                                        continue;
                                    }
                                    _ => {}
                                }
                            }
                        }
                        return Err(self.state.stick(storage(error)));
                    }
                }
            }
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
            self.state.check()?;

            let id: Option<i32> = sqlx::query_scalar("SELECT id FROM events WHERE external_uuid = $1")
                .bind(external_uuid)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| self.state.stick(storage(e)))?;
            id.ok_or(EventStoreError::UuidNotFound(external_uuid))
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
            self.state.check()?;
            debug!(id, "loading event");

            let row = sqlx::query(
                "SELECT id, external_uuid, created, causation_id, class, payload \
                 FROM events WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.state.stick(storage(e)))?;

            let Some(row) = row else {
                return Err(EventStoreError::NotFound(id));
            };
            decode_row(&self.codecs, &row).map_err(|e| self.state.stick(e))
        })
    }

    fn load_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_after, "loading events");
            self.check_start(start_after).await?;

            let (tx, rx) = mpsc::channel(1);
            let pool = self.pool.clone();
            let codecs = self.codecs.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let mut rows = sqlx::query(CATCH_UP_SQL).bind(start_after).fetch(&pool);
                while let Some(row) = rows.next().await {
                    let envelope = match row
                        .map_err(storage)
                        .and_then(|row| decode_row(&codecs, &row))
                    {
                        Ok(envelope) => envelope,
                        Err(error) => {
                            state.stick(error);
                            return;
                        }
                    };
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
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
            self.state.check()?;

            let (tx, rx) = mpsc::channel(1);
            let pool = self.pool.clone();
            let state = Arc::clone(&self.state);
            let shutdown = self.state.shutdown.clone();
            tokio::spawn(async move {
                let mut listener = match listen(&pool).await {
                    Ok(listener) => listener,
                    Err(error) => {
                        state.stick(error);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        received = listener.recv() => {
                            let notification = match received {
                                Ok(notification) => notification,
                                Err(error) => {
                                    state.stick(storage(error));
                                    return;
                                }
                            };
                            let Ok(id) = notification.payload().parse::<i32>() else {
                                warn!(payload = notification.payload(), "discarding malformed notification");
                                continue;
                            };
                            if tx.send(Notification { id }).await.is_err() {
                                return;
                            }
                        }
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
            self.check_start(start_after).await?;

            let (tx, rx) = mpsc::channel(1);
            let pool = self.pool.clone();
            let codecs = self.codecs.clone();
            let state = Arc::clone(&self.state);
            let shutdown = self.state.shutdown.clone();
            tokio::spawn(async move {
                // listen before the catch-up read so no wake-up is missed
                let mut listener = match listen(&pool).await {
                    Ok(listener) => listener,
                    Err(error) => {
                        state.stick(error);
                        return;
                    }
                };

                let mut last = start_after;
                loop {
                    // drain everything currently visible, one row at a time:
                    // the channel is a rendezvous, a slow consumer slows the
                    // polling down with it
                    loop {
                        let row = sqlx::query(NEXT_EVENT_SQL)
                            .bind(last)
                            .fetch_optional(&pool)
                            .await;
                        match row {
                            Ok(Some(row)) => match decode_row(&codecs, &row) {
                                Ok(envelope) => {
                                    let id = envelope.id;
                                    if tx.send(envelope).await.is_err() {
                                        return;
                                    }
                                    last = id;
                                }
                                Err(error) => {
                                    state.stick(error);
                                    return;
                                }
                            },
                            Ok(None) => break,
                            Err(error) => {
                                state.stick(storage(error));
                                return;
                            }
                        }
                    }
                    // caught up; park until a hint arrives, then re-query
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        received = listener.recv() => {
                            if let Err(error) = received {
                                state.stick(storage(error));
                                return;
                            }
                        }
                    }
                }
            });

            let stream: EnvelopeStream = Box::pin(ReceiverStream::new(rx));
            Ok(stream)
        })
    }
}

async fn listen(pool: &PgPool) -> Result<PgListener, EventStoreError> {
    let mut listener = PgListener::connect_with(pool).await.map_err(storage)?;
    listener.listen(NOTIFY_CHANNEL).await.map_err(storage)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_event_store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresEventStore>();
        assert_sync::<PostgresEventStore>();
    }
}
