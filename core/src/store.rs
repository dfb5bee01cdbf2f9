//! Event store contract and error taxonomy.
//!
//! The [`EventStore`] trait is the behavioral contract every storage
//! backend satisfies, defined to be agnostic of the storage infrastructure
//! behind it. Its main parts are idempotent insertion and two consumption
//! modes over the totally ordered log: bounded replay ([`EventStore::load_events`])
//! and unbounded follow ([`EventStore::follow_events`]).
//!
//! # Streams
//!
//! Streaming operations hand back a single-consumer, consume-once lazy
//! sequence. Items are plain [`Envelope`]s / [`Notification`]s; an I/O
//! failure mid-stream transitions the store into a sticky error state,
//! closes the stream, and is observable through [`EventStore::error`] after
//! the stream ends. Dropping the stream cancels the producer task promptly.
//!
//! Delivery is rendezvous: a slow consumer naturally slows the producer,
//! which in turn slows storage polling.
//!
//! # Dyn compatibility
//!
//! The trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` to enable trait object usage (`Arc<dyn EventStore>`). This is
//! required for the decorator layers and for runtime backend selection.

use crate::envelope::{Envelope, Notification};
use crate::event::Event;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Single-consumer stream of envelopes in strict id order.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Single-consumer stream of notifications in emission order.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Errors produced by event store operations.
///
/// The enum is `Clone` so the sticky error state can be handed out
/// repeatedly through [`EventStore::error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The external UUID identifying an event is already in use.
    ///
    /// Returned synchronously from [`EventStore::insert`]; never retried by
    /// the store, and mapped to `409 Conflict` by the HTTP ingress.
    #[error("duplicate event identifier UUID")]
    DuplicateEventUuid,

    /// A textual event id could not be parsed, or an id was out of range.
    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    /// The nil UUID was supplied where a real idempotency key is required.
    #[error("provided external UUID is nil")]
    NilUuid,

    /// No event with the given id exists.
    #[error("event {0} not found")]
    NotFound(i32),

    /// No event carries the given external UUID.
    #[error("no event with external UUID {0}")]
    UuidNotFound(Uuid),

    /// No codec is registered for the event class, or a stored class tag is
    /// unknown. On the read path this is a non-recoverable store error.
    #[error("no codec for event class {0}")]
    UnknownClass(String),

    /// The store has been closed; all further calls fail with this error.
    #[error("event store is closed")]
    Closed,

    /// Storage engine failure (connection, query, commit).
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Behavioral contract uniformly provided by all storage backends.
///
/// # Guarantees
///
/// - Ids are dense, strictly monotonic, and assigned at most once.
/// - `insert` is durable before it returns, and the corresponding
///   notification is emitted afterwards, in id order.
/// - A non-nil external UUID is unique across all events; colliding inserts
///   fail with [`EventStoreError::DuplicateEventUuid`] and consume no id.
/// - An event inserted by a task is visible to readers before the insert
///   call returns on that task (read-your-writes).
pub trait EventStore: Send + Sync {
    /// Parse a string that represents an event identifier.
    ///
    /// Zero is accepted: it is the "no causation" / "from the beginning"
    /// sentinel used throughout the contract.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidEventId`] for anything that is not
    /// a non-negative integer id.
    fn parse_event_id(&self, text: &str) -> Result<i32, EventStoreError> {
        text.parse::<i32>()
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| EventStoreError::InvalidEventId(text.to_string()))
    }

    /// Retrieve the sticky error state of the store.
    ///
    /// Streaming operations park their failure here before closing the
    /// stream; callers inspect it once the stream has ended.
    fn error(&self) -> Option<EventStoreError>;

    /// Release resources; subsequent calls fail with [`EventStoreError::Closed`].
    ///
    /// Closing also tears down active followers and cancels scheduled work
    /// that captured the store.
    ///
    /// # Errors
    ///
    /// Returns the underlying storage error if resource release fails.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Insert an event as payload into the store.
    ///
    /// The event is wrapped in an envelope and returned. A non-nil
    /// `external_uuid` attaches a client-supplied idempotency key and must
    /// be unique; the nil UUID marks internally generated events and never
    /// collides. `causation_id` is the id of the preceding event that
    /// caused this one, or zero.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::DuplicateEventUuid`] when the non-nil UUID is
    ///   already in use
    /// - [`EventStoreError::Closed`] after [`EventStore::close`]
    /// - [`EventStoreError::Storage`] on engine failure
    fn insert(
        &self,
        external_uuid: Uuid,
        event: Event,
        causation_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>>;

    /// Resolve an external UUID to the according internal id.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::NilUuid`] for the nil UUID
    /// - [`EventStoreError::UuidNotFound`] when no event carries the UUID
    fn resolve_uuid(
        &self,
        external_uuid: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<i32, EventStoreError>> + Send + '_>>;

    /// Retrieve just the event with the given id.
    ///
    /// Strict, unlike the range reads: a missing id is an error.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::InvalidEventId`] for non-positive ids
    /// - [`EventStoreError::NotFound`] when the id does not exist
    fn retrieve_one(
        &self,
        id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Envelope, EventStoreError>> + Send + '_>>;

    /// Retrieve existing events.
    ///
    /// Emits all envelopes with `id > start_after` in id order and
    /// terminates when caught up with the store. A `start_after` of zero
    /// starts from the first event; a nonzero value must reference an
    /// existing event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::NotFound`] when a nonzero `start_after`
    /// does not reference a persisted event.
    fn load_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>>;

    /// Follow the stream of notifications.
    ///
    /// Emits every newly created notification, in order, until the stream
    /// is dropped or the store is closed.
    ///
    /// # Errors
    ///
    /// Returns the sticky store error when the store is already failed or
    /// closed.
    fn follow_notifications(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, EventStoreError>> + Send + '_>>;

    /// Follow the stream of events.
    ///
    /// Like [`EventStore::load_events`], but once caught up the stream
    /// blocks until new events are stored. A notification's id is a hint,
    /// not a visibility promise: the reader re-queries for everything
    /// beyond the last emitted id, so out-of-order hints are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::NotFound`] when a nonzero `start_after`
    /// does not reference a persisted event.
    fn follow_events(
        &self,
        start_after: i32,
    ) -> Pin<Box<dyn Future<Output = Result<EnvelopeStream, EventStoreError>> + Send + '_>>;
}
