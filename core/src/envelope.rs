//! Envelope and notification records.

use crate::event::Event;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable record wrapping an event with its log metadata.
///
/// Envelopes are write-once: once persisted they are never updated or
/// deleted. The `id` is the log's canonical ordering; `created` is recorded
/// for presentation only and is not an ordering source.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Strictly increasing positive sequence number assigned on append.
    pub id: i32,

    /// Client-supplied idempotency key.
    ///
    /// The nil UUID marks internally generated events, which are exempt
    /// from the uniqueness constraint.
    pub external_uuid: Uuid,

    /// Wall-clock time at append.
    pub created: DateTime<Utc>,

    /// Id of the event whose processing produced this one, or zero when the
    /// cause is not a preceding event.
    pub causation_id: i32,

    /// The event payload.
    pub event: Event,
}

/// An ordered signal that the event with this id exists now.
///
/// A notification carries only the information that something happened; the
/// what is carried by the [`Event`] reachable through the id. Tailing
/// readers use notifications as wake-up hints and re-query the log for
/// anything beyond the last id they emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Id of the persisted event this notification announces.
    pub id: i32,
}
