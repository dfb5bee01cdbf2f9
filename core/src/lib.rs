//! # Courier Core
//!
//! Core contracts for the Courier event-sourced API broker.
//!
//! Courier mediates client requests to an unreliable upstream API by
//! persisting every step of the conversation - submission, each attempt,
//! each response, failure or timeout - as an immutable event in a durable,
//! totally ordered log. Consumers reconstruct request state purely by
//! replaying that log.
//!
//! This crate defines:
//!
//! - [`event::Event`] - the closed set of event kinds and their payloads
//! - [`envelope::Envelope`] / [`envelope::Notification`] - the per-event
//!   metadata record and the lightweight "event N exists now" signal
//! - [`store::EventStore`] - the contract every storage backend satisfies
//! - [`logging::LoggingEventStore`] - a transparent decorator that traces
//!   every contract call
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `courier-postgres`): production backend
//! - `MemoryEventStore` (in `courier-testing`): fast, deterministic testing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod event;
pub mod logging;
pub mod store;

pub use envelope::{Envelope, Notification};
pub use event::Event;
pub use logging::LoggingEventStore;
pub use store::{EnvelopeStream, EventStore, EventStoreError, NotificationStream};
