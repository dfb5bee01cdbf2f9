//! # Courier Testing
//!
//! Test support for the Courier broker: an in-memory implementation of the
//! event store contract with the same observable behavior as the durable
//! backends - dense monotonic ids, idempotent insertion, ordered blocking
//! follow - but no external dependencies. Fast and deterministic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod memory;

pub use memory::MemoryEventStore;
