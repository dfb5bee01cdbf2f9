//! # Courier Broker
//!
//! The broker drives client requests through an unreliable upstream API.
//! Everything it does is expressed as events: the [`processor::RequestProcessor`]
//! consumes the event stream, dispatches upstream calls and records their
//! outcomes; the [`timeout::TimeoutEventStore`] decorator turns the timeout
//! policy into a store-layer concern; the [`observer::RequestWatcher`]
//! derives per-request state from replayed history alone.
//!
//! Retries, timeouts and idempotent submission are event-handling policy,
//! deliberately separated from any business interpretation of responses.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod observer;
pub mod processor;
pub mod state;
pub mod timeout;
pub mod upstream;

pub use observer::RequestWatcher;
pub use processor::RequestProcessor;
pub use state::{AttemptState, RequestData, RequestProjection};
pub use timeout::TimeoutEventStore;
pub use upstream::{HttpApi, MockApi, Outcome, ScriptedApi, UpstreamApi};
