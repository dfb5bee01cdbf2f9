//! # Courier Web
//!
//! HTTP surfaces around the broker core:
//!
//! - the **ingress** ([`ingress_router`]): clients submit requests
//!   idempotently (`POST /request/:external_uuid`) and look their status
//!   envelope up again (`GET /request/:external_uuid`); duplicate
//!   submissions map to `409 Conflict`
//! - the **brittle upstream** ([`upstream_router`]): a deliberately
//!   unreliable API used to exercise the broker end to end, with
//!   configurable failure, silence and latency
//!
//! The ingress is one producer into the core among others; the core does
//! not require any particular transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod brittle;
mod error;
mod ingress;

pub use brittle::{upstream_router, BrittleSettings};
pub use error::AppError;
pub use ingress::ingress_router;
