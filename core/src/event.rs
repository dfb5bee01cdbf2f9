//! The closed set of events handled by the broker.
//!
//! Events are facts: they record that something happened and are never
//! updated or deleted. The set is deliberately a closed enum rather than an
//! open trait - exhaustiveness is checked by the compiler, and the "unknown
//! event class" failure mode only survives on the storage read path.
//!
//! Every variant maps to a stable, language-agnostic class tag (see
//! [`Event::class`]). The tag is what backends persist next to the payload
//! and what codecs dispatch on.

/// An event recorded in the broker's log.
///
/// The `attempt` carried by the four API-related variants is the zero-based
/// index of the upstream call within a request's retry budget. All events
/// belonging to one request share the request's id as their causation id.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Diagnostic marker without any behavioral effect.
    Simple {
        /// Free-form message.
        message: String,
    },

    /// Configuration settings for the way the upstream API is used.
    ///
    /// Negative values mean "leave the current value unchanged"; consumers
    /// apply the rest when the event crosses their stream.
    Configuration {
        /// Number of retries after a failed attempt.
        retries: i32,
        /// Timeout for each attempt, in seconds.
        timeout: f64,
    },

    /// A client-submitted request that should be sent to the upstream API.
    Request {
        /// The request payload, passed to the upstream verbatim.
        request: String,
    },

    /// An upstream communication attempt is being dispatched.
    ApiRequest {
        /// Zero-based index of the attempt.
        attempt: usize,
    },

    /// A response received from the upstream API.
    ///
    /// This does not discriminate between success and failure; any response
    /// body is stored without interpretation.
    ApiResponse {
        /// Zero-based index of the attempt.
        attempt: usize,
        /// The response body.
        response: String,
    },

    /// A locally observed failure while trying to reach the upstream API.
    ///
    /// By its nature this is generated on our side, like a failure to
    /// resolve the remote host. It is not an error response from remote.
    ApiFailure {
        /// Zero-based index of the attempt.
        attempt: usize,
        /// Description of the failure.
        failure: String,
    },

    /// The timeout for an attempt's response has elapsed.
    ///
    /// This is emitted independently of whether a response or failure
    /// arrived; it carries no data because it represents the absence of
    /// data. Consumers interpret it in light of earlier attempt outcomes.
    ApiTimeout {
        /// Zero-based index of the attempt.
        attempt: usize,
    },
}

impl Event {
    /// The stable textual class tag identifying this event kind.
    ///
    /// Tags are part of the wire format: backends store them next to the
    /// payload and use them as codec discriminators. They must never change.
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Configuration { .. } => "configuration",
            Self::Request { .. } => "request",
            Self::ApiRequest { .. } => "api-request",
            Self::ApiResponse { .. } => "api-response",
            Self::ApiFailure { .. } => "api-failure",
            Self::ApiTimeout { .. } => "api-timeout",
        }
    }
}
