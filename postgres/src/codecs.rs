//! JSONB codecs for the event classes.
//!
//! The codecs convert between the live [`Event`] value and the
//! general-purpose representation stored in the `payload` column. The class
//! tag stored next to the payload is the discriminator used on load.
//!
//! The payload keys are part of the wire format shared with every other
//! implementation of the log and must not change:
//! `simple {message}`, `configuration {retries, timeout}`,
//! `request {request}`, `api-request {attempt}`,
//! `api-response {attempt, response}`, `api-failure {attempt, failure}`,
//! `api-timeout {attempt}`.

use courier_core::{Event, EventStoreError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Bijection between one event class and its stored representation.
pub trait EventCodec: Send + Sync {
    /// The class tag this codec handles.
    fn class(&self) -> &'static str;

    /// Serialize the event for storage.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Serialization`] when handed an event of a
    /// different class; that is a programmer error surfaced as data.
    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError>;

    /// Decode an event from its stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Serialization`] when the payload lacks a
    /// field or carries a wrong type. Errors here are non-recoverable: they
    /// mean the actual and expected storage structure diverged.
    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError>;
}

/// Map from event class tag to its codec.
///
/// Each backend owns one registry; this one produces the JSONB
/// representation for the `events.payload` column.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Arc<HashMap<&'static str, Box<dyn EventCodec>>>,
}

impl CodecRegistry {
    /// Registry with codecs for every event class the broker knows.
    #[must_use]
    pub fn with_defaults() -> Self {
        let codecs: Vec<Box<dyn EventCodec>> = vec![
            Box::new(SimpleCodec),
            Box::new(ConfigurationCodec),
            Box::new(RequestCodec),
            Box::new(ApiRequestCodec),
            Box::new(ApiResponseCodec),
            Box::new(ApiFailureCodec),
            Box::new(ApiTimeoutCodec),
        ];
        Self {
            codecs: Arc::new(codecs.into_iter().map(|codec| (codec.class(), codec)).collect()),
        }
    }

    /// Look up the codec for a class tag.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::UnknownClass`] for a tag without a codec.
    /// On the read path this is a non-recoverable store error.
    pub fn get(&self, class: &str) -> Result<&dyn EventCodec, EventStoreError> {
        self.codecs
            .get(class)
            .map(AsRef::as_ref)
            .ok_or_else(|| EventStoreError::UnknownClass(class.to_string()))
    }
}

fn wrong_class(codec: &'static str, event: &Event) -> EventStoreError {
    EventStoreError::Serialization(format!(
        "codec `{codec}` cannot serialize event class `{}`",
        event.class()
    ))
}

fn field_str(payload: &Value, key: &str) -> Result<String, EventStoreError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| missing(key))
}

fn field_attempt(payload: &Value) -> Result<usize, EventStoreError> {
    payload
        .get("attempt")
        .and_then(Value::as_u64)
        .and_then(|attempt| usize::try_from(attempt).ok())
        .ok_or_else(|| missing("attempt"))
}

fn missing(key: &str) -> EventStoreError {
    EventStoreError::Serialization(format!("missing or mistyped payload field `{key}`"))
}

struct SimpleCodec;

impl EventCodec for SimpleCodec {
    fn class(&self) -> &'static str {
        "simple"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::Simple { message } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "message": message }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::Simple {
            message: field_str(payload, "message")?,
        })
    }
}

struct ConfigurationCodec;

impl EventCodec for ConfigurationCodec {
    fn class(&self) -> &'static str {
        "configuration"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::Configuration { retries, timeout } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "retries": retries, "timeout": timeout }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        let retries = payload
            .get("retries")
            .and_then(Value::as_i64)
            .and_then(|retries| i32::try_from(retries).ok())
            .ok_or_else(|| missing("retries"))?;
        let timeout = payload
            .get("timeout")
            .and_then(Value::as_f64)
            .ok_or_else(|| missing("timeout"))?;
        Ok(Event::Configuration { retries, timeout })
    }
}

struct RequestCodec;

impl EventCodec for RequestCodec {
    fn class(&self) -> &'static str {
        "request"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::Request { request } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "request": request }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::Request {
            request: field_str(payload, "request")?,
        })
    }
}

struct ApiRequestCodec;

impl EventCodec for ApiRequestCodec {
    fn class(&self) -> &'static str {
        "api-request"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::ApiRequest { attempt } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "attempt": attempt }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::ApiRequest {
            attempt: field_attempt(payload)?,
        })
    }
}

struct ApiResponseCodec;

impl EventCodec for ApiResponseCodec {
    fn class(&self) -> &'static str {
        "api-response"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::ApiResponse { attempt, response } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "attempt": attempt, "response": response }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::ApiResponse {
            attempt: field_attempt(payload)?,
            response: field_str(payload, "response")?,
        })
    }
}

struct ApiFailureCodec;

impl EventCodec for ApiFailureCodec {
    fn class(&self) -> &'static str {
        "api-failure"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::ApiFailure { attempt, failure } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "attempt": attempt, "failure": failure }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::ApiFailure {
            attempt: field_attempt(payload)?,
            failure: field_str(payload, "failure")?,
        })
    }
}

struct ApiTimeoutCodec;

impl EventCodec for ApiTimeoutCodec {
    fn class(&self) -> &'static str {
        "api-timeout"
    }

    fn serialize(&self, event: &Event) -> Result<Value, EventStoreError> {
        let Event::ApiTimeout { attempt } = event else {
            return Err(wrong_class(self.class(), event));
        };
        Ok(json!({ "attempt": attempt }))
    }

    fn deserialize(&self, payload: &Value) -> Result<Event, EventStoreError> {
        Ok(Event::ApiTimeout {
            attempt: field_attempt(payload)?,
        })
    }
}
