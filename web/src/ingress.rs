//! Client-facing ingress.
//!
//! Submissions are idempotent: the client supplies the external UUID in the
//! path, and a repeated submission with the same UUID answers with `409`
//! without appending anything to the log.

use crate::error::AppError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use courier_core::{Envelope, Event, EventStore, EventStoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Router for the ingress API.
pub fn ingress_router(store: Arc<dyn EventStore>) -> Router {
    Router::new()
        .route("/up", get(up))
        .route("/request/:external_uuid", post(post_request).get(get_request))
        .with_state(store)
}

async fn up() -> StatusCode {
    StatusCode::OK
}

/// Representation of the request during HTTP transfer.
#[derive(Deserialize)]
struct RequestBody {
    data: String,
}

/// Representation of a stored submission during HTTP transfer.
#[derive(Serialize)]
struct SubmissionBody {
    created: DateTime<Utc>,
    external_uuid: Uuid,
}

impl SubmissionBody {
    fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            created: envelope.created,
            external_uuid: envelope.external_uuid,
        }
    }
}

fn parse_external_uuid(text: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(text)
        .ok()
        .filter(|uuid| !uuid.is_nil())
        .ok_or_else(|| AppError::bad_request("external UUID is missing or nil"))
}

async fn post_request(
    State(store): State<Arc<dyn EventStore>>,
    Path(external_uuid): Path<String>,
    Json(body): Json<RequestBody>,
) -> Result<(StatusCode, Json<SubmissionBody>), AppError> {
    let external_uuid = parse_external_uuid(&external_uuid)?;

    let event = Event::Request { request: body.data };
    let envelope = store
        .insert(external_uuid, event, 0)
        .await
        .map_err(|error| match error {
            EventStoreError::DuplicateEventUuid => {
                AppError::conflict("a request with this external UUID already exists")
            }
            other => AppError::internal(other.to_string()),
        })?;

    info!(id = envelope.id, %external_uuid, "accepted request");
    Ok((
        StatusCode::CREATED,
        Json(SubmissionBody::from_envelope(&envelope)),
    ))
}

async fn get_request(
    State(store): State<Arc<dyn EventStore>>,
    Path(external_uuid): Path<String>,
) -> Result<Json<SubmissionBody>, AppError> {
    let external_uuid = parse_external_uuid(&external_uuid)?;

    let id = store
        .resolve_uuid(external_uuid)
        .await
        .map_err(|error| match error {
            EventStoreError::UuidNotFound(_) => {
                AppError::not_found("no request with this external UUID")
            }
            other => AppError::internal(other.to_string()),
        })?;

    let envelope = store
        .retrieve_one(id)
        .await
        .map_err(|error| AppError::internal(error.to_string()))?;

    Ok(Json(SubmissionBody::from_envelope(&envelope)))
}
