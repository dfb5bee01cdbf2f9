//! The brittle upstream: an API that sometimes answers, sometimes fails,
//! and sometimes says nothing at all.
//!
//! Successful calls answer with the reversed request body. Verbose
//! failures answer `503`. Silent failures panic the connection task, which
//! closes the connection without any answer - hacky, but it is exactly the
//! behavior a vanished remote exhibits to the client.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use rand::Rng;
use std::time::Duration;
use tracing::info;

/// Behavior knobs for the brittle upstream.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrittleSettings {
    /// Fraction of requests that fail.
    pub failure_rate: f64,
    /// Fraction of failing requests that produce no response at all.
    pub silent_failure_rate: f64,
    /// Minimal handling delay, in seconds.
    pub min_latency: f64,
    /// Maximal handling delay, in seconds.
    pub max_latency: f64,
}

/// Router for the brittle upstream API.
pub fn upstream_router(settings: BrittleSettings) -> Router {
    Router::new()
        .route("/up", get(up))
        .route("/api", post(api))
        .with_state(settings)
}

async fn up() -> StatusCode {
    StatusCode::OK
}

async fn api(State(settings): State<BrittleSettings>, body: String) -> Response {
    info!(bytes = body.len(), "handling /api request");

    let (delay, failed, silent) = {
        let mut rng = rand::thread_rng();
        let spread = (settings.max_latency - settings.min_latency).max(0.0);
        (
            (settings.min_latency + rng.gen::<f64>() * spread).max(0.0),
            rng.gen::<f64>() < settings.failure_rate,
            rng.gen::<f64>() < settings.silent_failure_rate,
        )
    };
    tokio::time::sleep(Duration::from_secs_f64(delay)).await;

    if !failed {
        return reverse(&body).into_response();
    }
    if !silent {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    // drop the connection without an answer
    panic!("silent failure");
}

fn reverse(text: &str) -> String {
    text.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_reverses() {
        assert_eq!(reverse("hello"), "olleh");
        assert_eq!(reverse(""), "");
    }
}
