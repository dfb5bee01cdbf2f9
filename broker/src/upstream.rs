//! Upstream API adapters.
//!
//! The upstream contract deliberately admits three outcomes: a response
//! body (any status - interpretation is not the broker's business), a
//! locally observed failure, or silence. Silence mimics a remote API not
//! answering at all and must produce no event on the processor side; the
//! timeout policy deals with it.

use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Result of one upstream invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream returned a body.
    Response(String),
    /// Reaching the upstream failed locally.
    Failure(String),
    /// No response at all.
    Silent,
}

/// One upstream invocation per call; implementations decide how.
pub trait UpstreamApi: Send + Sync {
    /// Send the request payload upstream and report the outcome.
    ///
    /// Outcomes are data, never errors: the processor turns them into
    /// events (or, for [`Outcome::Silent`], into nothing).
    fn process(&self, request: &str) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>>;
}

/// Mock upstream with configurable misbehavior.
///
/// Serves demonstration and load-shaping purposes: like a real flaky API it
/// can answer, fail verbosely, or say nothing at all, after a random delay.
pub struct MockApi {
    failure_rate: f64,
    silent_failure_rate: f64,
    min_latency: f64,
    max_latency: f64,
}

impl MockApi {
    /// Configure the mock's behavior. Rates are in `0.0..=1.0`, latencies
    /// in seconds.
    #[must_use]
    pub const fn new(
        failure_rate: f64,
        silent_failure_rate: f64,
        min_latency: f64,
        max_latency: f64,
    ) -> Self {
        Self {
            failure_rate,
            silent_failure_rate,
            min_latency,
            max_latency,
        }
    }
}

impl UpstreamApi for MockApi {
    fn process(&self, _request: &str) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
        // sample before the future so the rng never crosses an await
        let mut rng = rand::thread_rng();
        let spread = (self.max_latency - self.min_latency).max(0.0);
        let delay = (self.min_latency + rng.gen::<f64>() * spread).max(0.0);
        let failed = rng.gen::<f64>() < self.failure_rate;
        let silent = rng.gen::<f64>() < self.silent_failure_rate;

        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            if !failed {
                Outcome::Response("response".to_string())
            } else if silent {
                Outcome::Silent
            } else {
                Outcome::Failure("failure".to_string())
            }
        })
    }
}

/// HTTP client adapter for a remote upstream.
///
/// POSTs the payload to `{base_url}/api`. A transport-level error counts as
/// silence (the remote never answered); a non-200 status is a failure with
/// the status line as its description.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Adapter for the upstream reachable under `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl UpstreamApi for HttpApi {
    fn process(&self, request: &str) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
        let url = format!("{}/api", self.base_url);
        let body = request.to_string();
        Box::pin(async move {
            let response = match self
                .client
                .post(&url)
                .header("content-type", "application/x-www-form-urlencoded")
                .body(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    // no response at all
                    debug!(%error, "upstream transport error");
                    return Outcome::Silent;
                }
            };

            if response.status() != reqwest::StatusCode::OK {
                return Outcome::Failure(response.status().to_string());
            }

            match response.text().await {
                Ok(text) if !text.is_empty() => Outcome::Response(text),
                _ => Outcome::Failure("empty response body from API".to_string()),
            }
        })
    }
}

/// Deterministic upstream for tests: answers with a scripted sequence of
/// outcomes, then with silence once the script runs dry.
pub struct ScriptedApi {
    outcomes: Mutex<VecDeque<Outcome>>,
}

impl ScriptedApi {
    /// Script the outcomes, in invocation order.
    #[must_use]
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

impl UpstreamApi for ScriptedApi {
    fn process(&self, _request: &str) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or(Outcome::Silent);
        Box::pin(async move { outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_api_always_answers_with_zero_failure_rates() {
        let api = MockApi::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(
            api.process("anything").await,
            Outcome::Response("response".to_string())
        );
    }

    #[tokio::test]
    async fn mock_api_always_fails_with_full_failure_rate() {
        let api = MockApi::new(1.0, 0.0, 0.0, 0.0);
        assert_eq!(
            api.process("anything").await,
            Outcome::Failure("failure".to_string())
        );
    }

    #[tokio::test]
    async fn mock_api_goes_silent_when_both_rates_are_full() {
        let api = MockApi::new(1.0, 1.0, 0.0, 0.0);
        assert_eq!(api.process("anything").await, Outcome::Silent);
    }

    #[tokio::test]
    async fn scripted_api_replays_its_script_then_goes_silent() {
        let api = ScriptedApi::new([
            Outcome::Failure("first".to_string()),
            Outcome::Response("second".to_string()),
        ]);
        assert_eq!(api.process("x").await, Outcome::Failure("first".to_string()));
        assert_eq!(api.process("x").await, Outcome::Response("second".to_string()));
        assert_eq!(api.process("x").await, Outcome::Silent);
    }
}
