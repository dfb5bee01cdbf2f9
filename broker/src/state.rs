//! Per-request state, reconstructed from the event stream alone.
//!
//! A request's history is the list of attempt-related events sharing its id
//! as causation. Folding that history into a [`RequestData`] yields the
//! same state no matter where the fold starts, which is what makes cold
//! restarts of the processor and independent observers agree.

use courier_core::{Envelope, Event};
use std::collections::HashMap;
use std::fmt;
use tracing::error;

/// State of a single upstream attempt, and of a request as a whole.
///
/// Per attempt, `Success`, `Failure` and `Timeout` are final; for the whole
/// request, `Failure` and `Timeout` are only final once no further attempt
/// remains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    /// No attempt has been issued for this slot yet.
    Initial,
    /// The attempt has been dispatched and awaits an outcome.
    Pending,
    /// The upstream produced a response.
    Success,
    /// The upstream call failed locally.
    Failure,
    /// The attempt's timeout elapsed without an outcome.
    Timeout,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Initial => "initial",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

/// Working data for one in-flight request.
///
/// The attempts vector is sized to the retry budget in effect when the
/// request was first seen; everything else is derived from it.
#[derive(Clone, Debug)]
pub struct RequestData {
    envelope: Envelope,
    attempts: Vec<AttemptState>,
}

impl RequestData {
    /// Create the record for a freshly seen request, sized to `retries + 1`
    /// attempts.
    #[must_use]
    pub fn new(envelope: Envelope, retries: usize) -> Self {
        Self {
            envelope,
            attempts: vec![AttemptState::Initial; retries + 1],
        }
    }

    /// Id of the originating request event; the causation id of every
    /// event belonging to this request.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.envelope.id
    }

    /// The client-submitted payload.
    #[must_use]
    pub fn request(&self) -> &str {
        match &self.envelope.event {
            Event::Request { request } => request,
            // the constructors only wrap request events
            _ => "",
        }
    }

    /// Retry budget for this request.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.attempts.len() - 1
    }

    /// State of one attempt slot.
    #[must_use]
    pub fn attempt(&self, index: usize) -> Option<AttemptState> {
        self.attempts.get(index).copied()
    }

    /// Record a state for an attempt slot; `false` when the index is out of
    /// the request's budget.
    pub fn set_attempt(&mut self, index: usize, state: AttemptState) -> bool {
        match self.attempts.get_mut(index) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    /// Whether any attempt succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.attempts.contains(&AttemptState::Success)
    }

    /// Index of the next attempt slot to use: the count of slots already
    /// touched.
    #[must_use]
    pub fn next_attempt(&self) -> usize {
        self.attempts
            .iter()
            .take_while(|state| **state != AttemptState::Initial)
            .count()
    }

    /// Overall state of the request.
    ///
    /// Scans the slots left to right: an untouched slot means the outcome
    /// is still open (`Pending`); any `Success` wins immediately; otherwise
    /// the last touched slot decides.
    #[must_use]
    pub fn state(&self) -> AttemptState {
        let mut result = AttemptState::Pending;
        for attempt in &self.attempts {
            match attempt {
                AttemptState::Initial => return AttemptState::Pending,
                AttemptState::Success => return AttemptState::Success,
                AttemptState::Pending | AttemptState::Failure | AttemptState::Timeout => {
                    result = *attempt;
                }
            }
        }
        result
    }
}

/// Locate the request a follow-up event belongs to, via its causation id.
pub(crate) fn locate<'a>(
    requests: &'a mut HashMap<i32, RequestData>,
    envelope: &Envelope,
) -> Option<&'a mut RequestData> {
    if envelope.causation_id == 0 {
        error!(id = envelope.id, "event lacks a causation ID to locate the request");
        return None;
    }
    let request = requests.get_mut(&envelope.causation_id);
    if request.is_none() {
        error!(
            causation_id = envelope.causation_id,
            "failed to locate request data"
        );
    }
    request
}

/// Pure fold of the event stream into per-request state.
///
/// This is the reference reconstruction: applied to the full history of a
/// request it yields the same classification the live processor held.
/// [`crate::observer::RequestWatcher`] is a thin logging shell around it.
#[derive(Default)]
pub struct RequestProjection {
    retries: usize,
    requests: HashMap<i32, RequestData>,
}

impl RequestProjection {
    /// Empty projection; the retry budget starts at zero until a
    /// configuration event says otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one envelope into the projection.
    ///
    /// Returns the id of the affected request, if the event belonged to
    /// one, so callers can log or inspect the transition.
    pub fn apply(&mut self, envelope: &Envelope) -> Option<i32> {
        match envelope.event {
            Event::Configuration { retries, .. } => {
                if let Ok(retries) = usize::try_from(retries) {
                    self.retries = retries;
                }
                None
            }
            Event::Request { .. } => {
                let id = envelope.id;
                self.requests
                    .insert(id, RequestData::new(envelope.clone(), self.retries));
                Some(id)
            }
            Event::ApiRequest { attempt } => {
                self.transition(envelope, attempt, AttemptState::Pending)
            }
            Event::ApiResponse { attempt, .. } => {
                self.transition(envelope, attempt, AttemptState::Success)
            }
            Event::ApiFailure { attempt, .. } => {
                self.transition(envelope, attempt, AttemptState::Failure)
            }
            Event::ApiTimeout { attempt } => {
                let request = locate(&mut self.requests, envelope)?;
                // a timeout only voids a pending attempt; response and
                // failure outcomes are final
                if request.attempt(attempt) == Some(AttemptState::Pending) {
                    request.set_attempt(attempt, AttemptState::Timeout);
                }
                Some(request.id())
            }
            Event::Simple { .. } => None,
        }
    }

    fn transition(
        &mut self,
        envelope: &Envelope,
        attempt: usize,
        state: AttemptState,
    ) -> Option<i32> {
        let request = locate(&mut self.requests, envelope)?;
        if !request.set_attempt(attempt, state) {
            error!(attempt, "attempt index outside the request's budget");
        }
        Some(request.id())
    }

    /// Overall state of a request, when it is known to the projection.
    #[must_use]
    pub fn state_of(&self, request_id: i32) -> Option<AttemptState> {
        self.requests.get(&request_id).map(RequestData::state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn request_envelope(id: i32) -> Envelope {
        Envelope {
            id,
            external_uuid: Uuid::nil(),
            created: Utc::now(),
            causation_id: 0,
            event: Event::Request {
                request: "payload".to_string(),
            },
        }
    }

    fn data(states: &[AttemptState]) -> RequestData {
        let mut data = RequestData::new(request_envelope(1), states.len() - 1);
        for (index, state) in states.iter().enumerate() {
            data.set_attempt(index, *state);
        }
        data
    }

    use AttemptState::{Failure, Initial, Pending, Success, Timeout};

    #[test]
    fn fresh_request_is_pending() {
        let data = RequestData::new(request_envelope(1), 2);
        assert_eq!(data.state(), Pending);
        assert_eq!(data.next_attempt(), 0);
        assert_eq!(data.retries(), 2);
        assert!(!data.succeeded());
    }

    #[test]
    fn any_success_wins_overall() {
        assert_eq!(data(&[Failure, Success]).state(), Success);
        assert_eq!(data(&[Timeout, Success]).state(), Success);
        assert_eq!(data(&[Success, Timeout]).state(), Success);
        assert!(data(&[Failure, Success]).succeeded());
    }

    #[test]
    fn untouched_slot_keeps_the_outcome_open() {
        assert_eq!(data(&[Failure, Initial]).state(), Pending);
        assert_eq!(data(&[Timeout, Initial, Initial]).state(), Pending);
    }

    #[test]
    fn last_touched_slot_decides_without_success() {
        assert_eq!(data(&[Failure, Timeout]).state(), Timeout);
        assert_eq!(data(&[Timeout, Failure]).state(), Failure);
        assert_eq!(data(&[Failure, Pending]).state(), Pending);
    }

    #[test]
    fn next_attempt_counts_touched_slots() {
        assert_eq!(data(&[Failure, Initial, Initial]).next_attempt(), 1);
        assert_eq!(data(&[Failure, Timeout, Initial]).next_attempt(), 2);
        assert_eq!(data(&[Failure, Timeout, Pending]).next_attempt(), 3);
    }

    #[test]
    fn set_attempt_rejects_out_of_budget_indexes() {
        let mut data = RequestData::new(request_envelope(1), 0);
        assert!(data.set_attempt(0, Pending));
        assert!(!data.set_attempt(1, Pending));
    }

    fn follow_up(id: i32, causation_id: i32, event: Event) -> Envelope {
        Envelope {
            id,
            external_uuid: Uuid::nil(),
            created: Utc::now(),
            causation_id,
            event,
        }
    }

    #[test]
    fn projection_folds_a_retried_request() {
        let mut projection = RequestProjection::new();
        projection.apply(&follow_up(
            1,
            0,
            Event::Configuration {
                retries: 1,
                timeout: 5.0,
            },
        ));
        projection.apply(&request_envelope(2));
        projection.apply(&follow_up(3, 2, Event::ApiRequest { attempt: 0 }));
        projection.apply(&follow_up(
            4,
            2,
            Event::ApiFailure {
                attempt: 0,
                failure: "net".to_string(),
            },
        ));
        assert_eq!(projection.state_of(2), Some(Pending));

        projection.apply(&follow_up(5, 2, Event::ApiRequest { attempt: 1 }));
        assert_eq!(projection.state_of(2), Some(Pending));

        projection.apply(&follow_up(
            6,
            2,
            Event::ApiResponse {
                attempt: 1,
                response: "ok".to_string(),
            },
        ));
        assert_eq!(projection.state_of(2), Some(Success));
    }

    #[test]
    fn projection_ignores_timeout_after_final_outcome() {
        let mut projection = RequestProjection::new();
        projection.apply(&request_envelope(1));
        projection.apply(&follow_up(2, 1, Event::ApiRequest { attempt: 0 }));
        projection.apply(&follow_up(
            3,
            1,
            Event::ApiResponse {
                attempt: 0,
                response: "ok".to_string(),
            },
        ));
        projection.apply(&follow_up(4, 1, Event::ApiTimeout { attempt: 0 }));
        assert_eq!(projection.state_of(1), Some(Success));
    }
}
