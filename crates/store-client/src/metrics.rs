//! Client metrics
//!
//! - `api_requests_total` (counter): label `status`
//! - `api_token_refresh_total` (counter): label `outcome`
//! - `api_requests_replayed_total` (counter)
//!
//! Without an installed recorder these calls are no-ops.

/// How a refresh cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    /// Credentials cleared, re-login required.
    Terminal,
    /// Network or server error, credentials left in place.
    Transient,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Success => "success",
            RefreshOutcome::Terminal => "terminal",
            RefreshOutcome::Transient => "transient",
        }
    }
}

/// Record a response received from the transport.
pub fn record_response(status: u16) {
    metrics::counter!("api_requests_total", "status" => status.to_string()).increment(1);
}

/// Record the end of a refresh cycle.
pub fn record_refresh(outcome: RefreshOutcome) {
    metrics::counter!("api_token_refresh_total", "outcome" => outcome.label()).increment(1);
}

/// Record a request replayed with a fresh access token.
pub fn record_replay() {
    metrics::counter!("api_requests_replayed_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_response(401);
        record_refresh(RefreshOutcome::Transient);
        record_replay();
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(RefreshOutcome::Success.label(), "success");
        assert_eq!(RefreshOutcome::Terminal.label(), "terminal");
        assert_eq!(RefreshOutcome::Transient.label(), "transient");
    }
}
