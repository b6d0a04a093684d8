// Error taxonomy for the extraction engine.
//
// Transient failures are absorbed where they occur (retry, rate decrease,
// breaker). Permanent per-request failures are persisted in the request log,
// not raised. Only configuration, plan-drift, exhausted-storage, and
// cancellation errors propagate to the coordinator.

use thiserror::Error;

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Malformed endpoint catalog or CLI arguments. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted tasks were planned with different inputs. Fatal unless the
    /// caller explicitly approves a re-plan.
    #[error("plan drift: {0}")]
    PlanDrift(String),

    /// Connect/read timeout, 429 or 5xx. Recovered locally by retry and
    /// rate adjustment; surfaces only when retries are exhausted.
    #[error("transient HTTP failure: {0}")]
    TransientHttp(String),

    /// 4xx other than 429. Recorded in the request log, never retried.
    #[error("permanent HTTP failure: status {status}")]
    PermanentHttp { status: u16 },

    /// Response body could not be decoded for pagination metadata.
    #[error("response parse failure: {0}")]
    Parse(String),

    /// Database failure. The writer retries with backoff; exhaustion is fatal.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The endpoint's circuit breaker is open; the request was not attempted.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// Cooperative cancellation. Not an error condition per se, but the run
    /// terminates non-zero so operators know it did not finish.
    #[error("run cancelled")]
    Cancelled,
}

impl ExtractError {
    /// Process exit code for errors that reach main. DONE exits 0 elsewhere.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExtractError::Config(_) => 1,
            ExtractError::PlanDrift(_) => 2,
            ExtractError::Storage(_) => 3,
            ExtractError::Cancelled => 130,
            // Non-fatal kinds never reach main; if one does, treat it as a
            // generic failure rather than masking it as success.
            _ => 4,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtractError::Cancelled)
    }
}
