use thiserror::Error;

/// Errors raised while running the agent or evaluating its response
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HarnessError {
    /// A required configuration key is absent or empty
    #[error("Required configuration '{0}' is not set")]
    ConfigurationMissing(String),

    /// The credential was rejected or could not be obtained
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The chat completion service failed or could not be reached
    #[error("Chat completion service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service rejected the request as malformed
    #[error("Invalid chat completion request: {0}")]
    InvalidRequest(String),

    /// The judge model backing an evaluator could not be reached
    #[error("Evaluator '{evaluator}' unavailable: {reason}")]
    EvaluatorUnavailable { evaluator: String, reason: String },

    /// The judge model returned output that could not be scored
    #[error("Evaluator '{evaluator}' failed: {reason}")]
    EvaluationFailed { evaluator: String, reason: String },

    /// Reading or writing the reporting store failed
    #[error("Reporting store error: {0}")]
    Storage(String),
}

impl HarnessError {
    /// Whether the error is scoped to a single evaluator and must be absorbed
    /// into the result set instead of aborting the run
    pub fn is_evaluator_scoped(&self) -> bool {
        matches!(
            self,
            HarnessError::EvaluatorUnavailable { .. } | HarnessError::EvaluationFailed { .. }
        )
    }

    /// Whether retrying the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, HarnessError::ServiceUnavailable(_))
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Storage(err.to_string())
    }
}
