use crate::taxonomy::ErrorCategory;

/// Top-level error type for the WIMI workspace.
///
/// Variants follow the failure taxonomy used by the resilience manager so
/// every error can be classified without string matching.
#[derive(Debug, thiserror::Error)]
pub enum WimiError {
    /// A plan, agent, or approval request does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-swap transition saw a different status than expected.
    #[error("State conflict on {plan_id}: expected {expected}, found {actual}")]
    StateConflict {
        /// Plan whose context was being transitioned.
        plan_id: String,
        /// Status the caller expected.
        expected: String,
        /// Status actually stored.
        actual: String,
    },

    /// The operation is not legal for the current workflow or approval state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A sequence or payload failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller supplied unusable input.
    #[error("User input error: {0}")]
    UserInput(String),

    /// A deadline elapsed (approval window or step timeout).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An agent run failed.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An external integration could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Resource exhaustion (memory, handles, quotas).
    #[error("Resource error: {0}")]
    Resource(String),

    /// Internal failure of the orchestration runtime.
    #[error("System error: {0}")]
    System(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Persistence backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WimiError {
    /// Map this error onto the failure taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            WimiError::Agent(_) => ErrorCategory::AgentFailure,
            WimiError::Timeout(_) => ErrorCategory::Timeout,
            WimiError::Validation(_) | WimiError::Json(_) => ErrorCategory::Validation,
            WimiError::UserInput(_) | WimiError::NotFound(_) => ErrorCategory::UserInput,
            WimiError::Network(_) => ErrorCategory::Network,
            WimiError::Resource(_) => ErrorCategory::Resource,
            WimiError::StateConflict { .. }
            | WimiError::InvalidState(_)
            | WimiError::System(_)
            | WimiError::Config(_)
            | WimiError::Store(_)
            | WimiError::Io(_) => ErrorCategory::System,
        }
    }

    /// Build an error of the given category carrying `message`.
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        match category {
            ErrorCategory::AgentFailure => WimiError::Agent(message),
            ErrorCategory::Timeout => WimiError::Timeout(message),
            ErrorCategory::Validation => WimiError::Validation(message),
            ErrorCategory::Resource => WimiError::Resource(message),
            ErrorCategory::Network => WimiError::Network(message),
            ErrorCategory::System => WimiError::System(message),
            ErrorCategory::UserInput | ErrorCategory::UserCancelled => {
                WimiError::UserInput(message)
            }
        }
    }
}

/// A convenience `Result` alias using [`WimiError`].
pub type WimiResult<T> = Result<T, WimiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conflict_display() {
        let err = WimiError::StateConflict {
            plan_id: "plan_1".into(),
            expected: "executing".into(),
            actual: "failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "State conflict on plan_1: expected executing, found failed"
        );
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            WimiError::Network("down".into()).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            WimiError::InvalidState("resolved".into()).category(),
            ErrorCategory::System
        );
        assert_eq!(
            WimiError::from_category(ErrorCategory::Timeout, "late").category(),
            ErrorCategory::Timeout
        );
    }
}
