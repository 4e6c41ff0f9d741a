//! Failure taxonomy shared by the resilience manager, the state machine and
//! telemetry.

use serde::{Deserialize, Serialize};

/// Class of failure an error event is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// An agent returned an error or crashed.
    AgentFailure,
    /// An approval window or step deadline elapsed.
    Timeout,
    /// A sequence, payload or output failed validation.
    Validation,
    /// Memory, quota or handle exhaustion.
    Resource,
    /// An external integration could not be reached.
    Network,
    /// Internal runtime failure.
    System,
    /// Unusable input from the caller.
    UserInput,
    /// The plan was cancelled by its owner.
    UserCancelled,
}

impl ErrorCategory {
    /// Fixed category → severity mapping.
    pub fn severity(self) -> Severity {
        match self {
            ErrorCategory::Resource | ErrorCategory::System => Severity::Critical,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::AgentFailure => {
                Severity::High
            }
            ErrorCategory::Validation | ErrorCategory::UserInput => Severity::Medium,
            ErrorCategory::UserCancelled => Severity::Low,
        }
    }

    /// Categories for which a fixture substitution may be considered.
    pub fn is_external_service_failure(self) -> bool {
        matches!(self, ErrorCategory::AgentFailure | ErrorCategory::Network)
    }

    /// Categories reported back to the caller without escalating the workflow.
    pub fn is_locally_resolved(self) -> bool {
        matches!(self, ErrorCategory::Validation | ErrorCategory::UserInput)
    }

    /// Parse the wire name (`"NETWORK"`, `"network"`, `"agent_failure"`...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "agent_failure" => Some(ErrorCategory::AgentFailure),
            "timeout" => Some(ErrorCategory::Timeout),
            "validation" => Some(ErrorCategory::Validation),
            "resource" => Some(ErrorCategory::Resource),
            "network" => Some(ErrorCategory::Network),
            "system" => Some(ErrorCategory::System),
            "user_input" => Some(ErrorCategory::UserInput),
            "user_cancelled" => Some(ErrorCategory::UserCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::AgentFailure => "AGENT_FAILURE",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::UserInput => "USER_INPUT",
            ErrorCategory::UserCancelled => "USER_CANCELLED",
        };
        f.write_str(name)
    }
}

/// Severity attached to errors and telemetry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational or user-initiated.
    Low,
    /// Resolved locally, reported to the caller.
    Medium,
    /// Escalated; may abort the step.
    High,
    /// Escalated; always fails the workflow.
    Critical,
}

impl Severity {
    /// Whether this severity notifies the escalation channel.
    pub fn escalates(self) -> bool {
        self >= Severity::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(ErrorCategory::Resource.severity(), Severity::Critical);
        assert_eq!(ErrorCategory::System.severity(), Severity::Critical);
        assert_eq!(ErrorCategory::Network.severity(), Severity::High);
        assert_eq!(ErrorCategory::Timeout.severity(), Severity::High);
        assert_eq!(ErrorCategory::AgentFailure.severity(), Severity::High);
        assert_eq!(ErrorCategory::Validation.severity(), Severity::Medium);
        assert_eq!(ErrorCategory::UserInput.severity(), Severity::Medium);
        assert_eq!(ErrorCategory::UserCancelled.severity(), Severity::Low);
    }

    #[test]
    fn test_escalation_threshold() {
        assert!(Severity::Critical.escalates());
        assert!(Severity::High.escalates());
        assert!(!Severity::Medium.escalates());
        assert!(!Severity::Low.escalates());
    }

    #[test]
    fn test_category_wire_format() {
        let json = serde_json::to_string(&ErrorCategory::AgentFailure).unwrap();
        assert_eq!(json, "\"AGENT_FAILURE\"");
        assert_eq!(ErrorCategory::parse("network"), Some(ErrorCategory::Network));
        assert_eq!(ErrorCategory::parse("USER_CANCELLED"), Some(ErrorCategory::UserCancelled));
        assert_eq!(ErrorCategory::parse("bogus"), None);
        assert_eq!(ErrorCategory::UserInput.to_string(), "USER_INPUT");
    }
}
