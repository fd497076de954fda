use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by a step's forward or compensation function.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Not found: no '{entry_point}' matching {filters}")]
    NotFound {
        entry_point: String,
        filters: serde_json::Value,
    },

    #[error("{message}")]
    Failed { message: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl StepError {
    /// A precondition did not hold.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// The step's work failed.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }

    /// A read found nothing.
    pub fn not_found(entry_point: impl Into<String>, filters: serde_json::Value) -> Self {
        Self::NotFound {
            entry_point: entry_point.into(),
            filters,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Whether an opt-in retry policy may invoke the forward function again.
    ///
    /// Validation and not-found failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Timeout { .. })
    }

    /// Error kind this failure surfaces as when it aborts a run.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::StepExecution,
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::serialization(e)
    }
}

/// A forward function failure attributed to a graph node.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("step '{node}' failed: {error}")]
pub struct StepFailure {
    /// Node identity of the failing step.
    pub node: String,
    /// The underlying step error.
    pub error: StepError,
}

impl StepFailure {
    pub fn new(node: impl Into<String>, error: StepError) -> Self {
        Self {
            node: node.into(),
            error,
        }
    }
}

/// A compensation function failure attributed to a graph node.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("compensation for step '{node}' failed: {error}")]
pub struct CompensationError {
    /// Node identity whose compensation failed.
    pub node: String,
    /// The underlying step error.
    pub error: StepError,
}

impl CompensationError {
    pub fn new(node: impl Into<String>, error: StepError) -> Self {
        Self {
            node: node.into(),
            error,
        }
    }
}

/// Classification of a [`FlowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    StepExecution,
    Compensation,
    CompositeFailure,
    Definition,
    Store,
    Config,
    InvalidState,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found_error",
            Self::StepExecution => "step_execution_error",
            Self::Compensation => "compensation_error",
            Self::CompositeFailure => "composite_failure",
            Self::Definition => "definition_error",
            Self::Store => "store_error",
            Self::Config => "config_error",
            Self::InvalidState => "invalid_state",
            Self::Serialization => "serialization_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for sagaflow operations.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("{trigger}; rollback halted because {compensation}")]
    CompositeFailure {
        trigger: StepFailure,
        compensation: CompensationError,
    },

    #[error("Invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("Workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("Workflow run {0} not found")]
    RunNotFound(uuid::Uuid),

    #[error("Step '{0}' is already defined")]
    DuplicateStep(String),

    #[error("Workflow '{0}' is already defined")]
    DuplicateWorkflow(String),

    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    #[error("Run store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Step(failure) => failure.error.kind(),
            Self::CompositeFailure { .. } => ErrorKind::CompositeFailure,
            Self::InvalidInput(_) => ErrorKind::Validation,
            Self::UnknownWorkflow(_) | Self::RunNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateStep(_) | Self::DuplicateWorkflow(_) | Self::Definition(_) => {
                ErrorKind::Definition
            }
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// The step failure that aborted the run, if any.
    pub fn trigger(&self) -> Option<&StepFailure> {
        match self {
            Self::Step(failure) => Some(failure),
            Self::CompositeFailure { trigger, .. } => Some(trigger),
            _ => None,
        }
    }

    /// The compensation failure that halted rollback, if any.
    pub fn compensation_error(&self) -> Option<&CompensationError> {
        match self {
            Self::CompositeFailure { compensation, .. } => Some(compensation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Serialization(e.to_string())
    }
}

/// Result type alias using FlowError.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failure_kind_follows_step_error() {
        let validation = FlowError::from(StepFailure::new(
            "validate",
            StepError::validation("order is canceled"),
        ));
        assert_eq!(validation.kind(), ErrorKind::Validation);

        let missing = FlowError::from(StepFailure::new(
            "read-return",
            StepError::not_found("return", serde_json::json!({"id": "ret_1"})),
        ));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let failed = FlowError::from(StepFailure::new("charge", StepError::failed("declined")));
        assert_eq!(failed.kind(), ErrorKind::StepExecution);
    }

    #[test]
    fn test_composite_failure_names_both_errors() {
        let err = FlowError::CompositeFailure {
            trigger: StepFailure::new("step-3", StepError::failed("boom")),
            compensation: CompensationError::new("step-2", StepError::failed("undo failed")),
        };

        assert_eq!(err.kind(), ErrorKind::CompositeFailure);
        let message = err.to_string();
        assert!(message.contains("step-3"));
        assert!(message.contains("step-2"));
        assert_eq!(err.trigger().map(|t| t.node.as_str()), Some("step-3"));
        assert_eq!(
            err.compensation_error().map(|c| c.node.as_str()),
            Some("step-2")
        );
    }

    #[test]
    fn test_not_found_carries_diagnostics() {
        let err = StepError::not_found("customer_address", serde_json::json!({"id": "addr_1"}));
        let message = err.to_string();
        assert!(message.contains("customer_address"));
        assert!(message.contains("addr_1"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StepError::failed("io").is_retryable());
        assert!(StepError::timeout("slow").is_retryable());
        assert!(!StepError::validation("bad").is_retryable());
        assert!(!StepError::cancelled("host abort").is_retryable());
    }

    #[test]
    fn test_step_error_serde_shape() {
        let err = StepError::validation("bad input");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "validation");
        let back: StepError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}
