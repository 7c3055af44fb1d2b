use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the fallible crate APIs (configuration validation,
/// persisted-state fixup, registration lookup). Protocol staleness is never
/// an error: stale messages are silently dropped by the engine.
#[derive(Debug, Error)]
pub enum ReconfigError {
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Persisted state corrupt: {message}")]
    PersistedStateCorrupt { message: String },

    #[error("Service type registration not found: {service_type}")]
    RegistrationNotFound { service_type: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ReconfigError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn persisted_state<S: Into<String>>(message: S) -> Self {
        Self::PersistedStateCorrupt {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

pub type ReconfigResult<T> = Result<T, ReconfigError>;

/// Status code carried by message bodies. Replies from the replicator proxy
/// and the failover manager report outcomes as values, not as transport
/// failures; the engine inspects them to decide staleness, retry, or
/// escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErrorCode {
    #[default]
    Success,
    /// The addressed entity does not exist on the sender.
    NotFound,
    /// The failover manager no longer tracks this failover unit.
    FailoverUnitNotFound,
    /// A cancel-catchup raced an already-completed demote on the proxy.
    DemoteCompleted,
    /// The proxy changed replica state while handling data loss; the reply
    /// carries the data-loss catchup point.
    StateChangedOnDataLoss,
    /// Generic retriable failure from the host.
    OperationFailed,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    pub fn is_error(self, other: ErrorCode) -> bool {
        self == other && !self.is_success()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_success() {
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::NotFound.is_success());
        assert!(ErrorCode::NotFound.is_error(ErrorCode::NotFound));
        assert!(!ErrorCode::Success.is_error(ErrorCode::Success));
    }

    #[test]
    fn test_error_constructors() {
        let err = ReconfigError::configuration("bad threshold");
        assert!(err.to_string().contains("bad threshold"));

        let err = ReconfigError::internal("broken");
        assert!(matches!(err, ReconfigError::InternalError { .. }));
    }
}
