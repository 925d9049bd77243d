//! Constructor helpers for FailoverError

use super::FailoverError;

impl FailoverError {
    /// Create a configuration error for a specific component
    ///
    /// ```rust
    /// use failover_core::error::FailoverError;
    ///
    /// let err = FailoverError::configuration("timing.standby_request_timeout", "must be non-zero");
    /// assert!(err.to_string().contains("standby_request_timeout"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        FailoverError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a missing-field decode error
    pub fn missing_field(message_type: impl Into<String>, field: impl Into<String>) -> Self {
        FailoverError::MissingField {
            message_type: message_type.into(),
            field: field.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        FailoverError::MalformedRecord {
            reason: reason.into(),
        }
    }

    /// Create a spawn error with a boxed source
    pub fn spawn<E: std::error::Error + Send + Sync + 'static>(
        purpose: impl Into<String>,
        source: E,
    ) -> Self {
        FailoverError::Spawn {
            purpose: purpose.into(),
            source: Box::new(source),
        }
    }

    pub fn link(message: impl Into<String>) -> Self {
        FailoverError::Link {
            message: message.into(),
        }
    }

    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        FailoverError::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}
