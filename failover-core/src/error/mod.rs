//! Error types for the failover engine
//!
//! Only a few paths actually return errors: loading configuration, decoding
//! records at the transport boundary, spawning a child process and handing a
//! message to the cluster link. Everything that happens after a message has
//! been accepted (protocol anomalies, failed scripts, failed fencing, audit
//! findings) is logged and absorbed by the engine instead.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Configuration        │  Protocol            │  Execution    │
//! │  • Config / parse     │  • Missing field     │  • Spawn      │
//! │  • Validation         │  • Unknown class     │  • Link send  │
//! │                       │  • Bad record        │  • IO         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod constructors;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FailoverError {
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("Message of type '{message_type}' is missing field '{field}'")]
    MissingField { message_type: String, field: String },

    #[error("Malformed cluster record: {reason}")]
    MalformedRecord { reason: String },

    #[error("Failed to spawn child for '{purpose}'")]
    Spawn {
        purpose: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Cluster link error: {message}")]
    Link { message: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Node driver stopped: {reason}")]
    DriverStopped { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FailoverError>;
pub type FailoverResult<T> = std::result::Result<T, FailoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = FailoverError::MissingField {
            message_type: "resource".to_string(),
            field: "rsc_hold".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Message of type 'resource' is missing field 'rsc_hold'"
        );

        let err = FailoverError::spawn(
            "req_our_resources",
            std::io::Error::new(std::io::ErrorKind::Other, "fork failed"),
        );
        assert!(err.to_string().contains("req_our_resources"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FailoverError = io.into();
        assert!(matches!(err, FailoverError::IoError(_)));
    }
}
