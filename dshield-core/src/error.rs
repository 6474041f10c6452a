//! Error types for DShield MCP operations

use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to resolve secret reference {reference}: {reason}")]
    SecretResolution { reference: String, reason: String },
}

/// Transport-level errors, reported to the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Framing violation: {reason}")]
    Framing { reason: String },

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Authentication required before calling {method}")]
    AuthenticationRequired { method: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Connection closed by peer")]
    ConnectionClosed,
}

/// Tool parameter validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required parameter missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Value for {field} out of range: {value} (expected {min}..={max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid IP address: {value}")]
    InvalidIpAddress { value: String },

    #[error("Invalid domain: {value}")]
    InvalidDomain { value: String },

    #[error("Invalid filter operator: {operator}")]
    InvalidOperator { operator: String },

    #[error("Unknown value for {field}: {value}")]
    UnknownEnumValue { field: String, value: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Cache subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to open cache store: {reason}")]
    Open { reason: String },

    #[error("Cache transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Cache serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Master error type for all DShield MCP errors.
///
/// The variants are the cross-boundary error kinds: everything a tool call
/// can surface to a caller collapses into one of these, each with a stable
/// JSON-RPC code.
#[derive(Debug, Clone, Error)]
pub enum DshieldError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid params: {0}")]
    InvalidParams(#[from] ValidationError),

    #[error("Rate limit exceeded for {scope}")]
    RateLimitExceeded { scope: String },

    #[error("{service} error: {message}")]
    ExternalService { service: String, message: String },

    #[error("Timeout after {elapsed:?} in {operation}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DshieldError {
    /// Construct an external-service error wrapped with the service name.
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        DshieldError::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Construct a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        DshieldError::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Construct an internal error with a sanitized message.
    pub fn internal(message: impl Into<String>) -> Self {
        DshieldError::Internal {
            message: message.into(),
        }
    }

    /// JSON-RPC error code for this error kind.
    pub fn rpc_code(&self) -> i64 {
        match self {
            DshieldError::Transport(TransportError::Framing { .. }) => -32700,
            DshieldError::Transport(TransportError::MessageTooLarge { .. }) => -32600,
            DshieldError::Transport(TransportError::MethodNotFound { .. }) => -32601,
            DshieldError::Transport(_) => -32600,
            DshieldError::InvalidParams(_) => -32602,
            DshieldError::RateLimitExceeded { .. } => -32008,
            DshieldError::Config(_)
            | DshieldError::ExternalService { .. }
            | DshieldError::Timeout { .. }
            | DshieldError::Cache(_)
            | DshieldError::Internal { .. } => -32603,
        }
    }

    /// Whether the operation that produced this error may be retried.
    ///
    /// Only external-service failures are retryable, and only for idempotent
    /// reads; timeouts and rate limits are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DshieldError::ExternalService { .. })
    }
}

/// Result type alias for DShield MCP operations.
pub type DshieldResult<T> = Result<T, DshieldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_codes() {
        let cases: Vec<(DshieldError, i64)> = vec![
            (
                TransportError::Framing {
                    reason: "bad length".into(),
                }
                .into(),
                -32700,
            ),
            (
                TransportError::MethodNotFound {
                    method: "tools/write".into(),
                }
                .into(),
                -32601,
            ),
            (
                ValidationError::RequiredFieldMissing {
                    field: "ip_address".into(),
                }
                .into(),
                -32602,
            ),
            (
                DshieldError::RateLimitExceeded {
                    scope: "connection".into(),
                },
                -32008,
            ),
            (DshieldError::internal("boom"), -32603),
            (DshieldError::external("elasticsearch", "503"), -32603),
        ];
        for (err, code) in cases {
            assert_eq!(err.rpc_code(), code, "wrong code for {err}");
        }
    }

    #[test]
    fn test_retryability() {
        assert!(DshieldError::external("elasticsearch", "connection refused").is_retryable());
        assert!(!DshieldError::timeout("search", Duration::from_secs(30)).is_retryable());
        assert!(!DshieldError::RateLimitExceeded {
            scope: "virustotal".into()
        }
        .is_retryable());
    }
}
