//! Central error types for the ec2-operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// Central error type for the ec2-operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The cloud provider rejected or failed a request
    #[error("Cloud provider error during {operation}: {message}")]
    CloudError { operation: String, message: String },

    /// A cloud provider call did not complete within the configured bound
    #[error("Cloud provider {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Store write lost an optimistic-concurrency race too many times
    #[error("Conflicting update on {namespace}/{name} after {attempts} attempts")]
    Conflict {
        namespace: String,
        name: String,
        attempts: u32,
    },

    /// Store is unavailable or refused the write
    #[error("Store error: {0}")]
    StoreError(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Ec2Instance spec validation error
    #[error("Instance validation error: {0}")]
    ValidationError(String),

    /// Resource not found in the cluster
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a cloud error for the named provider operation
    pub fn cloud(operation: &str, message: impl Into<String>) -> Self {
        Error::CloudError {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error type should trigger a retry with backoff
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::ConfigError(_) | Error::ValidationError(_) | Error::SerializationError(_)
        )
    }

    /// Short label used for metrics and log fields
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::CloudError { .. } => "cloud",
            Error::Timeout { .. } => "timeout",
            Error::Conflict { .. } => "conflict",
            Error::StoreError(_) => "store",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::NotFound { .. } => "not_found",
        }
    }
}
