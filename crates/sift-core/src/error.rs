use std::time::Duration;

use thiserror::Error;

use crate::models::FailureReason;

/// Application-wide error types for Sift.
#[derive(Error, Debug)]
pub enum AppError {
    /// A single structured-data block could not be parsed.
    #[error("Malformed signal in {source_kind}: {message}")]
    MalformedSignal {
        source_kind: &'static str,
        message: String,
    },

    /// Content distillation produced nothing usable.
    #[error("Distillation error: {0}")]
    DistillationError(String),

    /// The hydration collaborator returned an error.
    #[error("Hydration error (HTTP {status_code}): {message}")]
    HydrationError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// The hydration collaborator answered, but not with a usable JSON record.
    #[error("Malformed hydration response: {0}")]
    MalformedResponse(String),

    /// Record does not match the target schema.
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// Record schema could not be loaded or compiled.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// A single document could not be read.
    #[error("Document error: {0}")]
    DocumentError(String),

    /// The corpus could not be enumerated at all.
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Processing was cancelled before the document finished.
    #[error("Cancelled before completion")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::Cancelled => true,
            AppError::HydrationError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Reason code recorded when this error ends a document's run.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AppError::HydrationError { .. }
            | AppError::MalformedResponse(_)
            | AppError::SerializationError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::NetworkError(_)
            | AppError::HttpError(_) => FailureReason::HydrationFailure,
            AppError::SchemaValidationError(_) => FailureReason::ValidationFailure,
            AppError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::ExtractionFailure,
        }
    }
}
