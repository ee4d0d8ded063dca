//! Error types for the resource broker
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the resource broker
#[derive(Error, Debug)]
pub enum Error {
    /// A monitor for this resource already exists
    #[error("Resource already monitored: {0}")]
    AlreadyMonitored(String),

    /// No monitor exists for this resource
    #[error("Resource not monitored: {0}")]
    NotFound(String),

    /// The device-level presence subscription could not be established
    #[error("Presence subscription failed: {0}")]
    SubscriptionFailed(String),

    /// A liveness probe did not complete in time
    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),

    /// A liveness probe failed at the transport level
    #[error("Probe error: {0}")]
    Probe(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No async runtime available to drive probes and timers
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "already monitored" error
    pub fn already_monitored(msg: impl Into<String>) -> Self {
        Self::AlreadyMonitored(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a subscription failure error
    pub fn subscription_failed(msg: impl Into<String>) -> Self {
        Self::SubscriptionFailed(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn is_already_monitored(&self) -> bool {
        matches!(self, Self::AlreadyMonitored(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_subscription_failed(&self) -> bool {
        matches!(self, Self::SubscriptionFailed(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
