//! Bus Error Types
//!
//! Error handling for message delivery, admission control, actor lifecycle
//! misuse and bus shutdown.

use std::sync::Arc;
use thiserror::Error;

/// Main bus error type
///
/// Every variant is cheaply cloneable: completion cells hand the same
/// result to any number of awaiters.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// A registered handler returned an error or panicked
    #[error("Handler error: {message_type}: {cause:#}")]
    Handler {
        message_type: String,
        cause: Arc<anyhow::Error>,
    },

    /// Admission control dropped the submission as a duplicate in-flight key
    #[error("Deduplicated: key {key} already in flight")]
    Deduplicated { key: String },

    /// The unit of work behind a task was aborted before finishing
    #[error("Cancelled: {message_type}")]
    Cancelled { message_type: String },

    /// The dispatcher no longer accepts submissions
    #[error("Dispatcher stopped: {operation} rejected")]
    Stopped { operation: String },

    /// Actor start/stop called in the wrong state
    #[error("Lifecycle error: actor {actor}: {message}")]
    Lifecycle { actor: String, message: String },

    /// Actor declared an unusable set of accepted message types
    #[error("Invalid declaration: actor {actor}: {message}")]
    InvalidDeclaration { actor: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Runtime-level errors
    #[error("System error: {message}")]
    System { message: String },
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create a handler error from whatever the handler returned
    pub fn handler(message_type: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Handler {
            message_type: message_type.into(),
            cause: Arc::new(cause),
        }
    }

    /// Create a deduplication error
    pub fn deduplicated(key: impl Into<String>) -> Self {
        Self::Deduplicated { key: key.into() }
    }

    /// Create a cancellation error
    pub fn cancelled(message_type: impl Into<String>) -> Self {
        Self::Cancelled {
            message_type: message_type.into(),
        }
    }

    /// Create a stopped error
    pub fn stopped(operation: impl Into<String>) -> Self {
        Self::Stopped {
            operation: operation.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// Create an invalid declaration error
    pub fn invalid_declaration(actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a system error
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// The error a failing handler produced, for downcasting
    pub fn handler_cause(&self) -> Option<&anyhow::Error> {
        match self {
            BusError::Handler { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Check if resubmitting the same message could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Deduplicated { .. } | BusError::System { .. }
        )
    }

    /// Check if this is a programmer error that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::Lifecycle { .. }
                | BusError::InvalidDeclaration { .. }
                | BusError::Configuration { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            BusError::Handler { .. } => "handler",
            BusError::Deduplicated { .. } => "deduplicated",
            BusError::Cancelled { .. } => "cancelled",
            BusError::Stopped { .. } => "stopped",
            BusError::Lifecycle { .. } => "lifecycle",
            BusError::InvalidDeclaration { .. } => "invalid_declaration",
            BusError::Configuration { .. } => "configuration",
            BusError::System { .. } => "system",
        }
    }
}
