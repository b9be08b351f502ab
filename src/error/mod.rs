use std::time::Duration;

use thiserror::Error;

/// Errors produced by queue construction, startup and item ingestion.
///
/// Construction errors fall into two classes: [`QueueError::InvalidConfiguration`]
/// is fatal and never retried, every other variant returned by a constructor is
/// treated as transient by the delayed starter.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The requested queue type or its configuration payload is wrong.
    #[error("Invalid configuration for queue type {queue_type}: {reason}")]
    InvalidConfiguration { queue_type: String, reason: String },

    /// The backend resource is temporarily unavailable (expected during warm-up).
    #[error("resource temporarily unavailable")]
    Unavailable,

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The construction deadline elapsed before the backend could be created.
    #[error("Timed out after {timeout:?} creating queue {queue_type} for {name}")]
    StartTimeout {
        queue_type: String,
        name: String,
        timeout: Duration,
    },

    /// The configured attempt budget was used up.
    #[error("Unable to create queue {queue_type} for {name} after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        queue_type: String,
        name: String,
        attempts: u32,
        last_error: String,
    },

    /// A shutdown was requested while the backend was still being constructed.
    #[error("Startup of queue {name} cancelled by shutdown")]
    StartCancelled { name: String },

    /// A pushed item does not match the exemplar supplied at creation.
    #[error("Unable to assign data {item} to same type as exemplar {exemplar} in {name}")]
    ShapeMismatch {
        name: String,
        item: String,
        exemplar: String,
    },

    /// The queue no longer accepts items.
    #[error("Queue {0} is closed")]
    Closed(String),

    /// `run` was called more than once.
    #[error("Queue {0} is already running")]
    AlreadyRunning(String),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Build an invalid configuration error.
    pub fn invalid_configuration(queue_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            queue_type: queue_type.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying construction can never succeed.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Whether this error is the expected "temporarily unavailable" sentinel.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable => true,
            Self::Redis(e) => e.kind() == redis::ErrorKind::BusyLoadingError,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration { .. } => "invalid_configuration",
            Self::Unavailable => "unavailable",
            Self::Backend(_) => "backend",
            Self::StartTimeout { .. } => "timeout",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
            Self::StartCancelled { .. } => "cancelled",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Closed(_) => "closed",
            Self::AlreadyRunning(_) => "already_running",
            Self::Redis(_) => "redis",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
