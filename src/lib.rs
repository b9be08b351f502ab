// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Queue layer
pub mod queue;

// Supporting modules
pub mod shutdown;

pub use error::{QueueError, Result};
