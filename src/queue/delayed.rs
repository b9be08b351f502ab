//! Retry state machine constructing a backend that was not ready at startup.
//!
//! The starter repeatedly asks the [`BackendRegistry`] for the underlying
//! backend until it succeeds, a fatal configuration error occurs, the
//! attempt budget is used up, the deadline passes, or shutdown is requested.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use crate::error::{QueueError, Result};
use crate::metrics::StarterMetrics;
use crate::shutdown::Hooks;

use super::backend::{HandlerFn, Queue, QueueItem, QueueType};
use super::registry::BackendRegistry;

/// Interval between attempts when no timeout/attempt budget is configured.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Part of the timeout kept free when spreading attempts across it.
pub const TIMEOUT_SAFETY_MARGIN: Duration = Duration::from_millis(200);

/// Starter states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StarterState {
    /// `start` has not been called
    Unstarted = 0,
    /// Construction attempts are in progress
    Constructing = 1,
    /// The backend was constructed
    Ready = 2,
    /// Construction gave up
    Failed = 3,
}

impl From<u8> for StarterState {
    fn from(value: u8) -> Self {
        match value {
            1 => StarterState::Constructing,
            2 => StarterState::Ready,
            3 => StarterState::Failed,
            _ => StarterState::Unstarted,
        }
    }
}

/// Parameters of a delayed start.
#[derive(Debug, Clone)]
pub struct StarterConfig {
    pub underlying: QueueType,
    pub config: Value,
    /// Zero means unbounded by time
    pub timeout: Duration,
    /// Zero means unbounded by count
    pub max_attempts: u32,
    pub name: String,
}

/// Backend construction with retry and backoff.
pub struct DelayedStarter<T: QueueItem> {
    registry: Arc<BackendRegistry<T>>,
    config: StarterConfig,
    attempts: AtomicU32,
    state: AtomicU8,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

impl<T: QueueItem> DelayedStarter<T> {
    pub fn new(registry: Arc<BackendRegistry<T>>, config: StarterConfig) -> Self {
        Self {
            registry,
            config,
            attempts: AtomicU32::new(0),
            state: AtomicU8::new(StarterState::Unstarted as u8),
        }
    }

    /// Current state of the starter.
    pub fn state(&self) -> StarterState {
        StarterState::from(self.state.load(Ordering::Acquire))
    }

    /// Construction attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &StarterConfig {
        &self.config
    }

    /// Sleep between two attempts.
    ///
    /// With both a timeout and an attempt budget the attempts are spread
    /// evenly over the timeout (minus a safety margin).
    pub fn backoff_interval(&self) -> Duration {
        let StarterConfig {
            timeout,
            max_attempts,
            ..
        } = self.config;
        if !timeout.is_zero() && max_attempts > 0 {
            timeout.saturating_sub(TIMEOUT_SAFETY_MARGIN) / max_attempts
        } else {
            DEFAULT_BACKOFF
        }
    }

    fn set_state(&self, state: StarterState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fail(&self, err: QueueError) -> Result<Arc<dyn Queue<T>>> {
        self.set_state(StarterState::Failed);
        StarterMetrics::record_failure(self.config.underlying.as_str(), err.kind_label());
        Err(err)
    }

    fn timeout_error(&self) -> QueueError {
        QueueError::StartTimeout {
            queue_type: self.config.underlying.to_string(),
            name: self.config.name.clone(),
            timeout: self.config.timeout,
        }
    }

    /// Construct the backend, retrying transient failures.
    ///
    /// A shutdown fired on `at_shutdown` aborts the loop early.
    ///
    /// # Errors
    ///
    /// - `QueueError::InvalidConfiguration` straight from the registry
    /// - `QueueError::AttemptsExhausted` once `max_attempts` attempts failed
    /// - `QueueError::StartTimeout` when the deadline passes
    /// - `QueueError::StartCancelled` on shutdown
    pub async fn start(
        &self,
        handler: HandlerFn<T>,
        exemplar: Option<T>,
        at_shutdown: &Hooks,
    ) -> Result<Arc<dyn Queue<T>>> {
        self.set_state(StarterState::Constructing);

        let deadline =
            (!self.config.timeout.is_zero()).then(|| Instant::now() + self.config.timeout);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        // Stays registered after a successful start; sending to the dropped
        // receiver is then a no-op
        at_shutdown.register(move || {
            let _ = cancel_tx.send(true);
        });

        let interval = self.backoff_interval();
        let queue_type = self.config.underlying.as_str();

        loop {
            if *cancel_rx.borrow() {
                return self.fail(QueueError::StartCancelled {
                    name: self.config.name.clone(),
                });
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return self.fail(self.timeout_error());
            }

            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            StarterMetrics::record_attempt(queue_type);

            let construct = self.registry.construct(
                &self.config.underlying,
                handler.clone(),
                &self.config.config,
                exemplar.clone(),
            );
            let outcome = tokio::select! {
                outcome = construct => Ok(outcome),
                interrupt = wait_interrupt(&mut cancel_rx, deadline) => Err(interrupt),
            };

            let err = match outcome {
                Ok(Ok(queue)) => {
                    self.set_state(StarterState::Ready);
                    tracing::info!(
                        queue = %self.config.name,
                        queue_type = %queue_type,
                        attempt,
                        "Queue backend constructed"
                    );
                    return Ok(queue);
                }
                Ok(Err(err)) if err.is_invalid_configuration() => {
                    tracing::error!(
                        queue = %self.config.name,
                        queue_type = %queue_type,
                        error = %err,
                        "Invalid queue configuration, not retrying"
                    );
                    return self.fail(err);
                }
                Ok(Err(err)) => err,
                Err(Interrupt::Cancelled) => {
                    return self.fail(QueueError::StartCancelled {
                        name: self.config.name.clone(),
                    });
                }
                Err(Interrupt::Deadline) => return self.fail(self.timeout_error()),
            };

            if !err.is_unavailable() {
                tracing::warn!(
                    attempt,
                    queue = %self.config.name,
                    queue_type = %queue_type,
                    config = %self.config.config,
                    error = %err,
                    "Failed to create queue"
                );
            }

            if self.config.max_attempts > 0 && attempt >= self.config.max_attempts {
                return self.fail(QueueError::AttemptsExhausted {
                    queue_type: queue_type.to_string(),
                    name: self.config.name.clone(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let wake = Instant::now() + interval;
            let wake = deadline.map_or(wake, |deadline| wake.min(deadline));
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = wait_interrupt(&mut cancel_rx, None) => {}
            }
        }
    }
}

/// Resolve on cancellation, or when the deadline (if any) passes.
async fn wait_interrupt(
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
) -> Interrupt {
    let cancelled = async {
        if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            // The hook was dropped without firing; cancellation can no longer happen
            std::future::pending::<()>().await;
        }
    };
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = cancelled => Interrupt::Cancelled,
        _ = expired => Interrupt::Deadline,
    }
}
