//! Lifecycle hooks and coordinated shutdown for queues.
//!
//! Queues never decide on their own when the process stops. Whoever calls
//! [`Queue::run`](crate::queue::Queue::run) hands in two [`Hooks`]: one fired on
//! graceful shutdown and one fired on hard termination. Every layer registers
//! its cleanup with those hooks and forwards them to whatever it wraps.
//!
//! [`GracefulShutdown`] drives both hooks and fans out to every queue known
//! to a [`QueueManager`], escalating to termination when the graceful phase
//! does not finish in time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::timeout;

use crate::queue::QueueManager;

/// Cleanup callback registered with a hook.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct HooksInner {
    fired: bool,
    callbacks: Vec<Callback>,
}

/// A registration point for cleanup callbacks.
///
/// Callbacks run exactly once, when [`Hooks::fire`] is called. A callback
/// registered after the hook already fired runs immediately.
#[derive(Clone, Default)]
pub struct Hooks {
    inner: Arc<Mutex<HooksInner>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run when this hook fires.
    ///
    /// Callbacks cannot be unregistered. One that outlives its purpose (the
    /// cancel signal of a delayed start that already succeeded) stays in the
    /// list until the hook fires, and then does nothing.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.fired {
            drop(inner);
            callback();
            return;
        }
        inner.callbacks.push(Box::new(callback));
    }

    /// Run every registered callback. Returns how many ran.
    pub fn fire(&self) -> usize {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.fired = true;
            std::mem::take(&mut inner.callbacks)
        };

        let count = callbacks.len();
        for callback in callbacks {
            callback();
        }
        count
    }

    /// Whether [`Hooks::fire`] has been called.
    pub fn is_fired(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fired
    }

    /// Number of callbacks waiting for the hook to fire.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }
}

/// The pair of hooks handed to `Queue::run`.
#[derive(Clone, Default)]
pub struct Lifecycle {
    pub at_shutdown: Hooks,
    pub at_terminate: Hooks,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the graceful shutdown hook.
    pub fn shutdown(&self) -> usize {
        let count = self.at_shutdown.fire();
        tracing::debug!(callbacks = count, "Shutdown hooks fired");
        count
    }

    /// Fire the hard termination hook.
    pub fn terminate(&self) -> usize {
        let count = self.at_terminate.fire();
        tracing::debug!(callbacks = count, "Terminate hooks fired");
        count
    }
}

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for queues to drain before terminating them (default: 15 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// Coordinates shutdown of every managed queue.
pub struct GracefulShutdown {
    lifecycle: Lifecycle,
    manager: Arc<QueueManager>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(lifecycle: Lifecycle, manager: Arc<QueueManager>) -> Self {
        Self {
            lifecycle,
            manager,
            config: ShutdownConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(
        lifecycle: Lifecycle,
        manager: Arc<QueueManager>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            lifecycle,
            manager,
            config,
        }
    }

    /// Execute the shutdown sequence.
    ///
    /// Phase 1 fires the shutdown hooks and asks every managed queue to stop
    /// gracefully. If that does not complete within the drain timeout, phase 2
    /// fires the terminate hooks and terminates every managed queue.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(managed_queues = self.manager.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Draining queues");
        result.hooks_fired = self.lifecycle.shutdown();

        match timeout(self.config.drain_timeout, self.manager.shutdown_all()).await {
            Ok(count) => {
                result.queues_shut_down = count;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    "Queue drain timeout, Phase 2: Terminating queues"
                );
                result.hooks_fired += self.lifecycle.terminate();
                result.queues_terminated = self.manager.terminate_all().await;
                result.terminated = true;
            }
        }

        result.duration = start.elapsed();

        tracing::info!(
            queues_shut_down = result.queues_shut_down,
            queues_terminated = result.queues_terminated,
            terminated = result.terminated,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Number of hook callbacks that ran
    pub hooks_fired: usize,
    /// Number of queues asked to shut down gracefully
    pub queues_shut_down: usize,
    /// Number of queues terminated after the drain timeout
    pub queues_terminated: usize,
    /// Whether the termination phase was needed
    pub terminated: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}
