//! In-memory queue backend built on a bounded channel.
//!
//! Items live only in process memory and are lost on restart. A single
//! consumer loop inside `run` hands every item to the handler in push order.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::shutdown::Hooks;

use super::backend::{
    check_exemplar, parse_backend_config, request_stop, HandlerFn, Queue, QueueItem, QueueType,
    RunState, Stoppable,
};

/// Configuration payload of the `memory` backend.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryQueueConfig {
    /// Channel capacity; pushes wait once it is full
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
    /// Name used in logs and introspection
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_queue_length() -> usize {
    100
}

fn default_name() -> String {
    QueueType::MEMORY.to_string()
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            queue_length: default_queue_length(),
            name: default_name(),
        }
    }
}

/// In-memory queue backend.
///
/// Uses a bounded `mpsc` channel between pushers and the consumer loop.
/// On shutdown the loop drains what is already buffered; on terminate the
/// buffer is discarded.
pub struct ChannelQueue<T: QueueItem> {
    name: String,
    handler: HandlerFn<T>,
    exemplar: Option<T>,
    sender: mpsc::Sender<T>,
    receiver: Mutex<Option<mpsc::Receiver<T>>>,
    control: Arc<watch::Sender<RunState>>,
}

impl<T: QueueItem> ChannelQueue<T> {
    /// Create a new channel queue with the given configuration.
    pub fn new(handler: HandlerFn<T>, config: MemoryQueueConfig, exemplar: Option<T>) -> Self {
        // A zero capacity channel is not supported by tokio
        let (sender, receiver) = mpsc::channel(config.queue_length.max(1));
        let (control, _) = watch::channel(RunState::Running);

        Self {
            name: config.name,
            handler,
            exemplar,
            sender,
            receiver: Mutex::new(Some(receiver)),
            control: Arc::new(control),
        }
    }

    /// Create a channel queue from an opaque configuration payload.
    pub fn from_config(
        handler: HandlerFn<T>,
        config: &Value,
        exemplar: Option<T>,
    ) -> Result<Self> {
        let config: MemoryQueueConfig = parse_backend_config(QueueType::MEMORY, config)?;
        Ok(Self::new(handler, config, exemplar))
    }

    /// Number of items waiting in the channel.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deliver(&self, item: T) {
        (self.handler)(item);
        QueueMetrics::record_delivered(&self.name);
    }
}

#[async_trait]
impl<T: QueueItem> Queue<T> for ChannelQueue<T> {
    async fn push(&self, item: T) -> Result<()> {
        check_exemplar(&self.name, &item, self.exemplar.as_ref())?;

        self.sender
            .send(item)
            .await
            .map_err(|_| QueueError::Closed(self.name.clone()))?;

        QueueMetrics::record_pushed(&self.name);
        Ok(())
    }

    async fn run(&self, at_shutdown: &Hooks, at_terminate: &Hooks) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| QueueError::AlreadyRunning(self.name.clone()))?;

        let control = Arc::clone(&self.control);
        at_shutdown.register(move || {
            request_stop(&control, RunState::Shutdown);
        });
        let control = Arc::clone(&self.control);
        at_terminate.register(move || {
            request_stop(&control, RunState::Terminate);
        });

        let mut state = self.control.subscribe();
        tracing::debug!(queue = %self.name, "Channel queue started");

        loop {
            let current = *state.borrow_and_update();
            match current {
                RunState::Running => {}
                RunState::Shutdown => {
                    receiver.close();
                    let mut drained = 0usize;
                    while let Some(item) = receiver.recv().await {
                        self.deliver(item);
                        drained += 1;
                    }
                    tracing::debug!(queue = %self.name, drained, "Channel queue drained");
                    break;
                }
                RunState::Terminate => {
                    receiver.close();
                    let mut discarded = 0usize;
                    while receiver.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        QueueMetrics::record_discarded(&self.name, discarded as u64);
                        tracing::warn!(
                            queue = %self.name,
                            discarded,
                            "Channel queue terminated with buffered items"
                        );
                    }
                    break;
                }
            }

            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                item = receiver.recv() => match item {
                    Some(item) => self.deliver(item),
                    None => break,
                },
            }
        }

        tracing::debug!(queue = %self.name, "Channel queue stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stoppable(self: Arc<Self>) -> Option<Arc<dyn Stoppable>> {
        Some(self)
    }
}

#[async_trait]
impl<T: QueueItem> Stoppable for ChannelQueue<T> {
    async fn shutdown(&self) {
        tracing::trace!(queue = %self.name, "Channel queue shutdown requested");
        request_stop(&self.control, RunState::Shutdown);
    }

    async fn terminate(&self) {
        tracing::trace!(queue = %self.name, "Channel queue terminate requested");
        request_stop(&self.control, RunState::Terminate);
    }
}
