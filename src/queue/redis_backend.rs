//! Redis list backed queue.
//!
//! Items are serialized to JSON, pushed with `LPUSH` and consumed with a
//! blocking `BRPOP`, so the list behaves as a FIFO queue that survives
//! process restarts. Building the backend connects to Redis; a broker that
//! is not reachable yet is a transient failure the delayed starter retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::shutdown::Hooks;

use super::backend::{
    check_exemplar, parse_backend_config, request_stop, wait_for_terminate, HandlerFn, Queue,
    QueueItem, QueueType, RunState, Stoppable,
};
use super::registry::BackendRegistry;

/// Pause after a failed `BRPOP` before polling again.
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration payload of the `redis` backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisQueueConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// List holding the queued items
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// How long one `BRPOP` blocks before the loop re-checks its state
    #[serde(default = "default_block_timeout_secs")]
    pub block_timeout_secs: u64,
}

fn default_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key() -> String {
    "ara:queue".to_string()
}

fn default_name() -> String {
    QueueType::REDIS.to_string()
}

fn default_block_timeout_secs() -> u64 {
    1
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key: default_key(),
            name: default_name(),
            block_timeout_secs: default_block_timeout_secs(),
        }
    }
}

/// Queue persisted in a Redis list.
///
/// On shutdown the consumer finishes the pop in flight and stops; anything
/// still in the list stays there for the next run. Terminate abandons the
/// pop in flight.
pub struct RedisQueue<T: QueueItem> {
    name: String,
    key: String,
    block_timeout_secs: u64,
    client: Client,
    connection: MultiplexedConnection,
    handler: HandlerFn<T>,
    exemplar: Option<T>,
    control: Arc<watch::Sender<RunState>>,
    running: AtomicBool,
}

impl<T> RedisQueue<T>
where
    T: QueueItem + Serialize + DeserializeOwned,
{
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// An unparsable URL is an invalid configuration; failing to connect is
    /// reported as `QueueError::Redis` and may be retried.
    pub async fn connect(
        handler: HandlerFn<T>,
        config: RedisQueueConfig,
        exemplar: Option<T>,
    ) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| QueueError::invalid_configuration(QueueType::REDIS, e.to_string()))?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        let (control, _) = watch::channel(RunState::Running);

        tracing::info!(queue = %config.name, key = %config.key, "Redis queue connected");

        Ok(Self {
            name: config.name,
            key: config.key,
            block_timeout_secs: config.block_timeout_secs.max(1),
            client,
            connection,
            handler,
            exemplar,
            control: Arc::new(control),
            running: AtomicBool::new(false),
        })
    }

    pub async fn from_config(
        handler: HandlerFn<T>,
        config: &Value,
        exemplar: Option<T>,
    ) -> Result<Self> {
        let config: RedisQueueConfig = parse_backend_config(QueueType::REDIS, config)?;
        Self::connect(handler, config, exemplar).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn pop(&self, connection: &mut MultiplexedConnection) -> Result<Option<String>> {
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(self.block_timeout_secs)
            .query_async(connection)
            .await?;
        Ok(popped.map(|(_key, payload)| payload))
    }

    fn deliver(&self, payload: &str) {
        match serde_json::from_str::<T>(payload) {
            Ok(item) => {
                (self.handler)(item);
                QueueMetrics::record_delivered(&self.name);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    queue = %self.name,
                    key = %self.key,
                    "Failed to deserialize queued item"
                );
            }
        }
    }
}

#[async_trait]
impl<T> Queue<T> for RedisQueue<T>
where
    T: QueueItem + Serialize + DeserializeOwned,
{
    async fn push(&self, item: T) -> Result<()> {
        check_exemplar(&self.name, &item, self.exemplar.as_ref())?;
        if *self.control.borrow() != RunState::Running {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let payload = serde_json::to_string(&item)?;
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut connection)
            .await?;

        QueueMetrics::record_pushed(&self.name);
        Ok(())
    }

    async fn run(&self, at_shutdown: &Hooks, at_terminate: &Hooks) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyRunning(self.name.clone()));
        }

        let control = Arc::clone(&self.control);
        at_shutdown.register(move || {
            request_stop(&control, RunState::Shutdown);
        });
        let control = Arc::clone(&self.control);
        at_terminate.register(move || {
            request_stop(&control, RunState::Terminate);
        });

        // BRPOP blocks its connection, keep it off the one used by push
        let mut connection = self.client.get_multiplexed_tokio_connection().await?;
        let mut state = self.control.subscribe();
        tracing::debug!(queue = %self.name, key = %self.key, "Redis queue started");

        loop {
            if *state.borrow_and_update() != RunState::Running {
                break;
            }

            let popped = tokio::select! {
                biased;
                _ = wait_for_terminate(&mut state) => break,
                popped = self.pop(&mut connection) => popped,
            };

            match popped {
                Ok(Some(payload)) => self.deliver(&payload),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, queue = %self.name, "Redis pop failed");
                    tokio::select! {
                        _ = tokio::time::sleep(POP_ERROR_BACKOFF) => {}
                        _ = state.changed() => {}
                    }
                }
            }
        }

        tracing::debug!(queue = %self.name, "Redis queue stopped");
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
impl<T> Stoppable for RedisQueue<T>
where
    T: QueueItem + Serialize + DeserializeOwned,
{
    async fn shutdown(&self) {
        request_stop(&self.control, RunState::Shutdown);
    }

    async fn terminate(&self) {
        request_stop(&self.control, RunState::Terminate);
    }
}

/// Add the `redis` backend to a registry.
pub fn register_redis_backend<T>(registry: &BackendRegistry<T>)
where
    T: QueueItem + Serialize + DeserializeOwned,
{
    registry.register(QueueType::REDIS, |handler, config, exemplar| async move {
        let queue = RedisQueue::from_config(handler, &config, exemplar).await?;
        Ok::<_, QueueError>(Arc::new(queue) as Arc<dyn Queue<T>>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> HandlerFn<String> {
        Arc::new(|_item: String| {})
    }

    #[test]
    fn test_config_defaults() {
        let config: RedisQueueConfig =
            parse_backend_config("redis", &json!({"key": "jobs"})).unwrap();

        assert_eq!(config.key, "jobs");
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.name, "redis");
        assert_eq!(config.block_timeout_secs, 1);
    }

    #[tokio::test]
    async fn test_bad_url_is_invalid_configuration() {
        let result = RedisQueue::from_config(
            noop_handler(),
            &json!({"url": "definitely not a url"}),
            None,
        )
        .await;

        match result {
            Err(err) => assert!(err.is_invalid_configuration()),
            Ok(_) => panic!("bad url must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_transient() {
        let result =
            RedisQueue::from_config(noop_handler(), &json!({"url": "redis://127.0.0.1:1"}), None)
                .await;

        match result {
            Err(err) => {
                assert!(!err.is_invalid_configuration());
                assert!(matches!(err, QueueError::Redis(_)));
            }
            Ok(_) => panic!("nothing listens on port 1"),
        }
    }

    #[test]
    fn test_registered_in_registry() {
        let registry = BackendRegistry::<String>::with_defaults();
        register_redis_backend(&registry);

        assert_eq!(registry.types(), vec![QueueType::memory(), QueueType::redis()]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis on localhost:6379"]
    async fn test_round_trip_through_redis() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: HandlerFn<String> = Arc::new(move |item: String| {
            let _ = tx.send(item);
        });
        let queue = Arc::new(
            RedisQueue::from_config(handler, &json!({"key": "ara:queue:test"}), None)
                .await
                .unwrap(),
        );

        queue.push("first".to_string()).await.unwrap();
        queue.push("second".to_string()).await.unwrap();

        let lifecycle = crate::shutdown::Lifecycle::new();
        let runner = {
            let queue = queue.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                queue
                    .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
                    .await
            })
        };

        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some("second"));

        lifecycle.terminate();
        runner.await.unwrap().unwrap();
    }
}
