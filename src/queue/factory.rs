//! Top-level queue construction.

use std::sync::Arc;

use crate::error::Result;

use super::backend::{HandlerFn, Queue, QueueItem};
use super::manager::QueueManager;
use super::registry::BackendRegistry;
use super::wrapped::{WrappedQueue, WrappedQueueConfig};

/// Builds queues from configuration and tracks them in a [`QueueManager`].
///
/// # Example
///
/// ```rust,ignore
/// let factory = QueueFactory::new(Arc::new(BackendRegistry::with_defaults()));
/// let queue = factory.new_queue(handler, config, None).await?;
/// tokio::spawn(async move { queue.run(&at_shutdown, &at_terminate).await });
/// ```
pub struct QueueFactory<T: QueueItem> {
    registry: Arc<BackendRegistry<T>>,
    manager: Arc<QueueManager>,
}

impl<T: QueueItem> QueueFactory<T> {
    pub fn new(registry: Arc<BackendRegistry<T>>) -> Self {
        Self::with_manager(registry, Arc::new(QueueManager::new()))
    }

    /// Share a manager between factories of different item types.
    pub fn with_manager(registry: Arc<BackendRegistry<T>>, manager: Arc<QueueManager>) -> Self {
        Self { registry, manager }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry<T>> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Create a queue of `config.underlying`.
    ///
    /// When the backend can be built right away it is returned as is.
    /// Transient construction failures yield a [`WrappedQueue`] that keeps
    /// retrying inside `run` while buffering pushes.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfiguration` without retrying.
    pub async fn new_queue(
        &self,
        handler: HandlerFn<T>,
        config: WrappedQueueConfig,
        exemplar: Option<T>,
    ) -> Result<Arc<dyn Queue<T>>> {
        let err = match self
            .registry
            .construct(
                &config.underlying,
                handler.clone(),
                &config.config,
                exemplar.clone(),
            )
            .await
        {
            Ok(queue) => {
                let stoppable = Arc::clone(&queue).stoppable();
                self.manager.add(
                    queue.name(),
                    config.underlying.clone(),
                    config.config.clone(),
                    exemplar.as_ref().map(|exemplar| format!("{exemplar:?}")),
                    stoppable,
                );
                return Ok(queue);
            }
            Err(err) if err.is_invalid_configuration() => return Err(err),
            Err(err) => err,
        };

        tracing::info!(
            queue = %config.name,
            queue_type = %config.underlying,
            error = %err,
            "Queue backend not ready, starting delayed"
        );

        let manager_config = serde_json::to_value(&config)?;
        let queue = Arc::new(WrappedQueue::new(
            Arc::clone(&self.registry),
            handler,
            config,
            exemplar,
        ));
        queue.register_with(Arc::clone(&self.manager), manager_config);

        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::queue::QueueType;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_handler() -> HandlerFn<String> {
        Arc::new(|_item: String| {})
    }

    fn config(underlying: &str) -> WrappedQueueConfig {
        WrappedQueueConfig {
            underlying: QueueType::from(underlying),
            name: "factory".to_string(),
            config: json!({"name": "factory"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ready_backend_is_returned_directly() {
        let factory = QueueFactory::new(Arc::new(BackendRegistry::<String>::with_defaults()));

        let queue = factory
            .new_queue(noop_handler(), config("memory"), None)
            .await
            .unwrap();

        assert_eq!(queue.name(), "factory");
        let infos = factory.manager().list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].queue_type, QueueType::memory());
        assert!(infos[0].stoppable);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_returned() {
        let factory = QueueFactory::new(Arc::new(BackendRegistry::<String>::with_defaults()));

        let result = factory
            .new_queue(noop_handler(), config("no-such-backend"), None)
            .await;

        assert!(matches!(result, Err(ref err) if err.is_invalid_configuration()));
        assert!(factory.manager().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_returns_wrapper() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = BackendRegistry::<String>::new();
        let counter = calls.clone();
        registry.register(QueueType::MEMORY, move |_handler, _config, _exemplar| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Arc<dyn Queue<String>>, _>(QueueError::Backend("not yet".into())) }
        });
        let factory = QueueFactory::new(Arc::new(registry));

        let queue = factory
            .new_queue(noop_handler(), config("memory"), Some("exemplar".to_string()))
            .await
            .unwrap();

        assert_eq!(queue.name(), "factory-wrapper");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let infos = factory.manager().list();
        assert_eq!(infos[0].queue_type, QueueType::wrapped());
        assert_eq!(infos[0].config["underlying"], "memory");
        assert_eq!(infos[0].exemplar.as_deref(), Some("\"exemplar\""));
        assert_ne!(infos[0].config, Value::Null);
    }
}
