//! Registry of queue backend constructors keyed by queue type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::{QueueError, Result};

use super::backend::{HandlerFn, Queue, QueueItem, QueueType};
use super::memory_backend::ChannelQueue;

/// Constructor building a backend from a handler, its opaque configuration
/// and an optional exemplar.
pub type Constructor<T> = Arc<
    dyn Fn(HandlerFn<T>, Value, Option<T>) -> BoxFuture<'static, Result<Arc<dyn Queue<T>>>>
        + Send
        + Sync,
>;

/// Mapping from [`QueueType`] to backend constructors.
///
/// Registration normally happens once at startup; lookups are read-only
/// afterwards.
pub struct BackendRegistry<T: QueueItem> {
    constructors: RwLock<HashMap<QueueType, Constructor<T>>>,
}

impl<T: QueueItem> Default for BackendRegistry<T> {
    fn default() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: QueueItem> BackendRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `memory` backend.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(QueueType::MEMORY, |handler, config, exemplar| async move {
            let queue = ChannelQueue::from_config(handler, &config, exemplar)?;
            Ok::<_, QueueError>(Arc::new(queue) as Arc<dyn Queue<T>>)
        });
        registry
    }

    /// Register (or replace) the constructor for a queue type.
    pub fn register<F, Fut>(&self, queue_type: impl Into<QueueType>, constructor: F)
    where
        F: Fn(HandlerFn<T>, Value, Option<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Queue<T>>>> + Send + 'static,
    {
        let queue_type = queue_type.into();
        let constructor: Constructor<T> = Arc::new(
            move |handler: HandlerFn<T>, config: Value, exemplar: Option<T>| {
                constructor(handler, config, exemplar).boxed()
            },
        );

        let replaced = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue_type.clone(), constructor)
            .is_some();

        tracing::debug!(queue_type = %queue_type, replaced, "Registered queue backend");
    }

    /// Whether a constructor is registered for the type.
    pub fn contains(&self, queue_type: &QueueType) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(queue_type)
    }

    /// All registered queue types, sorted.
    pub fn types(&self) -> Vec<QueueType> {
        let mut types: Vec<QueueType> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    /// Construct a backend of the given type.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfiguration` for unknown types, otherwise
    /// whatever the constructor returns.
    pub async fn construct(
        &self,
        queue_type: &QueueType,
        handler: HandlerFn<T>,
        config: &Value,
        exemplar: Option<T>,
    ) -> Result<Arc<dyn Queue<T>>> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_type)
            .cloned()
            .ok_or_else(|| {
                QueueError::invalid_configuration(queue_type.as_str(), "unknown queue type")
            })?;

        constructor(handler, config.clone(), exemplar).await
    }
}
