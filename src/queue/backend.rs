//! Capability contract shared by every queue backend.
//!
//! This module defines the abstraction every queue implementation satisfies
//! (memory, Redis, the delayed-start wrapper), so callers can push items
//! without knowing which backend ended up serving them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{QueueError, Result};
use crate::shutdown::Hooks;

/// Identifier naming a backend kind in the [`BackendRegistry`](super::BackendRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueType(String);

impl QueueType {
    pub const MEMORY: &'static str = "memory";
    pub const REDIS: &'static str = "redis";
    pub const WRAPPED: &'static str = "wrapped";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn memory() -> Self {
        Self::new(Self::MEMORY)
    }

    pub fn redis() -> Self {
        Self::new(Self::REDIS)
    }

    pub fn wrapped() -> Self {
        Self::new(Self::WRAPPED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueType {
    fn default() -> Self {
        Self::memory()
    }
}

impl From<&str> for QueueType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait implemented by values that can travel through a queue.
///
/// The item type is fixed when the queue is created, so most items never
/// need a runtime check. [`QueueItem::conforms_to`] exists for dynamic
/// payloads whose shape is only known from configuration.
pub trait QueueItem: Clone + fmt::Debug + Send + Sync + 'static {
    /// Whether this item has the same shape as the exemplar.
    fn conforms_to(&self, _exemplar: &Self) -> bool {
        true
    }
}

impl QueueItem for String {}
impl QueueItem for u64 {}
impl QueueItem for i64 {}

/// JSON payloads conform when they are not null, have the same JSON kind
/// as the exemplar and, for objects, carry every key the exemplar has.
impl QueueItem for Value {
    fn conforms_to(&self, exemplar: &Self) -> bool {
        match (self, exemplar) {
            (Value::Null, _) => false,
            (Value::Object(item), Value::Object(shape)) => {
                shape.keys().all(|key| item.contains_key(key))
            }
            (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_)) => true,
            (_, Value::Null) => true,
            _ => false,
        }
    }
}

/// Function invoked once per delivered item.
pub type HandlerFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Optional stop capability.
///
/// A backend either supports graceful shutdown and hard termination, or it
/// does not implement this trait at all. Ask through [`Queue::stoppable`].
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Stop consuming once in-flight work is finished.
    async fn shutdown(&self);

    /// Stop immediately, discarding anything still buffered.
    async fn terminate(&self);
}

/// Capability contract for queues.
///
/// # Thread Safety
///
/// `push` may be called from many tasks at once, including while `run` is
/// consuming in another task.
#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: QueueItem,
{
    /// Enqueue one item.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ShapeMismatch` for items not matching the exemplar
    /// and `QueueError::Closed` once the queue stopped accepting items.
    async fn push(&self, item: T) -> Result<()>;

    /// Consume items until the queue is shut down or terminated.
    ///
    /// The queue registers its own cleanup with `at_shutdown` and
    /// `at_terminate`. Must be called once per queue.
    async fn run(&self, at_shutdown: &Hooks, at_terminate: &Hooks) -> Result<()>;

    /// Stable identifier for logs and introspection.
    fn name(&self) -> &str;

    /// Query the optional stop capability.
    fn stoppable(self: Arc<Self>) -> Option<Arc<dyn Stoppable>> {
        None
    }
}

/// Reject items whose shape does not match the exemplar.
pub(crate) fn check_exemplar<T: QueueItem>(
    name: &str,
    item: &T,
    exemplar: Option<&T>,
) -> Result<()> {
    match exemplar {
        Some(exemplar) if !item.conforms_to(exemplar) => Err(QueueError::ShapeMismatch {
            name: name.to_string(),
            item: format!("{item:?}"),
            exemplar: format!("{exemplar:?}"),
        }),
        _ => Ok(()),
    }
}

/// Consumer state of a backend's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Running,
    Shutdown,
    Terminate,
}

/// Move the run loop towards `target`. Termination overrides a pending
/// shutdown; nothing moves a loop back to running.
pub(crate) fn request_stop(control: &watch::Sender<RunState>, target: RunState) -> bool {
    control.send_if_modified(|state| {
        let allowed = matches!(
            (*state, target),
            (RunState::Running, RunState::Shutdown)
                | (RunState::Running, RunState::Terminate)
                | (RunState::Shutdown, RunState::Terminate)
        );
        if allowed {
            *state = target;
        }
        allowed
    })
}

/// Resolve once termination was requested. Never resolves if the control
/// sender is gone.
pub(crate) async fn wait_for_terminate(control: &mut watch::Receiver<RunState>) {
    if control
        .wait_for(|state| *state == RunState::Terminate)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

/// Deserialize a backend's opaque configuration payload.
///
/// `null` is treated as an empty object so every field falls back to its
/// default. A payload of the wrong shape is an invalid configuration.
pub fn parse_backend_config<C>(queue_type: &str, config: &Value) -> Result<C>
where
    C: DeserializeOwned,
{
    let payload = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(payload)
        .map_err(|e| QueueError::invalid_configuration(queue_type, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_type_display() {
        assert_eq!(QueueType::memory().to_string(), "memory");
        assert_eq!(QueueType::from("redis"), QueueType::redis());
        assert_eq!(QueueType::default().as_str(), QueueType::MEMORY);
    }

    #[test]
    fn test_json_object_conforms() {
        let exemplar = json!({"repo_id": 0, "kind": ""});

        assert!(json!({"repo_id": 7, "kind": "push", "extra": true}).conforms_to(&exemplar));
        assert!(!json!({"repo_id": 7}).conforms_to(&exemplar));
        assert!(!json!("repo").conforms_to(&exemplar));
        assert!(!Value::Null.conforms_to(&exemplar));
    }

    #[test]
    fn test_json_scalar_conforms() {
        assert!(json!(3).conforms_to(&json!(0)));
        assert!(!json!("3").conforms_to(&json!(0)));
        assert!(json!([1, 2]).conforms_to(&json!([])));
    }

    #[test]
    fn test_check_exemplar_rejects_mismatch() {
        let exemplar = json!({"id": 0});
        let err = check_exemplar("q", &json!({"name": "x"}), Some(&exemplar)).unwrap_err();
        assert!(matches!(err, QueueError::ShapeMismatch { ref name, .. } if name == "q"));
        assert!(check_exemplar("q", &json!({"id": 1}), Some(&exemplar)).is_ok());
        assert!(check_exemplar("q", &Value::Null, None).is_ok());
    }

    #[test]
    fn test_request_stop_transitions() {
        let (control, _rx) = watch::channel(RunState::Running);

        assert!(request_stop(&control, RunState::Shutdown));
        assert!(!request_stop(&control, RunState::Shutdown));
        assert!(request_stop(&control, RunState::Terminate));
        assert!(!request_stop(&control, RunState::Shutdown));
        assert_eq!(*control.borrow(), RunState::Terminate);
    }

    #[test]
    fn test_typed_items_always_conform() {
        assert!("a".to_string().conforms_to(&String::new()));
        assert!(5u64.conforms_to(&0));
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        length: usize,
    }

    #[test]
    fn test_parse_backend_config_null_uses_defaults() {
        let parsed: Sample = parse_backend_config("memory", &Value::Null).unwrap();
        assert_eq!(parsed.length, 0);
    }

    #[test]
    fn test_parse_backend_config_wrong_shape() {
        let err = parse_backend_config::<Sample>("memory", &json!({"length": "ten"})).unwrap_err();
        assert!(err.is_invalid_configuration());
    }
}
