//! Queue wrapper that buffers work while its backend is still being built.
//!
//! A [`WrappedQueue`] accepts pushes from the moment it exists. Items wait in
//! a bounded buffer until `run` has constructed the underlying backend with a
//! [`DelayedStarter`]; a pump task then forwards them to the backend in
//! arrival order and `run` hands over to the backend's own consumer loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};

use crate::error::{QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::shutdown::{Hooks, Lifecycle};

use super::backend::{
    check_exemplar, request_stop, wait_for_terminate, HandlerFn, Queue, QueueItem, QueueType,
    RunState, Stoppable,
};
use super::delayed::{DelayedStarter, StarterConfig, StarterState};
use super::manager::QueueManager;
use super::registry::BackendRegistry;

/// Configuration of a wrapped queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedQueueConfig {
    /// Backend type to construct
    #[serde(default)]
    pub underlying: QueueType,
    /// Time allowed for construction; zero means unbounded
    #[serde(default, rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Construction attempts allowed; zero means unbounded
    #[serde(default, deserialize_with = "non_negative_attempts")]
    pub max_attempts: u32,
    /// Opaque configuration handed to the backend constructor
    #[serde(default)]
    pub config: Value,
    /// Capacity of the buffer holding items until the backend is ready;
    /// zero makes every push wait for the pump to take the item
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_queue_length() -> usize {
    100
}

fn default_name() -> String {
    "queue".to_string()
}

impl Default for WrappedQueueConfig {
    fn default() -> Self {
        Self {
            underlying: QueueType::default(),
            timeout: Duration::ZERO,
            max_attempts: 0,
            config: Value::Null,
            queue_length: default_queue_length(),
            name: default_name(),
        }
    }
}

/// Millisecond durations where zero or negative values mean "no limit".
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis.max(0) as u64))
    }
}

fn non_negative_attempts<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let attempts = i64::deserialize(deserializer)?;
    Ok(attempts.clamp(0, u32::MAX as i64) as u32)
}

/// Buffered item. `handoff` is set for unbuffered queues and completes once
/// the pump has taken the item.
struct Buffered<T> {
    item: T,
    handoff: Option<oneshot::Sender<()>>,
}

impl<T> Buffered<T> {
    fn take(self) -> T {
        if let Some(handoff) = self.handoff {
            let _ = handoff.send(());
        }
        self.item
    }
}

/// Manager entry of the wrapper, parent of the backend entry added once the
/// backend exists.
struct Registration {
    manager: Arc<QueueManager>,
    id: u64,
}

/// Backend state, set once construction succeeded.
struct Ready<T: QueueItem> {
    backend: Arc<dyn Queue<T>>,
    pump: Arc<watch::Sender<RunState>>,
    finished: watch::Receiver<bool>,
    inner: Lifecycle,
}

/// Delayed-start queue.
///
/// # Shutdown
///
/// - shutdown: the buffer is closed, the pump forwards what is left, then
///   the backend is shut down
/// - terminate: the buffer is closed and discarded, then the backend is
///   terminated
///
/// Both are no-ops until the backend exists.
pub struct WrappedQueue<T: QueueItem> {
    name: String,
    starter: DelayedStarter<T>,
    handler: HandlerFn<T>,
    exemplar: Option<T>,
    sender: mpsc::Sender<Buffered<T>>,
    receiver: Mutex<Option<mpsc::Receiver<Buffered<T>>>>,
    unbuffered: bool,
    running: AtomicBool,
    ready: OnceCell<Ready<T>>,
    registration: OnceLock<Registration>,
}

impl<T: QueueItem> WrappedQueue<T> {
    pub fn new(
        registry: Arc<BackendRegistry<T>>,
        handler: HandlerFn<T>,
        config: WrappedQueueConfig,
        exemplar: Option<T>,
    ) -> Self {
        let unbuffered = config.queue_length == 0;
        let (sender, receiver) = mpsc::channel(config.queue_length.max(1));
        let name = format!("{}-wrapper", config.name);
        let starter = DelayedStarter::new(
            registry,
            StarterConfig {
                underlying: config.underlying,
                config: config.config,
                timeout: config.timeout,
                max_attempts: config.max_attempts,
                name: config.name,
            },
        );

        Self {
            name,
            starter,
            handler,
            exemplar,
            sender,
            receiver: Mutex::new(Some(receiver)),
            unbuffered,
            running: AtomicBool::new(false),
            ready: OnceCell::new(),
            registration: OnceLock::new(),
        }
    }

    /// Add this wrapper to `manager`. The backend is added as its child once
    /// it has been constructed. Returns the wrapper's id.
    pub fn register_with(self: &Arc<Self>, manager: Arc<QueueManager>, config: Value) -> u64 {
        if let Some(registration) = self.registration.get() {
            return registration.id;
        }
        let id = manager.add(
            self.name.clone(),
            QueueType::wrapped(),
            config,
            self.exemplar_text(),
            Arc::clone(self).stoppable(),
        );
        let _ = self.registration.set(Registration { manager, id });
        id
    }

    fn exemplar_text(&self) -> Option<String> {
        self.exemplar
            .as_ref()
            .map(|exemplar| format!("{exemplar:?}"))
    }

    /// Construction attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.starter.attempts()
    }

    pub fn starter_state(&self) -> StarterState {
        self.starter.state()
    }

    /// Whether the underlying backend has been constructed.
    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Items waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    async fn start(&self, at_shutdown: &Hooks) -> Result<Ready<T>> {
        let backend = self
            .starter
            .start(self.handler.clone(), self.exemplar.clone(), at_shutdown)
            .await?;
        let stoppable = Arc::clone(&backend).stoppable();

        if let Some(Registration { manager, id }) = self.registration.get() {
            let config = self.starter.config();
            manager.add_child(
                *id,
                backend.name(),
                config.underlying.clone(),
                config.config.clone(),
                self.exemplar_text(),
                stoppable.clone(),
            );
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| QueueError::AlreadyRunning(self.name.clone()))?;

        let (pump, control) = watch::channel(RunState::Running);
        let (done, finished) = watch::channel(false);
        let inner = Lifecycle::new();

        tokio::spawn(
            Pump {
                name: self.name.clone(),
                receiver,
                backend: Arc::clone(&backend),
                stoppable,
                inner: inner.clone(),
                control,
                done,
            }
            .run(),
        );

        Ok(Ready {
            backend,
            pump: Arc::new(pump),
            finished,
            inner,
        })
    }

    /// Ask the pump to stop and wait until it has finished.
    async fn stop_pump(&self, target: RunState) {
        let Some(ready) = self.ready.get() else {
            return;
        };
        request_stop(&ready.pump, target);

        let mut finished = ready.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

#[async_trait]
impl<T: QueueItem> Queue<T> for WrappedQueue<T> {
    async fn push(&self, item: T) -> Result<()> {
        check_exemplar(&self.name, &item, self.exemplar.as_ref())?;

        let closed = || QueueError::Closed(self.name.clone());
        if self.unbuffered {
            let (handoff, taken) = oneshot::channel();
            self.sender
                .send(Buffered {
                    item,
                    handoff: Some(handoff),
                })
                .await
                .map_err(|_| closed())?;
            // Dropped unanswered when the buffer is discarded
            taken.await.map_err(|_| closed())?;
        } else {
            self.sender
                .send(Buffered {
                    item,
                    handoff: None,
                })
                .await
                .map_err(|_| closed())?;
        }

        QueueMetrics::record_pushed(&self.name);
        Ok(())
    }

    async fn run(&self, at_shutdown: &Hooks, at_terminate: &Hooks) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyRunning(self.name.clone()));
        }

        let ready = match self.ready.get_or_try_init(|| self.start(at_shutdown)).await {
            Ok(ready) => ready,
            Err(err) => {
                tracing::error!(
                    queue = %self.name,
                    error = %err,
                    "Unable to set the internal queue"
                );
                return Err(err);
            }
        };

        let pump = Arc::clone(&ready.pump);
        at_shutdown.register(move || {
            request_stop(&pump, RunState::Shutdown);
        });
        let pump = Arc::clone(&ready.pump);
        at_terminate.register(move || {
            request_stop(&pump, RunState::Terminate);
        });

        let result = ready
            .backend
            .run(&ready.inner.at_shutdown, &ready.inner.at_terminate)
            .await;

        tracing::trace!(queue = %self.name, "Wrapped queue done");
        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stoppable(self: Arc<Self>) -> Option<Arc<dyn Stoppable>> {
        Some(self)
    }
}

#[async_trait]
impl<T: QueueItem> Stoppable for WrappedQueue<T> {
    async fn shutdown(&self) {
        tracing::trace!(queue = %self.name, "Wrapped queue shutdown");
        self.stop_pump(RunState::Shutdown).await;
    }

    async fn terminate(&self) {
        tracing::trace!(queue = %self.name, "Wrapped queue terminating");
        self.stop_pump(RunState::Terminate).await;
    }
}

/// Task forwarding buffered items to the constructed backend.
struct Pump<T: QueueItem> {
    name: String,
    receiver: mpsc::Receiver<Buffered<T>>,
    backend: Arc<dyn Queue<T>>,
    stoppable: Option<Arc<dyn Stoppable>>,
    inner: Lifecycle,
    control: watch::Receiver<RunState>,
    done: watch::Sender<bool>,
}

impl<T: QueueItem> Pump<T> {
    async fn run(mut self) {
        tracing::debug!(queue = %self.name, backend = %self.backend.name(), "Pump started");

        match self.forward_until_stopped().await {
            RunState::Shutdown => {
                if self.drain().await {
                    self.inner.shutdown();
                    if let Some(stoppable) = &self.stoppable {
                        stoppable.shutdown().await;
                    }
                } else {
                    self.stop().await;
                }
            }
            RunState::Terminate => self.stop().await,
            // Every sender is gone, nothing left to forward
            RunState::Running => {}
        }

        tracing::debug!(queue = %self.name, "Pump stopped");
        self.done.send_replace(true);
    }

    /// Forward items until a stop is requested; returns the request.
    async fn forward_until_stopped(&mut self) -> RunState {
        loop {
            let state = *self.control.borrow_and_update();
            if state != RunState::Running {
                return state;
            }

            let item = tokio::select! {
                biased;
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return RunState::Running;
                    }
                    continue;
                }
                item = self.receiver.recv() => item,
            };

            match item {
                Some(buffered) => {
                    if !self.forward(buffered.take()).await {
                        return RunState::Terminate;
                    }
                }
                None => return RunState::Running,
            }
        }
    }

    /// Forward what is left in the closed buffer. False when a terminate
    /// request interrupted the drain.
    async fn drain(&mut self) -> bool {
        self.receiver.close();
        let mut drained = 0usize;

        loop {
            let item = tokio::select! {
                biased;
                _ = wait_for_terminate(&mut self.control) => return false,
                item = self.receiver.recv() => item,
            };
            let Some(buffered) = item else {
                break;
            };
            if !self.forward(buffered.take()).await {
                return false;
            }
            drained += 1;
        }

        tracing::debug!(queue = %self.name, drained, "Wrapped queue buffer drained");
        true
    }

    async fn stop(&mut self) {
        self.receiver.close();
        let mut discarded = 0u64;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            QueueMetrics::record_discarded(&self.name, discarded);
            tracing::warn!(
                queue = %self.name,
                discarded,
                "Wrapped queue terminated with buffered items"
            );
        }

        self.inner.terminate();
        if let Some(stoppable) = &self.stoppable {
            stoppable.terminate().await;
        }
    }

    /// Push one item into the backend. False when a terminate request
    /// interrupted a blocked push.
    async fn forward(&mut self, item: T) -> bool {
        let result = tokio::select! {
            biased;
            _ = wait_for_terminate(&mut self.control) => return false,
            result = self.backend.push(item) => result,
        };

        if let Err(err) = result {
            QueueMetrics::record_forward_failure(&self.name);
            tracing::warn!(
                queue = %self.name,
                backend = %self.backend.name(),
                error = %err,
                "Failed to forward buffered item, dropping it"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    use crate::queue::ChannelQueue;

    fn registry_failing(failures: u32) -> (Arc<BackendRegistry<String>>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = BackendRegistry::new();
        registry.register(QueueType::MEMORY, move |handler, config, exemplar| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call <= failures {
                    return Err(QueueError::Unavailable);
                }
                let queue = ChannelQueue::from_config(handler, &config, exemplar)?;
                Ok::<_, QueueError>(Arc::new(queue) as Arc<dyn Queue<String>>)
            }
        });
        (Arc::new(registry), calls)
    }

    fn channel_handler() -> (HandlerFn<String>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: HandlerFn<String> = Arc::new(move |item: String| {
            let _ = tx.send(item);
        });
        (handler, rx)
    }

    fn wrapped_config(max_attempts: u32) -> WrappedQueueConfig {
        WrappedQueueConfig {
            max_attempts,
            name: "jobs".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_json() {
        let config: WrappedQueueConfig = serde_json::from_value(json!({
            "underlying": "redis",
            "timeout_ms": 1500,
            "max_attempts": -1,
            "config": {"key": "jobs"},
        }))
        .unwrap();

        assert_eq!(config.underlying, QueueType::redis());
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.queue_length, 100);
        assert_eq!(config.config["key"], "jobs");
    }

    #[test]
    fn test_negative_timeout_is_unbounded() {
        let config: WrappedQueueConfig =
            serde_json::from_value(json!({"timeout_ms": -20})).unwrap();
        assert!(config.timeout.is_zero());
    }

    #[tokio::test]
    async fn test_name_has_wrapper_suffix() {
        let (registry, _) = registry_failing(0);
        let (handler, _rx) = channel_handler();
        let queue = WrappedQueue::new(registry, handler, wrapped_config(0), None);

        assert_eq!(queue.name(), "jobs-wrapper");
    }

    #[tokio::test]
    async fn test_stop_before_ready_is_noop() {
        let (registry, calls) = registry_failing(0);
        let (handler, _rx) = channel_handler();
        let queue = WrappedQueue::new(registry, handler, wrapped_config(0), None);
        queue.push("kept".to_string()).await.unwrap();

        queue.shutdown().await;
        queue.terminate().await;

        assert!(!queue.is_ready());
        assert_eq!(queue.buffered(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        queue.push("still accepted".to_string()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_buffer_after_transient_failures() {
        let (registry, calls) = registry_failing(2);
        let (handler, mut rx) = channel_handler();
        let queue = Arc::new(WrappedQueue::new(registry, handler, wrapped_config(5), None));

        for item in ["one", "two", "three"] {
            queue.push(item.to_string()).await.unwrap();
        }

        let lifecycle = Lifecycle::new();
        let runner = {
            let queue = queue.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                queue
                    .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
                    .await
            })
        };

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.attempts(), 3);
        assert!(queue.is_ready());

        queue.push("four".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("four"));

        lifecycle.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_exhausted_attempts() {
        let (registry, calls) = registry_failing(u32::MAX);
        let (handler, _rx) = channel_handler();
        let queue = WrappedQueue::new(registry, handler, wrapped_config(2), None);
        let lifecycle = Lifecycle::new();

        let err = queue
            .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.starter_state(), StarterState::Failed);
    }

    #[tokio::test]
    async fn test_exemplar_mismatch_is_not_buffered() {
        let registry = Arc::new(BackendRegistry::<Value>::with_defaults());
        let handler: HandlerFn<Value> = Arc::new(|_item: Value| {});
        let queue = WrappedQueue::new(
            registry,
            handler,
            wrapped_config(0),
            Some(json!({"repo_id": 0})),
        );

        let err = queue.push(json!(["not", "a", "repo"])).await.unwrap_err();

        assert!(matches!(
            err,
            QueueError::ShapeMismatch { ref name, .. } if name == "jobs-wrapper"
        ));
        assert_eq!(queue.buffered(), 0);
    }

    /// Backend recording what reaches it and how it was stopped.
    struct ScriptedQueue {
        delivered: mpsc::UnboundedSender<String>,
        rejected: &'static [&'static str],
        stall: bool,
        stops: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Queue<String> for ScriptedQueue {
        async fn push(&self, item: String) -> Result<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.rejected.contains(&item.as_str()) {
                return Err(QueueError::Backend(format!("rejected {item}")));
            }
            let _ = self.delivered.send(item);
            Ok(())
        }

        async fn run(&self, at_shutdown: &Hooks, at_terminate: &Hooks) -> Result<()> {
            let (stop, mut stopped) = watch::channel(false);
            let stop = Arc::new(stop);
            let on_terminate = Arc::clone(&stop);
            at_shutdown.register(move || {
                stop.send_replace(true);
            });
            at_terminate.register(move || {
                on_terminate.send_replace(true);
            });
            let _ = stopped.wait_for(|stopped| *stopped).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn stoppable(self: Arc<Self>) -> Option<Arc<dyn Stoppable>> {
            Some(self)
        }
    }

    #[async_trait]
    impl Stoppable for ScriptedQueue {
        async fn shutdown(&self) {
            self.stops.lock().unwrap().push("shutdown");
        }

        async fn terminate(&self) {
            self.stops.lock().unwrap().push("terminate");
        }
    }

    struct Scripted {
        registry: Arc<BackendRegistry<String>>,
        delivered: mpsc::UnboundedReceiver<String>,
        stops: Arc<Mutex<Vec<&'static str>>>,
    }

    fn scripted_registry(rejected: &'static [&'static str], stall: bool) -> Scripted {
        let (tx, delivered) = mpsc::unbounded_channel();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let backend_stops = stops.clone();
        let registry = BackendRegistry::new();
        registry.register(QueueType::MEMORY, move |_handler, _config, _exemplar| {
            let backend = ScriptedQueue {
                delivered: tx.clone(),
                rejected,
                stall,
                stops: backend_stops.clone(),
            };
            async move { Ok::<_, QueueError>(Arc::new(backend) as Arc<dyn Queue<String>>) }
        });
        Scripted {
            registry: Arc::new(registry),
            delivered,
            stops,
        }
    }

    fn spawn_run(
        queue: &Arc<WrappedQueue<String>>,
        lifecycle: &Lifecycle,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let queue = queue.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            queue
                .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_push_waits_for_pump() {
        let (registry, _) = registry_failing(0);
        let (handler, mut rx) = channel_handler();
        let config = WrappedQueueConfig {
            queue_length: 0,
            ..wrapped_config(0)
        };
        let queue = Arc::new(WrappedQueue::new(registry, handler, config, None));

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push("handoff".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pusher.is_finished());

        let lifecycle = Lifecycle::new();
        let runner = spawn_run(&queue, &lifecycle);

        pusher.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("handoff"));

        lifecycle.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_push_fails_when_discarded() {
        let Scripted {
            registry, stops, ..
        } = scripted_registry(&[], true);
        let (handler, _rx) = channel_handler();
        let config = WrappedQueueConfig {
            queue_length: 0,
            name: "handoff-discard".to_string(),
            ..Default::default()
        };
        let queue = Arc::new(WrappedQueue::new(registry, handler, config, None));
        let lifecycle = Lifecycle::new();
        let runner = spawn_run(&queue, &lifecycle);

        // The first item blocks the backend, the second waits in the buffer
        queue.push("stuck".to_string()).await.unwrap();
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push("waiting".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pusher.is_finished());

        queue.terminate().await;

        let err = pusher.await.unwrap().unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
        assert_eq!(*stops.lock().unwrap(), vec!["terminate"]);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_after_ready_discards_buffer() {
        let Scripted {
            registry, stops, ..
        } = scripted_registry(&[], true);
        let (handler, _rx) = channel_handler();
        let config = WrappedQueueConfig {
            name: "halted".to_string(),
            ..Default::default()
        };
        let queue = Arc::new(WrappedQueue::new(registry, handler, config, None));
        for item in ["a", "b", "c"] {
            queue.push(item.to_string()).await.unwrap();
        }

        let lifecycle = Lifecycle::new();
        let runner = spawn_run(&queue, &lifecycle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_ready());

        let discarded = crate::metrics::ITEMS_DISCARDED_TOTAL
            .with_label_values(&["halted-wrapper"])
            .get();
        queue.terminate().await;

        // "a" was in flight when the terminate arrived
        assert_eq!(
            crate::metrics::ITEMS_DISCARDED_TOTAL
                .with_label_values(&["halted-wrapper"])
                .get(),
            discarded + 2
        );
        assert_eq!(*stops.lock().unwrap(), vec!["terminate"]);
        runner.await.unwrap().unwrap();

        let err = queue.push("late".to_string()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_failure_drops_only_that_item() {
        let Scripted {
            registry,
            mut delivered,
            stops,
        } = scripted_registry(&["bad"], false);
        let (handler, _rx) = channel_handler();
        let config = WrappedQueueConfig {
            name: "picky".to_string(),
            ..Default::default()
        };
        let queue = Arc::new(WrappedQueue::new(registry, handler, config, None));
        let failures = crate::metrics::FORWARD_FAILURES_TOTAL
            .with_label_values(&["picky-wrapper"])
            .get();

        for item in ["one", "bad", "two"] {
            queue.push(item.to_string()).await.unwrap();
        }
        let lifecycle = Lifecycle::new();
        let runner = spawn_run(&queue, &lifecycle);

        assert_eq!(delivered.recv().await.as_deref(), Some("one"));
        assert_eq!(delivered.recv().await.as_deref(), Some("two"));
        assert_eq!(
            crate::metrics::FORWARD_FAILURES_TOTAL
                .with_label_values(&["picky-wrapper"])
                .get(),
            failures + 1
        );

        queue.shutdown().await;
        assert_eq!(*stops.lock().unwrap(), vec!["shutdown"]);
        runner.await.unwrap().unwrap();
        assert!(delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let (registry, _) = registry_failing(0);
        let (handler, _rx) = channel_handler();
        let queue = WrappedQueue::new(registry, handler, wrapped_config(0), None);
        let lifecycle = Lifecycle::new();
        lifecycle.shutdown();

        queue
            .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
            .await
            .unwrap_err();
        let err = queue
            .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::AlreadyRunning(_)));
    }
}
