//! Registry of live queue instances for introspection and coordinated stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::metrics::ManagerMetrics;

use super::backend::{QueueType, Stoppable};

/// A queue known to the manager.
#[derive(Clone)]
pub struct ManagedQueue {
    pub id: u64,
    pub name: String,
    pub queue_type: QueueType,
    pub config: Value,
    /// `Debug` rendering of the exemplar, if any
    pub exemplar: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Queue owning this one; owned queues are stopped through their parent
    pub parent: Option<u64>,
    pub stoppable: Option<Arc<dyn Stoppable>>,
}

impl ManagedQueue {
    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            id: self.id,
            name: self.name.clone(),
            queue_type: self.queue_type.clone(),
            config: self.config.clone(),
            exemplar: self.exemplar.clone(),
            created_at: self.created_at,
            parent: self.parent,
            stoppable: self.stoppable.is_some(),
        }
    }
}

/// Serializable snapshot of a [`ManagedQueue`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub id: u64,
    pub name: String,
    pub queue_type: QueueType,
    pub config: Value,
    pub exemplar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub parent: Option<u64>,
    pub stoppable: bool,
}

/// Live queues keyed by a monotonically increasing id.
///
/// Entries are never removed.
pub struct QueueManager {
    next_id: AtomicU64,
    queues: DashMap<u64, ManagedQueue>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queues: DashMap::new(),
        }
    }

    /// Register a queue and return its id.
    pub fn add(
        &self,
        name: impl Into<String>,
        queue_type: QueueType,
        config: Value,
        exemplar: Option<String>,
        stoppable: Option<Arc<dyn Stoppable>>,
    ) -> u64 {
        self.insert(None, name.into(), queue_type, config, exemplar, stoppable)
    }

    /// Register a queue owned by the queue `parent`, such as the backend a
    /// wrapper built late.
    ///
    /// Owned queues are listed but skipped by `shutdown_all` and
    /// `terminate_all`; the parent forwards those calls itself.
    pub fn add_child(
        &self,
        parent: u64,
        name: impl Into<String>,
        queue_type: QueueType,
        config: Value,
        exemplar: Option<String>,
        stoppable: Option<Arc<dyn Stoppable>>,
    ) -> u64 {
        self.insert(Some(parent), name.into(), queue_type, config, exemplar, stoppable)
    }

    fn insert(
        &self,
        parent: Option<u64>,
        name: String,
        queue_type: QueueType,
        config: Value,
        exemplar: Option<String>,
        stoppable: Option<Arc<dyn Stoppable>>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ManagedQueue {
            id,
            name,
            queue_type,
            config,
            exemplar,
            created_at: Utc::now(),
            parent,
            stoppable,
        };

        ManagerMetrics::record_registered(entry.queue_type.as_str());
        tracing::debug!(
            id,
            parent,
            queue = %entry.name,
            queue_type = %entry.queue_type,
            "Queue registered with manager"
        );

        self.queues.insert(id, entry);
        id
    }

    pub fn get(&self, id: u64) -> Option<ManagedQueue> {
        self.queues.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every queue, ordered by id.
    pub fn list(&self) -> Vec<QueueInfo> {
        let mut infos: Vec<QueueInfo> = self.queues.iter().map(|entry| entry.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn stoppables(&self) -> Vec<(String, Arc<dyn Stoppable>)> {
        // Collect first so no map shard is locked across an await
        self.queues
            .iter()
            .filter(|entry| entry.parent.is_none())
            .filter_map(|entry| {
                entry
                    .stoppable
                    .clone()
                    .map(|stoppable| (entry.name.clone(), stoppable))
            })
            .collect()
    }

    /// Shut down every stoppable queue. Returns how many were asked.
    pub async fn shutdown_all(&self) -> usize {
        let targets = self.stoppables();
        let count = targets.len();

        join_all(targets.iter().map(|(name, stoppable)| async move {
            tracing::debug!(queue = %name, "Shutting down queue");
            stoppable.shutdown().await;
        }))
        .await;

        count
    }

    /// Terminate every stoppable queue. Returns how many were asked.
    pub async fn terminate_all(&self) -> usize {
        let targets = self.stoppables();
        let count = targets.len();

        join_all(targets.iter().map(|(name, stoppable)| async move {
            tracing::debug!(queue = %name, "Terminating queue");
            stoppable.terminate().await;
        }))
        .await;

        count
    }
}
