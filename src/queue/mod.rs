//! Pluggable work queues with delayed backend startup.
//!
//! Callers ask the [`QueueFactory`] for a queue and push items into it without
//! knowing which backend serves them or whether that backend was reachable at
//! startup. Backends are registered by [`QueueType`] in a [`BackendRegistry`]:
//!
//! - `memory`: [`ChannelQueue`], a bounded in-process channel
//! - `redis`: [`RedisQueue`], a Redis list (see [`register_redis_backend`])
//!
//! When the backend cannot be built right away the factory hands out a
//! [`WrappedQueue`] that buffers pushes and retries construction with a
//! [`DelayedStarter`] once `run` is called.

mod backend;
mod delayed;
mod factory;
mod manager;
mod memory_backend;
mod redis_backend;
mod registry;
mod wrapped;

pub use backend::{parse_backend_config, HandlerFn, Queue, QueueItem, QueueType, Stoppable};
pub use delayed::{
    DelayedStarter, StarterConfig, StarterState, DEFAULT_BACKOFF, TIMEOUT_SAFETY_MARGIN,
};
pub use factory::QueueFactory;
pub use manager::{ManagedQueue, QueueInfo, QueueManager};
pub use memory_backend::{ChannelQueue, MemoryQueueConfig};
pub use redis_backend::{register_redis_backend, RedisQueue, RedisQueueConfig};
pub use registry::{BackendRegistry, Constructor};
pub use wrapped::{WrappedQueue, WrappedQueueConfig};
