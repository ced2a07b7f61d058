//! Storage backends for rate limit counters.
//!
//! `InMemoryStorage` keeps counters in the process and relies on the limiter
//! to evict outdated windows. `RedisStorage` (feature `redis`) shares
//! counters across processes and lets Redis expire them.

mod memory;
#[cfg(feature = "redis")]
mod redis_storage;

pub use memory::InMemoryStorage;
#[cfg(feature = "redis")]
pub use redis_storage::{RedisStorage, RedisStorageConfig};
