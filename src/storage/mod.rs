//! Storage backends: the volatile balance cache and the durable store.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{InMemoryCache, InMemoryStore};
pub use redis::RedisCache;
pub use sql::SqlStore;
pub use traits::{CacheStore, DurableStore, StorageError, UpsertOutcome};
