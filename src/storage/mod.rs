//! Distributed-tier storage backends.

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryStore;
pub use self::redis::RedisStore;
pub use traits::{ttl_secs, DistributedStore, StorageError};
