//! Key-value store backends: Redis for deployments, in-memory for tests and
//! single-process runs.

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryStore;
pub use self::redis::RedisStore;
pub use traits::{KeyValueStore, StorageError};
