//! Key-value state store: trait, key layout and backends.

pub mod in_memory;
pub mod keys;
pub mod redis_store;
pub mod store;

pub use in_memory::InMemoryKvStore;
pub use redis_store::RedisKvStore;
pub use store::{KvFuture, KvStore, KvWrite, PlanFault, TxnPlan};
