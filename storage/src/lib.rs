//! # Storage Layer
//!
//! Dual-tier call-state persistence: a Redis fast cache in front of a
//! PostgreSQL system of record, plus in-memory tiers for tests and
//! single-node runs.

pub mod backend;
pub mod call_state;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod telemetry;

pub use backend::{CallCache, DurableCallStore};
pub use call_state::{CallStateStore, END_REASON_KEY};
pub use memory::{InMemoryCallCache, InMemoryCallStore};
pub use postgres::PostgresCallStore;
pub use redis::RedisCallCache;
