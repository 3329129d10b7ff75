//! meta-sentinel - failover-aware access layer for a Redis-backed metadata store
//!
//! The metadata store runs as a primary/replica deployment supervised by
//! Redis Sentinel. This crate provides:
//!
//! - [`SentinelClient`]: tracks the current primary and replica set by
//!   querying the Sentinels, polls for changes in a background task and
//!   notifies subscribers.
//! - [`ConnectionPool`]: one write connection to the primary and
//!   round-robin read connections to the replicas, re-pointed on failover.
//! - [`SentinelMetaStore`]: the [`MetaStore`] interface routed through the
//!   pool, retrying once after a refresh on transport failures.
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod metastore;
pub mod pool;
pub mod sentinel;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::{Endpoint, NodeInfo, NodeRole, TopologySnapshot};
pub use crate::error::{HaError, HaResult, StoreError};
pub use crate::metastore::redis::RedisMetaOps;
pub use crate::metastore::sentinel::SentinelMetaStore;
pub use crate::metastore::{MetaStore, MetaStoreOps};
pub use crate::pool::{ConnectionHandle, ConnectionPool, PoolOptions};
pub use crate::sentinel::{SentinelClient, SentinelOptions};
