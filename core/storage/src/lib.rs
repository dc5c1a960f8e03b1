//! Storage layer for fleetsync.
//!
//! This module provides a uniform storage handle over two physically different
//! backends (PostgreSQL for connected deployments, SQLite for disconnected
//! nodes), the dialect shim that centralizes every backend-specific SQL
//! fragment, the logical schema, and the deployment mode provider that binds
//! the process to exactly one backend at startup.
//!
//! # Design Principles
//! - Backend isolation: no code outside `dialect` and the two store modules
//!   knows which backend it is talking to
//! - One logical schema, rendered per backend
//! - Async operations: all I/O is async; SQLite work runs on the blocking pool

pub mod changes;
pub mod config;
pub mod dialect;
pub mod mode;
pub mod postgres;
pub mod provider;
pub mod replica;
pub mod schema;
pub mod sqlite;
pub mod value;

pub use changes::{Change, ChangeLog, ChangeOp, PendingChange};
pub use config::{PoolSettings, ReplicaSettings, StorageConfig};
pub use dialect::{validate_identifier, ColumnType, Dialect, JsonPath, PathSegment};
pub use mode::StorageContext;
pub use postgres::PostgresStore;
pub use provider::Store;
pub use replica::{HttpReplicator, ReplicationDirection, ReplicationReport, Replicator};
pub use schema::{ensure_schema, Table, SCHEMA};
pub use sqlite::SqliteStore;
pub use value::{Row, SqlValue};
