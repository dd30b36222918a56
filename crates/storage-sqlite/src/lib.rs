//! SQLite implementation of the local durable queue.
//!
//! All writes flow through a dedicated write actor, so a mutation is
//! committed to disk before its call returns; reads go straight to the pool.

pub mod db;
pub mod errors;
pub mod queue;
pub mod schema;

pub use db::{create_pool, get_connection, spawn_write_actor, DbPool, WriteHandle};
pub use errors::StorageError;
pub use queue::SqlitePendingQueue;
