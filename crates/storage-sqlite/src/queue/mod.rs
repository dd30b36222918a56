//! SQLite repository for the pending-operations queue.

mod model;
mod repository;

pub use model::{NewPendingOperationDB, PendingOperationDB};
pub use repository::SqlitePendingQueue;
