//! fintrack-core: the offline-first mutation queue and synchronization engine
//! behind the finance tracker.
//!
//! Writes flow UI → facade → gateway (online) or durable queue (offline / on
//! failure); the queue processor replays queued intents in FIFO order once
//! connectivity returns, and the change listener reconciles optimistic local
//! state with server-confirmed snapshots.

pub mod accounts;
pub mod categories;
pub mod connectivity;
pub mod errors;
pub mod facade;
pub mod gateway;
pub mod goals;
pub mod listener;
pub mod processor;
pub mod queue;
pub mod store;
pub mod transactions;

pub use errors::{Error, Result};
