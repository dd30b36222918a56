//! HTTP client for a remote document-database API, implementing the sync
//! core's document-store contract (CRUD by id, owner-scoped queries, atomic
//! commits with version preconditions, and a polling change feed).

pub mod client;
pub mod error;

pub use client::{HttpDocumentStore, API_URL_ENV};
pub use error::{ApiRetryClass, RemoteStoreError};
