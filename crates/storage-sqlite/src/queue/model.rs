//! Database model for queued operations.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use fintrack_core::queue::{OperationKind, PendingOperation};
use fintrack_core::store::Collection;
use fintrack_core::{Error, Result};

#[derive(Queryable, Identifiable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::pending_operations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PendingOperationDB {
    pub id: i64,
    pub kind: String,
    pub collection: String,
    pub document_id: Option<String>,
    pub payload: String,
    pub owner_id: String,
    pub enqueued_at: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::pending_operations)]
pub struct NewPendingOperationDB {
    pub kind: String,
    pub collection: String,
    pub document_id: Option<String>,
    pub payload: String,
    pub owner_id: String,
    pub enqueued_at: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

fn corrupt(record_id: i64, what: &str, detail: impl std::fmt::Display) -> Error {
    Error::QueueStorage(format!("queue record {record_id} has a corrupt {what}: {detail}"))
}

impl TryFrom<PendingOperationDB> for PendingOperation {
    type Error = Error;

    fn try_from(row: PendingOperationDB) -> Result<PendingOperation> {
        let kind = OperationKind::parse(&row.kind).map_err(|e| corrupt(row.id, "kind", e))?;
        let collection =
            Collection::parse(&row.collection).map_err(|e| corrupt(row.id, "collection", e))?;
        let payload = match serde_json::from_str::<serde_json::Value>(&row.payload) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => return Err(corrupt(row.id, "payload", format!("not an object: {other}"))),
            Err(e) => return Err(corrupt(row.id, "payload", e)),
        };
        let enqueued_at = DateTime::parse_from_rfc3339(&row.enqueued_at)
            .map_err(|e| corrupt(row.id, "timestamp", e))?
            .with_timezone(&Utc);

        Ok(PendingOperation {
            id: row.id,
            kind,
            collection,
            document_id: row.document_id,
            payload,
            owner_id: row.owner_id,
            enqueued_at,
            retry_count: row.retry_count,
            last_error: row.last_error,
        })
    }
}
