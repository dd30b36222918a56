//! SQLite-backed implementation of the local durable queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use diesel::prelude::*;

use fintrack_core::queue::{NewPendingOperation, PendingOperation, PendingQueue};
use fintrack_core::Result;

use crate::db::{create_pool, get_connection, spawn_write_actor, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::pending_operations;

use super::model::{NewPendingOperationDB, PendingOperationDB};

pub struct SqlitePendingQueue {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqlitePendingQueue {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    /// Opens (or creates) the backing database, runs pending migrations, and
    /// spins up the write actor.
    pub fn open(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url)?;
        let writer = spawn_write_actor(pool.clone());
        Ok(Self::new(pool, writer))
    }
}

#[async_trait]
impl PendingQueue for SqlitePendingQueue {
    async fn enqueue(&self, op: NewPendingOperation) -> Result<i64> {
        let op = op.prepare()?;
        let row = NewPendingOperationDB {
            kind: op.kind.as_str().to_string(),
            collection: op.collection.as_str().to_string(),
            document_id: op.document_id,
            payload: serde_json::to_string(&op.payload)?,
            owner_id: op.owner_id,
            // Fixed-width form so the timestamp ordering matches its
            // lexicographic ordering.
            enqueued_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            retry_count: 0,
            last_error: None,
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(pending_operations::table)
                    .values(&row)
                    .returning(pending_operations::id)
                    .get_result::<i64>(conn)
                    .map_err(|e| StorageError::from(e).into())
            })
            .await
    }

    fn dequeue_all_ordered(&self) -> Result<Vec<PendingOperation>> {
        use crate::schema::pending_operations::dsl::{enqueued_at, id};

        let mut conn = get_connection(&self.pool)?;
        let rows = pending_operations::table
            .order((enqueued_at.asc(), id.asc()))
            .load::<PendingOperationDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(PendingOperation::try_from).collect()
    }

    async fn remove(&self, queue_id: i64) -> Result<()> {
        self.writer
            .exec(move |conn| {
                // Zero affected rows for a missing id is the idempotence the
                // contract asks for.
                diesel::delete(pending_operations::table.find(queue_id))
                    .execute(conn)
                    .map_err(|e| StorageError::from(e).into())
                    .map(|_| ())
            })
            .await
    }

    async fn update_retry(
        &self,
        queue_id: i64,
        new_retry_count: i32,
        new_last_error: &str,
    ) -> Result<()> {
        use crate::schema::pending_operations::dsl::{last_error, retry_count};

        let message = new_last_error.to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(pending_operations::table.find(queue_id))
                    .set((
                        retry_count.eq(new_retry_count),
                        last_error.eq(Some(message)),
                    ))
                    .execute(conn)
                    .map_err(|e| StorageError::from(e).into())
                    .map(|_| ())
            })
            .await
    }

    fn count(&self) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        pending_operations::table
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(|e| StorageError::from(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintrack_core::queue::OperationKind;
    use fintrack_core::store::Collection;
    use fintrack_core::Error;
    use serde_json::json;
    use tempfile::TempDir;

    fn queue_in(dir: &TempDir) -> SqlitePendingQueue {
        let path = dir.path().join("queue.db");
        SqlitePendingQueue::open(path.to_str().unwrap()).expect("open queue")
    }

    fn goal_delete(target: &str) -> NewPendingOperation {
        NewPendingOperation {
            kind: OperationKind::Delete,
            collection: Collection::Goals,
            document_id: Some(target.to_string()),
            payload: serde_json::Map::new(),
            owner_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_assigns_monotonic_ids_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir);

        let first = queue.enqueue(goal_delete("g1")).await.unwrap();
        let second = queue.enqueue(goal_delete("g2")).await.unwrap();
        assert!(second > first);

        let records = queue.dequeue_all_ordered().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, first);
        assert_eq!(records[1].id, second);
        assert_eq!(records[0].document_id.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = queue_in(&dir);
            queue.enqueue(goal_delete("g1")).await.unwrap();
        }
        let queue = queue_in(&dir);
        assert_eq!(queue.count().unwrap(), 1);
        let records = queue.dequeue_all_ordered().unwrap();
        assert_eq!(records[0].kind, OperationKind::Delete);
        assert_eq!(records[0].collection, Collection::Goals);
        assert_eq!(records[0].retry_count, 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir);
        let queue_id = queue.enqueue(goal_delete("g1")).await.unwrap();

        queue.remove(queue_id).await.unwrap();
        queue.remove(queue_id).await.unwrap();
        queue.remove(9999).await.unwrap();
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_bookkeeping_persists_without_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir);
        let first = queue.enqueue(goal_delete("g1")).await.unwrap();
        let second = queue.enqueue(goal_delete("g2")).await.unwrap();

        queue
            .update_retry(first, 3, "backend unavailable")
            .await
            .unwrap();

        let records = queue.dequeue_all_ordered().unwrap();
        assert_eq!(records[0].id, first);
        assert_eq!(records[0].retry_count, 3);
        assert_eq!(records[0].last_error.as_deref(), Some("backend unavailable"));
        assert_eq!(records[1].id, second);
        assert_eq!(records[1].retry_count, 0);
    }

    #[tokio::test]
    async fn null_valued_payload_keys_are_stripped_before_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir);

        let op = NewPendingOperation {
            kind: OperationKind::Create,
            collection: Collection::Transactions,
            document_id: None,
            payload: json!({
                "accountId": "a1",
                "type": "income",
                "amount": "25",
                "categoryId": "c1",
                "description": "salary",
                "date": "2026-08-01",
                "ownerId": "u1",
                "memo": null,
            })
            .as_object()
            .unwrap()
            .clone(),
            owner_id: "u1".to_string(),
        };
        queue.enqueue(op).await.unwrap();

        let records = queue.dequeue_all_ordered().unwrap();
        assert!(!records[0].payload.contains_key("memo"));
        assert_eq!(
            records[0].payload.get("description").unwrap().as_str(),
            Some("salary")
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_at_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir);

        let op = NewPendingOperation {
            kind: OperationKind::Update,
            collection: Collection::Goals,
            document_id: None,
            payload: serde_json::Map::new(),
            owner_id: "u1".to_string(),
        };
        let err = queue.enqueue(op).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(queue.count().unwrap(), 0);
    }
}
