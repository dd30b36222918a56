//! In-memory [`PendingQueue`] backend for tests and previews.
//!
//! Durability is the sqlite implementation's job; this one only honors the
//! ordering, id, and bookkeeping contracts.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{Error, Result};

use super::{NewPendingOperation, PendingOperation, PendingQueue};

#[derive(Default)]
struct Inner {
    next_id: i64,
    records: Vec<PendingOperation>,
}

#[derive(Default)]
pub struct MemoryPendingQueue {
    inner: Mutex<Inner>,
    /// When true, every operation fails with a queue-storage error.
    broken: std::sync::atomic::AtomicBool,
}

impl MemoryPendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unavailable local store.
    pub fn set_broken(&self, broken: bool) {
        self.broken
            .store(broken, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::QueueStorage("local store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: store a record exactly as given (a fresh id is assigned),
    /// bypassing enqueue-time validation the way a legacy store might hold a
    /// malformed payload.
    #[cfg(test)]
    pub(crate) fn inject_raw(&self, mut op: PendingOperation) -> i64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        op.id = inner.next_id;
        let assigned = op.id;
        inner.records.push(op);
        assigned
    }
}

#[async_trait]
impl PendingQueue for MemoryPendingQueue {
    async fn enqueue(&self, op: NewPendingOperation) -> Result<i64> {
        self.check()?;
        let op = op.prepare()?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(PendingOperation {
            id,
            kind: op.kind,
            collection: op.collection,
            document_id: op.document_id,
            payload: op.payload,
            owner_id: op.owner_id,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        });
        Ok(id)
    }

    fn dequeue_all_ordered(&self) -> Result<Vec<PendingOperation>> {
        self.check()?;
        let mut records = self.lock().records.clone();
        records.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn remove(&self, queue_id: i64) -> Result<()> {
        self.check()?;
        self.lock().records.retain(|r| r.id != queue_id);
        Ok(())
    }

    async fn update_retry(&self, queue_id: i64, retry_count: i32, last_error: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        if let Some(record) = inner.records.iter_mut().find(|r| r.id == queue_id) {
            record.retry_count = retry_count;
            record.last_error = Some(last_error.to_string());
        }
        Ok(())
    }

    fn count(&self) -> Result<i64> {
        self.check()?;
        Ok(self.lock().records.len() as i64)
    }
}
