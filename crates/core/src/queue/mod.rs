//! Local durable queue contract and pending-operation model.
//!
//! The queue persists mutation intents that could not (or should not yet) be
//! applied to the remote store. Records replay in FIFO enqueue order so a
//! create-then-update on the same logical entity keeps its causal order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accounts::{AccountUpdate, NewAccount};
use crate::categories::{CategoryUpdate, NewCategory};
use crate::errors::{Error, Result};
use crate::goals::{GoalUpdate, NewGoal};
use crate::store::{Collection, DocumentBody};
use crate::transactions::{NewTransaction, TransactionUpdate};

mod memory;

pub use memory::MemoryPendingQueue;

/// Kind of mutation a queue record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::Internal(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// A queued mutation intent. Exactly one record per logical mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Monotonically increasing id scoped to the local store.
    pub id: i64,
    pub kind: OperationKind,
    pub collection: Collection,
    /// Target document id; required for update/delete.
    pub document_id: Option<String>,
    pub payload: DocumentBody,
    pub owner_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// Payload for enqueueing a new record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingOperation {
    pub kind: OperationKind,
    pub collection: Collection,
    pub document_id: Option<String>,
    pub payload: DocumentBody,
    pub owner_id: String,
}

impl NewPendingOperation {
    /// Strips null-valued payload keys and validates the payload shape
    /// against (kind, collection). Implementations call this before
    /// persisting, so malformed payloads are caught at enqueue time rather
    /// than at replay.
    pub fn prepare(mut self) -> Result<Self> {
        strip_null_keys(&mut self.payload);
        validate_payload(
            self.kind,
            self.collection,
            self.document_id.as_deref(),
            &self.payload,
        )?;
        Ok(self)
    }
}

/// Removes keys whose value is an explicit null. Persisting them would fail
/// downstream schema checks on replay.
pub fn strip_null_keys(payload: &mut DocumentBody) {
    payload.retain(|_, value| !value.is_null());
}

/// Checks that `payload` is structurally valid for the target collection's
/// schema. Used at enqueue time and again by the gateway at replay.
pub fn validate_payload(
    kind: OperationKind,
    collection: Collection,
    document_id: Option<&str>,
    payload: &DocumentBody,
) -> Result<()> {
    if matches!(kind, OperationKind::Update | OperationKind::Delete)
        && document_id.map(str::is_empty).unwrap_or(true)
    {
        return Err(Error::validation(format!(
            "{} {} requires a target document id",
            kind.as_str(),
            collection
        )));
    }
    if kind == OperationKind::Delete {
        return Ok(());
    }

    let value = Value::Object(payload.clone());
    let outcome = match (kind, collection) {
        (OperationKind::Create, Collection::Accounts) => {
            serde_json::from_value::<NewAccount>(value).map(|_| ())
        }
        (OperationKind::Create, Collection::Transactions) => {
            serde_json::from_value::<NewTransaction>(value).map(|_| ())
        }
        (OperationKind::Create, Collection::Categories) => {
            serde_json::from_value::<NewCategory>(value).map(|_| ())
        }
        (OperationKind::Create, Collection::Goals) => {
            serde_json::from_value::<NewGoal>(value).map(|_| ())
        }
        (OperationKind::Update, Collection::Accounts) => {
            serde_json::from_value::<AccountUpdate>(value).map(|_| ())
        }
        (OperationKind::Update, Collection::Transactions) => {
            serde_json::from_value::<TransactionUpdate>(value).map(|_| ())
        }
        (OperationKind::Update, Collection::Categories) => {
            serde_json::from_value::<CategoryUpdate>(value).map(|_| ())
        }
        (OperationKind::Update, Collection::Goals) => {
            serde_json::from_value::<GoalUpdate>(value).map(|_| ())
        }
        (OperationKind::Delete, _) => Ok(()),
    };
    outcome.map_err(|e| {
        Error::validation(format!(
            "payload is not a valid {} {}: {e}",
            collection,
            kind.as_str()
        ))
    })
}

/// Local durable queue contract.
///
/// Reads are synchronous; writes are async and must be durable before they
/// return. A write that cannot reach the local store fails loudly with
/// [`Error::QueueStorage`] — losing a queued mutation is worse than surfacing
/// an error.
#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// Persists a record and returns its queue id.
    async fn enqueue(&self, op: NewPendingOperation) -> Result<i64>;

    /// All current records, FIFO by enqueue timestamp (id as tiebreak).
    fn dequeue_all_ordered(&self) -> Result<Vec<PendingOperation>>;

    /// Idempotent: removing a missing id is a no-op.
    async fn remove(&self, queue_id: i64) -> Result<()>;

    /// Persists retry bookkeeping without moving the record's replay position.
    async fn update_retry(&self, queue_id: i64, retry_count: i32, last_error: &str) -> Result<()>;

    /// Number of queued records, for the UI pending badge.
    fn count(&self) -> Result<i64>;
}
