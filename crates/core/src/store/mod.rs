//! Remote document store contract.
//!
//! The sync core treats the backing store as a key-partitioned document
//! database: CRUD by document id, equality queries scoped by owner, atomic
//! multi-document commits with optional version preconditions, and a
//! change-subscription primitive delivering full result-set snapshots.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{Error, Result};

mod memory;

pub use memory::MemoryDocumentStore;

/// Logical collections the sync core writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Accounts,
    Transactions,
    Categories,
    Goals,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Accounts,
        Collection::Transactions,
        Collection::Categories,
        Collection::Goals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Accounts => "accounts",
            Collection::Transactions => "transactions",
            Collection::Categories => "categories",
            Collection::Goals => "goals",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "accounts" => Ok(Collection::Accounts),
            "transactions" => Ok(Collection::Transactions),
            "categories" => Ok(Collection::Categories),
            "goals" => Ok(Collection::Goals),
            other => Err(Error::Internal(format!("unknown collection '{other}'"))),
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON object body of a stored document.
pub type DocumentBody = serde_json::Map<String, serde_json::Value>;

/// Serialize a domain value into a document body.
pub fn to_document_body<T: Serialize>(value: &T) -> Result<DocumentBody> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Internal(format!(
            "expected an object body, got {other}"
        ))),
    }
}

/// A document as held by the remote store. `version` increases by one on
/// every write and backs optimistic-concurrency preconditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub body: DocumentBody,
}

impl Document {
    /// String field accessor, `None` when absent or not a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(|v| v.as_str())
    }

    /// Owner id recorded on the document, `None` for shared records.
    pub fn owner_id(&self) -> Option<&str> {
        self.str_field("ownerId")
    }
}

/// One write inside an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        collection: Collection,
        id: String,
        body: DocumentBody,
    },
    /// Shallow-merges `patch` into the stored body.
    Update {
        collection: Collection,
        id: String,
        patch: DocumentBody,
        /// When set, the commit fails with `Error::Conflict` unless the
        /// stored document still has this version.
        expect_version: Option<i64>,
    },
    Delete {
        collection: Collection,
        id: String,
        expect_version: Option<i64>,
    },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Insert { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => *collection,
        }
    }
}

/// Owner scoping for queries and subscriptions. `include_shared` additionally
/// matches documents with no owner (system defaults).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerScope {
    pub owner_id: String,
    pub include_shared: bool,
}

impl OwnerScope {
    pub fn owned(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            include_shared: false,
        }
    }

    pub fn with_shared(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            include_shared: true,
        }
    }

    pub fn matches(&self, owner: Option<&str>) -> bool {
        match owner {
            Some(owner) => owner == self.owner_id,
            None => self.include_shared,
        }
    }
}

/// Full result-set snapshot delivered on any matching document change.
#[derive(Debug, Clone)]
pub struct ChangeSnapshot {
    pub collection: Collection,
    /// Monotonically increasing per subscription.
    pub version: u64,
    pub documents: Vec<Document>,
}

/// Receiving half of a change subscription. Dropping it ends delivery.
pub struct ChangeFeed {
    pub receiver: mpsc::UnboundedReceiver<ChangeSnapshot>,
}

/// Contract the sync core requires from the remote document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Equality query by owner, ordered by document id.
    async fn list_by_owner(&self, collection: Collection, scope: &OwnerScope)
        -> Result<Vec<Document>>;

    /// Applies all ops atomically: either every op is applied or none is.
    /// Version preconditions are checked against the pre-commit state.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Subscribes to change notifications for `collection` within `scope`.
    /// The current result set is delivered as the first snapshot.
    async fn subscribe(&self, collection: Collection, scope: &OwnerScope) -> Result<ChangeFeed>;
}
