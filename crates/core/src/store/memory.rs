//! In-memory document store.
//!
//! Implements the full [`DocumentStore`] contract under a single lock, so
//! commits are serialized. Backs tests and previews, and doubles as an outage
//! simulator: while marked unavailable every operation fails with a transient
//! error, the way an unreachable backend would.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::errors::{Error, Result};

use super::{
    ChangeFeed, ChangeSnapshot, Collection, Document, DocumentBody, DocumentStore, OwnerScope,
    WriteOp,
};

#[derive(Debug, Clone)]
struct StoredDocument {
    version: i64,
    body: DocumentBody,
}

struct Subscriber {
    collection: Collection,
    scope: OwnerScope,
    sender: mpsc::UnboundedSender<ChangeSnapshot>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<Collection, BTreeMap<String, StoredDocument>>,
    subscribers: Vec<Subscriber>,
    snapshot_version: u64,
}

/// Serialized in-memory backend for the [`DocumentStore`] contract.
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage. While unavailable, every call returns a
    /// transient error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::transient("document store unreachable"))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only happens after a panic in another test thread;
        // the store has no invariants that survive that anyway.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of documents currently stored in `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        self.lock()
            .collections
            .get(&collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }
}

impl Inner {
    fn result_set(&self, collection: Collection, scope: &OwnerScope) -> Vec<Document> {
        self.collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, stored)| {
                        scope.matches(stored.body.get("ownerId").and_then(|v| v.as_str()))
                    })
                    .map(|(id, stored)| Document {
                        id: id.clone(),
                        version: stored.version,
                        body: stored.body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify(&mut self, touched: &[Collection]) {
        if touched.is_empty() {
            return;
        }
        self.snapshot_version += 1;
        let version = self.snapshot_version;
        let mut dropped = false;
        let snapshots: Vec<(usize, ChangeSnapshot)> = self
            .subscribers
            .iter()
            .enumerate()
            .filter(|(_, sub)| touched.contains(&sub.collection))
            .map(|(idx, sub)| {
                (
                    idx,
                    ChangeSnapshot {
                        collection: sub.collection,
                        version,
                        documents: self.result_set(sub.collection, &sub.scope),
                    },
                )
            })
            .collect();
        for (idx, snapshot) in snapshots {
            if self.subscribers[idx].sender.send(snapshot).is_err() {
                dropped = true;
            }
        }
        if dropped {
            self.subscribers.retain(|sub| !sub.sender.is_closed());
        }
    }

    fn precondition(&self, collection: Collection, id: &str, expect: Option<i64>) -> Result<()> {
        let Some(expected) = expect else {
            return Ok(());
        };
        let actual = self
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| stored.version);
        match actual {
            Some(version) if version == expected => Ok(()),
            Some(version) => Err(Error::Conflict(format!(
                "{collection}/{id}: expected version {expected}, found {version}"
            ))),
            None => Err(Error::Conflict(format!(
                "{collection}/{id}: expected version {expected}, document is gone"
            ))),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| Document {
                id: id.to_string(),
                version: stored.version,
                body: stored.body.clone(),
            }))
    }

    async fn list_by_owner(
        &self,
        collection: Collection,
        scope: &OwnerScope,
    ) -> Result<Vec<Document>> {
        self.check_available()?;
        Ok(self.lock().result_set(collection, scope))
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();

        // Validate every op against pre-commit state before applying any.
        for op in &ops {
            match op {
                WriteOp::Insert { collection, id, .. } => {
                    let exists = inner
                        .collections
                        .get(collection)
                        .map(|docs| docs.contains_key(id))
                        .unwrap_or(false);
                    if exists {
                        return Err(Error::Conflict(format!(
                            "{collection}/{id}: document already exists"
                        )));
                    }
                }
                WriteOp::Update {
                    collection,
                    id,
                    expect_version,
                    ..
                } => {
                    let exists = inner
                        .collections
                        .get(collection)
                        .map(|docs| docs.contains_key(id))
                        .unwrap_or(false);
                    if !exists {
                        return Err(Error::not_found(collection.as_str(), id.clone()));
                    }
                    inner.precondition(*collection, id, *expect_version)?;
                }
                WriteOp::Delete {
                    collection,
                    id,
                    expect_version,
                } => {
                    inner.precondition(*collection, id, *expect_version)?;
                }
            }
        }

        let mut touched = Vec::new();
        for op in ops {
            let collection = op.collection();
            if !touched.contains(&collection) {
                touched.push(collection);
            }
            let docs = inner.collections.entry(collection).or_default();
            match op {
                WriteOp::Insert { id, body, .. } => {
                    docs.insert(id, StoredDocument { version: 1, body });
                }
                WriteOp::Update { id, patch, .. } => {
                    if let Some(stored) = docs.get_mut(&id) {
                        for (key, value) in patch {
                            stored.body.insert(key, value);
                        }
                        stored.version += 1;
                    }
                }
                WriteOp::Delete { id, .. } => {
                    docs.remove(&id);
                }
            }
        }

        debug!("memory store commit touched {:?}", touched);
        inner.notify(&touched);
        Ok(())
    }

    async fn subscribe(&self, collection: Collection, scope: &OwnerScope) -> Result<ChangeFeed> {
        self.check_available()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.snapshot_version += 1;
        let initial = ChangeSnapshot {
            collection,
            version: inner.snapshot_version,
            documents: inner.result_set(collection, scope),
        };
        let _ = sender.send(initial);
        inner.subscribers.push(Subscriber {
            collection,
            scope: scope.clone(),
            sender,
        });
        Ok(ChangeFeed { receiver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> DocumentBody {
        value.as_object().expect("object").clone()
    }

    #[tokio::test]
    async fn commit_is_atomic_on_precondition_failure() {
        let store = MemoryDocumentStore::new();
        store
            .commit(vec![WriteOp::Insert {
                collection: Collection::Accounts,
                id: "a1".to_string(),
                body: body(json!({"ownerId": "u1", "balance": "0"})),
            }])
            .await
            .expect("seed");

        let result = store
            .commit(vec![
                WriteOp::Insert {
                    collection: Collection::Transactions,
                    id: "t1".to_string(),
                    body: body(json!({"ownerId": "u1"})),
                },
                WriteOp::Update {
                    collection: Collection::Accounts,
                    id: "a1".to_string(),
                    patch: body(json!({"balance": "100"})),
                    expect_version: Some(99),
                },
            ])
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(store.is_empty(Collection::Transactions));
    }

    #[tokio::test]
    async fn subscription_receives_initial_and_change_snapshots() {
        let store = MemoryDocumentStore::new();
        let scope = OwnerScope::owned("u1");
        let mut feed = store
            .subscribe(Collection::Goals, &scope)
            .await
            .expect("subscribe");

        let initial = feed.receiver.recv().await.expect("initial");
        assert!(initial.documents.is_empty());

        store
            .commit(vec![WriteOp::Insert {
                collection: Collection::Goals,
                id: "g1".to_string(),
                body: body(json!({"ownerId": "u1", "name": "Vacation"})),
            }])
            .await
            .expect("insert");

        let next = feed.receiver.recv().await.expect("change");
        assert!(next.version > initial.version);
        assert_eq!(next.documents.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_returns_transient_errors() {
        let store = MemoryDocumentStore::new();
        store.set_available(false);
        let err = store.get(Collection::Accounts, "a1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
