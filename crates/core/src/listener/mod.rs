//! Change listener and cache layer.
//!
//! Subscribes to remote change notifications scoped to the current user,
//! normalizes incoming documents, debounces notification bursts, and feeds a
//! bounded-staleness in-memory cache. The listener owns nothing but the
//! subscription lifecycle; teardown is guarded by an active flag checked
//! before every delivery, so no callback ever fires after unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;

use crate::errors::Result;
use crate::store::{ChangeSnapshot, Collection, Document, DocumentBody, DocumentStore, OwnerScope};

/// Minimum interval between downstream emissions for one collection.
/// Tuning value, not contract: bursts coalesce, the final state always
/// flushes.
pub const DEBOUNCE_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Cache entries older than this are no longer served as fresh.
pub const CACHE_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Downstream delivery callback for normalized snapshots.
pub type SnapshotHandler = Arc<dyn Fn(Collection, Vec<DocumentBody>) + Send + Sync>;

struct CacheEntry {
    documents: Vec<DocumentBody>,
    stored_at: Instant,
}

/// Snapshot cache with bounded staleness.
#[derive(Default)]
pub struct ListenerCache {
    entries: RwLock<HashMap<Collection, CacheEntry>>,
}

impl ListenerCache {
    pub fn put(&self, collection: Collection, documents: Vec<DocumentBody>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            collection,
            CacheEntry {
                documents,
                stored_at: Instant::now(),
            },
        );
    }

    /// Cached documents, only while within the staleness bound.
    pub fn get_fresh(&self, collection: Collection) -> Option<Vec<DocumentBody>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&collection)
            .filter(|entry| entry.stored_at.elapsed() < CACHE_STALE_AFTER)
            .map(|entry| entry.documents.clone())
    }

    /// Cached documents regardless of age. Degraded-read path for when the
    /// live subscription or a direct fetch errors; callers log the fallback.
    pub fn stale_fallback(&self, collection: Collection) -> Option<Vec<DocumentBody>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&collection).map(|entry| entry.documents.clone())
    }

    #[cfg(test)]
    pub(crate) fn force_stale(&self, collection: Collection) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&collection) {
            entry.stored_at = Instant::now() - CACHE_STALE_AFTER - Duration::from_secs(1);
        }
    }
}

/// Coerce a backend timestamp representation into an RFC3339 string.
/// Handles string, epoch-number (seconds or milliseconds), and
/// `{seconds, nanoseconds}` object forms.
fn coerce_timestamp(value: &Value) -> Option<String> {
    let canonical = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Millis, true);
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| canonical(dt.with_timezone(&Utc))),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            // Millisecond epochs are 13 digits in this century.
            let dt = if raw.abs() >= 100_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            };
            dt.map(canonical)
        }
        Value::Object(map) => {
            let seconds = map.get("seconds").and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("nanos"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            DateTime::from_timestamp(seconds, nanos).map(canonical)
        }
        _ => None,
    }
}

fn fill_default(body: &mut DocumentBody, key: &str, value: Value) {
    if !body.contains_key(key) {
        body.insert(key.to_string(), value);
    }
}

/// Normalize one incoming document: canonical timestamps, structural
/// defaults, and an identifying id. Documents without an id are unusable
/// and dropped (logged, never crashing the batch).
pub fn normalize_document(collection: Collection, doc: &Document) -> Option<DocumentBody> {
    if doc.id.trim().is_empty() {
        warn!("skipping {collection} document with no id");
        return None;
    }
    let mut body = doc.body.clone();
    body.insert("id".to_string(), Value::String(doc.id.clone()));

    for key in ["createdAt", "updatedAt"] {
        if let Some(coerced) = body.get(key).and_then(coerce_timestamp) {
            body.insert(key.to_string(), Value::String(coerced));
        }
    }

    match collection {
        Collection::Accounts => {
            fill_default(&mut body, "name", Value::String(String::new()));
            fill_default(&mut body, "type", Value::String("wallet".to_string()));
        }
        Collection::Transactions => {
            fill_default(&mut body, "type", Value::String("expense".to_string()));
            fill_default(&mut body, "tags", Value::Array(Vec::new()));
        }
        Collection::Categories => {
            fill_default(&mut body, "name", Value::String("Uncategorized".to_string()));
            fill_default(&mut body, "type", Value::String("expense".to_string()));
            fill_default(&mut body, "color", Value::String("#9E9E9E".to_string()));
        }
        Collection::Goals => {
            fill_default(&mut body, "name", Value::String(String::new()));
        }
    }
    Some(body)
}

fn normalize_all(collection: Collection, documents: &[Document]) -> Vec<DocumentBody> {
    documents
        .iter()
        .filter_map(|doc| normalize_document(collection, doc))
        .collect()
}

struct Subscription {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns the remote subscriptions for one user and reconciles their
/// snapshots into the cache and the downstream handler.
pub struct ChangeListener {
    store: Arc<dyn DocumentStore>,
    owner_id: String,
    cache: Arc<ListenerCache>,
    handler: SnapshotHandler,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn scope_for(collection: Collection, owner_id: &str) -> OwnerScope {
    // Categories include the shared system defaults.
    if collection == Collection::Categories {
        OwnerScope::with_shared(owner_id)
    } else {
        OwnerScope::owned(owner_id)
    }
}

impl ChangeListener {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        owner_id: impl Into<String>,
        handler: SnapshotHandler,
    ) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            cache: Arc::new(ListenerCache::default()),
            handler,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> Arc<ListenerCache> {
        self.cache.clone()
    }

    /// Subscribes to every collection. A collection whose subscription fails
    /// is logged and left to the degraded-read path rather than failing the
    /// rest.
    pub async fn subscribe_all(&self) -> Result<()> {
        for collection in Collection::ALL {
            let scope = scope_for(collection, &self.owner_id);
            match self.store.subscribe(collection, &scope).await {
                Ok(feed) => self.spawn_subscription(collection, feed.receiver),
                Err(e) => {
                    warn!("subscription for {collection} failed, serving cache fallback: {e}");
                }
            }
        }
        Ok(())
    }

    fn spawn_subscription(
        &self,
        collection: Collection,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<ChangeSnapshot>,
    ) {
        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();
        let cache = self.cache.clone();
        let handler = self.handler.clone();

        let task = tokio::spawn(async move {
            let mut latest: Option<ChangeSnapshot> = None;
            let mut last_emit: Option<Instant> = None;

            let emit = |snapshot: ChangeSnapshot| {
                // The active flag is the teardown guarantee: in-flight work
                // that completes after unsubscribe discards its result here.
                if !task_active.load(Ordering::SeqCst) {
                    return false;
                }
                let documents = normalize_all(collection, &snapshot.documents);
                cache.put(collection, documents.clone());
                handler(collection, documents);
                true
            };

            loop {
                if latest.is_none() {
                    match receiver.recv().await {
                        Some(snapshot) => latest = Some(snapshot),
                        None => break,
                    }
                }

                let deadline = last_emit
                    .map(|at| at + DEBOUNCE_MIN_INTERVAL)
                    .filter(|deadline| *deadline > Instant::now());
                match deadline {
                    None => {
                        let Some(snapshot) = latest.take() else { continue };
                        if !emit(snapshot) {
                            break;
                        }
                        last_emit = Some(Instant::now());
                    }
                    Some(deadline) => {
                        tokio::select! {
                            incoming = receiver.recv() => match incoming {
                                Some(snapshot) => {
                                    // Coalesce, never regress to an older version.
                                    let current = latest.as_ref().map(|s| s.version).unwrap_or(0);
                                    if snapshot.version >= current {
                                        latest = Some(snapshot);
                                    }
                                }
                                None => {
                                    // Channel closed: flush the final state.
                                    if let Some(snapshot) = latest.take() {
                                        emit(snapshot);
                                    }
                                    break;
                                }
                            },
                            _ = sleep_until(deadline.into()) => {
                                let Some(snapshot) = latest.take() else { continue };
                                if !emit(snapshot) {
                                    break;
                                }
                                last_emit = Some(Instant::now());
                            }
                        }
                    }
                }
            }
            debug!("{collection} subscription task ended");
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription { active, task });
    }

    /// Stops all further callback delivery immediately and synchronously.
    pub fn unsubscribe_all(&self) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for subscription in subscriptions.drain(..) {
            subscription.active.store(false, Ordering::SeqCst);
            subscription.task.abort();
        }
    }

    /// Fetches every collection directly, bypassing the cache, and pushes the
    /// result through the handler. Used after reconnect replay, when the
    /// cached snapshots predate the replayed writes.
    pub async fn refresh(&self) -> Result<()> {
        for collection in Collection::ALL {
            let scope = scope_for(collection, &self.owner_id);
            let documents = self.store.list_by_owner(collection, &scope).await?;
            let normalized = normalize_all(collection, &documents);
            self.cache.put(collection, normalized.clone());
            (self.handler)(collection, normalized);
        }
        Ok(())
    }

    /// Read path with degraded fallback: fresh cache, then a direct fetch,
    /// then — explicitly logged — stale cache when the fetch errors.
    pub async fn load(&self, collection: Collection) -> Result<Vec<DocumentBody>> {
        if let Some(documents) = self.cache.get_fresh(collection) {
            return Ok(documents);
        }
        let scope = scope_for(collection, &self.owner_id);
        match self.store.list_by_owner(collection, &scope).await {
            Ok(documents) => {
                let normalized = normalize_all(collection, &documents);
                self.cache.put(collection, normalized.clone());
                Ok(normalized)
            }
            Err(e) => match self.cache.stale_fallback(collection) {
                Some(documents) => {
                    warn!("{collection} fetch failed, serving stale cache: {e}");
                    Ok(documents)
                }
                None => Err(e),
            },
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
