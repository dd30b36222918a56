//! Finance facade: the single entry point the UI talks to.
//!
//! Every mutation lands in the optimistic in-memory view first, then goes to
//! the remote gateway when online or into the durable queue otherwise. The
//! change listener's confirmed snapshots reconcile the view; queued entries
//! stay overlaid until their replay settles. Update and delete never roll the
//! optimistic view back on a remote failure — the listener is the eventual
//! source of truth.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::accounts::{Account, AccountUpdate, NewAccount};
use crate::categories::{Category, CategoryUpdate, NewCategory};
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{Error, Result};
use crate::gateway::RemoteGateway;
use crate::goals::{Goal, GoalUpdate, NewGoal};
use crate::listener::{ChangeListener, SnapshotHandler};
use crate::processor::{ProcessOutcome, QueueProcessor};
use crate::queue::{NewPendingOperation, OperationKind, PendingQueue};
use crate::store::{to_document_body as to_body, Collection, DocumentBody, DocumentStore};
use crate::transactions::{NewTransaction, Transaction, TransactionUpdate};

/// Prefix of ids synthesized for records awaiting their queued create.
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Failure,
}

/// One user-visible notification for a mutation or sync outcome. Mutations
/// queued while offline produce no notice; the pending badge carries that
/// state instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
struct OptimisticInsert {
    id: String,
    /// Queue record backing this insert; `None` once confirmed remotely.
    queue_id: Option<i64>,
    /// Create payload as enqueued, kept so later edits can fold into it.
    payload: DocumentBody,
    body: DocumentBody,
}

#[derive(Debug, Clone)]
struct OptimisticPatch {
    queue_id: Option<i64>,
    fields: DocumentBody,
}

#[derive(Debug, Clone)]
struct Tombstone {
    queue_id: Option<i64>,
}

#[derive(Default)]
struct Overlay {
    inserts: Vec<OptimisticInsert>,
    patches: HashMap<String, OptimisticPatch>,
    tombstones: HashMap<String, Tombstone>,
}

/// Confirmed snapshots overlaid with optimistic inserts, patches, and
/// tombstones.
#[derive(Default)]
struct ViewState {
    confirmed: HashMap<Collection, Vec<DocumentBody>>,
    overlays: HashMap<Collection, Overlay>,
}

impl ViewState {
    /// A confirmed snapshot reconciles every overlay entry that is not still
    /// backed by a queue record.
    fn on_confirmed(&mut self, collection: Collection, documents: Vec<DocumentBody>) {
        self.confirmed.insert(collection, documents);
        if let Some(overlay) = self.overlays.get_mut(&collection) {
            overlay.inserts.retain(|entry| entry.queue_id.is_some());
            overlay.patches.retain(|_, patch| patch.queue_id.is_some());
            overlay.tombstones.retain(|_, tomb| tomb.queue_id.is_some());
        }
    }

    fn merged(&self, collection: Collection) -> Vec<DocumentBody> {
        let confirmed = self.confirmed.get(&collection).cloned().unwrap_or_default();
        let Some(overlay) = self.overlays.get(&collection) else {
            return confirmed;
        };
        let mut seen = HashSet::new();
        let mut merged = Vec::with_capacity(confirmed.len() + overlay.inserts.len());
        for mut body in confirmed {
            let id = body
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if overlay.tombstones.contains_key(&id) {
                continue;
            }
            if let Some(patch) = overlay.patches.get(&id) {
                for (key, value) in patch.fields.clone() {
                    body.insert(key, value);
                }
            }
            seen.insert(id);
            merged.push(body);
        }
        for insert in &overlay.inserts {
            if seen.contains(&insert.id) || overlay.tombstones.contains_key(&insert.id) {
                continue;
            }
            let mut body = insert.body.clone();
            if let Some(patch) = overlay.patches.get(&insert.id) {
                for (key, value) in patch.fields.clone() {
                    body.insert(key, value);
                }
            }
            merged.push(body);
        }
        merged
    }

    /// Applies a processing outcome: synced entries wait for the next
    /// confirmed snapshot, abandoned intents are dropped outright.
    fn settle(&mut self, outcome: &ProcessOutcome) {
        let synced: HashSet<i64> = outcome.succeeded_ids.iter().copied().collect();
        let abandoned: HashSet<i64> = outcome.abandoned_ids.iter().copied().collect();
        let settle_id = |queue_id: &mut Option<i64>| -> bool {
            match *queue_id {
                Some(qid) if abandoned.contains(&qid) => false,
                Some(qid) if synced.contains(&qid) => {
                    *queue_id = None;
                    true
                }
                _ => true,
            }
        };
        for overlay in self.overlays.values_mut() {
            overlay.inserts.retain_mut(|entry| settle_id(&mut entry.queue_id));
            overlay.patches.retain(|_, patch| settle_id(&mut patch.queue_id));
            overlay.tombstones.retain(|_, tomb| settle_id(&mut tomb.queue_id));
        }
    }
}

/// CRUD entry point per entity, with optimistic local state, the pending
/// badge count, and user-visible notices.
pub struct FinanceFacade {
    owner_id: String,
    gateway: Arc<RemoteGateway>,
    queue: Arc<dyn PendingQueue>,
    processor: Arc<QueueProcessor>,
    connectivity: Arc<ConnectivityMonitor>,
    listener: Arc<ChangeListener>,
    view: Arc<Mutex<ViewState>>,
    pending_count: AtomicI64,
    seeded: AtomicBool,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<Notice>>>,
    reconnect_driver: Mutex<Option<JoinHandle<()>>>,
}

impl FinanceFacade {
    pub async fn new(
        owner_id: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        queue: Arc<dyn PendingQueue>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Result<Arc<Self>> {
        let owner_id = owner_id.into();
        let gateway = Arc::new(RemoteGateway::new(store.clone()));

        let view: Arc<Mutex<ViewState>> = Arc::default();
        let handler_view = view.clone();
        let handler: SnapshotHandler = Arc::new(move |collection, documents| {
            handler_view
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .on_confirmed(collection, documents);
        });
        let listener = Arc::new(ChangeListener::new(store, owner_id.clone(), handler));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            gateway.clone(),
            connectivity.clone(),
        ));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let facade = Arc::new(Self {
            owner_id,
            gateway,
            queue,
            processor,
            connectivity,
            listener,
            view,
            pending_count: AtomicI64::new(0),
            seeded: AtomicBool::new(false),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            reconnect_driver: Mutex::new(None),
        });

        if facade.connectivity.is_online() {
            facade.ensure_seeded().await;
        }
        facade.listener.subscribe_all().await?;
        facade.refresh_pending_count();

        let driver = Self::spawn_reconnect_driver(&facade);
        *facade
            .reconnect_driver
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(driver);
        Ok(facade)
    }

    /// Triggers one queue-processing run per offline→online transition and
    /// refreshes the confirmed view when the run synced anything.
    fn spawn_reconnect_driver(facade: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(facade);
        let mut transitions = facade.connectivity.subscribe();
        tokio::spawn(async move {
            let mut was_online = *transitions.borrow();
            while transitions.changed().await.is_ok() {
                let online = *transitions.borrow_and_update();
                let came_online = online && !was_online;
                was_online = online;
                if !came_online {
                    continue;
                }
                let Some(facade) = weak.upgrade() else { break };
                facade.ensure_seeded().await;
                match facade.processor.process().await {
                    Ok(outcome) => facade.after_run(&outcome).await,
                    Err(e) => error!("reconnect replay failed: {e}"),
                }
            }
        })
    }

    // ── Views ───────────────────────────────────────────────────────────────

    pub fn accounts(&self) -> Vec<Account> {
        self.typed_view(Collection::Accounts)
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.typed_view(Collection::Transactions)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.typed_view(Collection::Categories)
    }

    pub fn goals(&self) -> Vec<Goal> {
        self.typed_view(Collection::Goals)
    }

    fn typed_view<T: DeserializeOwned>(&self, collection: Collection) -> Vec<T> {
        self.lock_view()
            .merged(collection)
            .into_iter()
            .filter_map(|body| match serde_json::from_value(Value::Object(body)) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("skipping undecodable {collection} view document: {e}");
                    None
                }
            })
            .collect()
    }

    /// On-demand fetch of one collection into the confirmed view: fresh
    /// cache, then the remote store, then — logged by the listener — its
    /// stale-cache fallback. Covers views whose subscription could not be
    /// established.
    pub async fn reload(&self, collection: Collection) -> Result<()> {
        let documents = self.listener.load(collection).await?;
        self.lock_view().on_confirmed(collection, documents);
        Ok(())
    }

    /// Number of queued operations, for the UI pending badge.
    pub fn pending_operations_count(&self) -> i64 {
        self.pending_count.load(Ordering::SeqCst)
    }

    /// Receiver for user-visible notices. Yields `None` after the first call.
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notice_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // ── Accounts ────────────────────────────────────────────────────────────

    pub async fn add_account(&self, new: NewAccount) -> Result<String> {
        self.check_owner(&new.owner_id)?;
        RemoteGateway::validate_new_account(&new)?;
        if self.connectivity.is_online() {
            match self.gateway.create_account(new.clone()).await {
                Ok(account) => {
                    self.show_confirmed_insert(Collection::Accounts, to_body(&account)?);
                    self.notify(NoticeLevel::Success, "Account created");
                    return Ok(account.id);
                }
                Err(e) if !e.is_queueable() => return Err(e),
                Err(e) => self.notify_queued_fallback("account", &e),
            }
        }
        let now = Utc::now();
        let temp_id = Self::temp_id();
        let optimistic = Account {
            id: temp_id.clone(),
            name: new.name.clone(),
            account_type: new.account_type,
            balance: new.balance,
            owner_id: new.owner_id.clone(),
            is_pending: true,
            created_at: now,
            updated_at: now,
        };
        self.queue_add(Collection::Accounts, to_body(&new)?, temp_id, to_body(&optimistic)?)
            .await
    }

    pub async fn update_account(&self, id: &str, update: AccountUpdate) -> Result<()> {
        RemoteGateway::validate_account_update(&update)?;
        let fields = to_body(&update)?;
        self.perform_update(Collection::Accounts, id, fields, async {
            self.gateway
                .update_account(&self.owner_id, id, update)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_account(&self, id: &str) -> Result<()> {
        self.perform_delete(Collection::Accounts, id, async {
            self.gateway.delete_account(&self.owner_id, id).await
        })
        .await
    }

    // ── Transactions ────────────────────────────────────────────────────────

    pub async fn add_transaction(&self, new: NewTransaction) -> Result<String> {
        self.check_owner(&new.owner_id)?;
        RemoteGateway::validate_new_transaction(&new)?;
        if self.connectivity.is_online() {
            match self.gateway.create_transaction(new.clone()).await {
                Ok(transaction) => {
                    self.show_confirmed_insert(Collection::Transactions, to_body(&transaction)?);
                    self.notify(NoticeLevel::Success, "Transaction recorded");
                    return Ok(transaction.id);
                }
                Err(e) if !e.is_queueable() => return Err(e),
                Err(e) => self.notify_queued_fallback("transaction", &e),
            }
        }
        let now = Utc::now();
        let temp_id = Self::temp_id();
        let optimistic = Transaction {
            id: temp_id.clone(),
            account_id: new.account_id.clone(),
            transaction_type: new.transaction_type,
            amount: new.amount,
            category_id: new.category_id.clone(),
            description: new.description.clone(),
            date: new.date,
            tags: new.tags.clone(),
            is_pending: true,
            owner_id: new.owner_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.queue_add(
            Collection::Transactions,
            to_body(&new)?,
            temp_id,
            to_body(&optimistic)?,
        )
        .await
    }

    pub async fn update_transaction(&self, id: &str, update: TransactionUpdate) -> Result<()> {
        RemoteGateway::validate_transaction_update(&update)?;
        let fields = to_body(&update)?;
        self.perform_update(Collection::Transactions, id, fields, async {
            self.gateway
                .update_transaction(&self.owner_id, id, update)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_transaction(&self, id: &str) -> Result<()> {
        self.perform_delete(Collection::Transactions, id, async {
            self.gateway.delete_transaction(&self.owner_id, id).await
        })
        .await
    }

    // ── Categories ──────────────────────────────────────────────────────────

    pub async fn add_category(&self, new: NewCategory) -> Result<String> {
        if let Some(owner) = &new.owner_id {
            self.check_owner(owner)?;
        }
        RemoteGateway::validate_new_category(&new)?;
        if self.connectivity.is_online() {
            match self.gateway.create_category(new.clone()).await {
                Ok(category) => {
                    self.show_confirmed_insert(Collection::Categories, to_body(&category)?);
                    self.notify(NoticeLevel::Success, "Category created");
                    return Ok(category.id);
                }
                Err(e) if !e.is_queueable() => return Err(e),
                Err(e) => self.notify_queued_fallback("category", &e),
            }
        }
        let temp_id = Self::temp_id();
        let optimistic = Category {
            id: temp_id.clone(),
            name: new.name.clone(),
            category_type: new.category_type,
            color: new.color.clone(),
            owner_id: new.owner_id.clone(),
            is_pending: true,
        };
        self.queue_add(
            Collection::Categories,
            to_body(&new)?,
            temp_id,
            to_body(&optimistic)?,
        )
        .await
    }

    pub async fn update_category(&self, id: &str, update: CategoryUpdate) -> Result<()> {
        RemoteGateway::validate_category_update(&update)?;
        let fields = to_body(&update)?;
        self.perform_update(Collection::Categories, id, fields, async {
            self.gateway
                .update_category(&self.owner_id, id, update)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_category(&self, id: &str) -> Result<()> {
        self.perform_delete(Collection::Categories, id, async {
            self.gateway.delete_category(&self.owner_id, id).await
        })
        .await
    }

    // ── Goals ───────────────────────────────────────────────────────────────

    pub async fn add_goal(&self, new: NewGoal) -> Result<String> {
        self.check_owner(&new.owner_id)?;
        RemoteGateway::validate_new_goal(&new)?;
        if self.connectivity.is_online() {
            match self.gateway.create_goal(new.clone()).await {
                Ok(goal) => {
                    self.show_confirmed_insert(Collection::Goals, to_body(&goal)?);
                    self.notify(NoticeLevel::Success, "Goal created");
                    return Ok(goal.id);
                }
                Err(e) if !e.is_queueable() => return Err(e),
                Err(e) => self.notify_queued_fallback("goal", &e),
            }
        }
        let temp_id = Self::temp_id();
        let mut optimistic = Goal {
            id: temp_id.clone(),
            owner_id: new.owner_id.clone(),
            name: new.name.clone(),
            target_amount: new.target_amount,
            current_amount: new.current_amount,
            deadline: new.deadline,
            is_completed: false,
        };
        optimistic.recompute_completion();
        self.queue_add(Collection::Goals, to_body(&new)?, temp_id, to_body(&optimistic)?)
            .await
    }

    pub async fn update_goal(&self, id: &str, update: GoalUpdate) -> Result<()> {
        RemoteGateway::validate_goal_update(&update)?;
        let fields = to_body(&update)?;
        self.perform_update(Collection::Goals, id, fields, async {
            self.gateway
                .update_goal(&self.owner_id, id, update)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_goal(&self, id: &str) -> Result<()> {
        self.perform_delete(Collection::Goals, id, async {
            self.gateway.delete_goal(&self.owner_id, id).await
        })
        .await
    }

    // ── Queue control ───────────────────────────────────────────────────────

    /// Manually triggers a queue-processing run. Errors while offline.
    pub async fn process_pending_operations(&self) -> Result<usize> {
        if !self.connectivity.is_online() {
            self.notify(NoticeLevel::Failure, "Cannot sync while offline");
            return Err(Error::transient("cannot process the queue while offline"));
        }
        let outcome = self.processor.process().await?;
        self.after_run(&outcome).await;
        Ok(outcome.synced)
    }

    async fn after_run(&self, outcome: &ProcessOutcome) {
        self.lock_view().settle(outcome);
        self.refresh_pending_count();
        if outcome.synced > 0 {
            self.notify(
                NoticeLevel::Success,
                format!("{} operation(s) synced", outcome.synced),
            );
            if let Err(e) = self.listener.refresh().await {
                warn!("post-sync view refresh failed: {e}");
            }
        }
        if outcome.abandoned() > 0 {
            self.notify(
                NoticeLevel::Failure,
                format!(
                    "{} operation(s) could not be synced and were discarded",
                    outcome.abandoned()
                ),
            );
        }
    }

    /// Seeds the default category set once per user. Deferred while the
    /// backend is unreachable and retried on the next reconnect.
    async fn ensure_seeded(&self) {
        if self.seeded.load(Ordering::SeqCst) {
            return;
        }
        match self.gateway.ensure_default_categories(&self.owner_id).await {
            Ok(_) => self.seeded.store(true, Ordering::SeqCst),
            Err(e) => warn!("default category seeding deferred: {e}"),
        }
    }

    // ── Mutation plumbing ───────────────────────────────────────────────────

    /// Optimistic patch first, then the remote attempt, then — if the remote
    /// attempt failed with something queueable or we are offline — the durable
    /// queue. Only never-queued caller mistakes roll the patch back.
    /// `direct` is lazy: it runs only when connectivity allows.
    async fn perform_update<Fut>(
        &self,
        collection: Collection,
        id: &str,
        fields: DocumentBody,
        direct: Fut,
    ) -> Result<()>
    where
        Fut: std::future::Future<Output = Result<()>>,
    {
        if id.starts_with(TEMP_ID_PREFIX) {
            return self.fold_update_into_queued_create(collection, id, fields).await;
        }
        let prior = self.apply_patch_overlay(collection, id, fields.clone());
        if self.connectivity.is_online() {
            match direct.await {
                Ok(()) => {
                    self.notify(NoticeLevel::Success, "Change saved");
                    return Ok(());
                }
                Err(e) if !e.is_queueable() => {
                    self.restore_patch_overlay(collection, id, prior);
                    return Err(e);
                }
                Err(e) => self.notify_queued_fallback("change", &e),
            }
        }
        match self.queue_update(collection, id, fields).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Enqueue failed loudly: the intent is not persisted anywhere,
                // so the optimistic patch must not outlive it.
                self.restore_patch_overlay(collection, id, prior);
                Err(e)
            }
        }
    }

    async fn perform_delete<Fut>(&self, collection: Collection, id: &str, direct: Fut) -> Result<()>
    where
        Fut: std::future::Future<Output = Result<()>>,
    {
        if id.starts_with(TEMP_ID_PREFIX) {
            return self.cancel_queued_create(collection, id).await;
        }
        let prior = self.apply_tombstone(collection, id);
        if self.connectivity.is_online() {
            match direct.await {
                Ok(()) => {
                    self.notify(NoticeLevel::Success, "Deleted");
                    return Ok(());
                }
                Err(e) if !e.is_queueable() => {
                    self.restore_tombstone(collection, id, prior);
                    return Err(e);
                }
                Err(e) => self.notify_queued_fallback("deletion", &e),
            }
        }
        match self.queue_delete(collection, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.restore_tombstone(collection, id, prior);
                Err(e)
            }
        }
    }

    /// Queue the create and show an optimistic pending record under a
    /// synthesized temporary id.
    async fn queue_add(
        &self,
        collection: Collection,
        payload: DocumentBody,
        temp_id: String,
        optimistic: DocumentBody,
    ) -> Result<String> {
        let queue_id = self
            .queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Create,
                collection,
                document_id: None,
                payload: payload.clone(),
                owner_id: self.owner_id.clone(),
            })
            .await?;
        self.lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .inserts
            .push(OptimisticInsert {
                id: temp_id.clone(),
                queue_id: Some(queue_id),
                payload,
                body: optimistic,
            });
        self.refresh_pending_count();
        Ok(temp_id)
    }

    async fn queue_update(&self, collection: Collection, id: &str, fields: DocumentBody) -> Result<()> {
        let queue_id = self
            .queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Update,
                collection,
                document_id: Some(id.to_string()),
                payload: fields,
                owner_id: self.owner_id.clone(),
            })
            .await?;
        if let Some(patch) = self
            .lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .patches
            .get_mut(id)
        {
            patch.queue_id = Some(queue_id);
        }
        self.refresh_pending_count();
        Ok(())
    }

    async fn queue_delete(&self, collection: Collection, id: &str) -> Result<()> {
        let queue_id = self
            .queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Delete,
                collection,
                document_id: Some(id.to_string()),
                payload: DocumentBody::new(),
                owner_id: self.owner_id.clone(),
            })
            .await?;
        if let Some(tomb) = self
            .lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .tombstones
            .get_mut(id)
        {
            tomb.queue_id = Some(queue_id);
        }
        self.refresh_pending_count();
        Ok(())
    }

    /// An edit against a record whose create is still queued folds into that
    /// create: the old queue record is withdrawn and one merged create takes
    /// its place, keeping exactly one queue record per logical intent.
    async fn fold_update_into_queued_create(
        &self,
        collection: Collection,
        id: &str,
        fields: DocumentBody,
    ) -> Result<()> {
        let Some(insert) = self.queued_insert(collection, id) else {
            return Err(Error::not_found(collection.as_str(), id));
        };
        let Some(old_queue_id) = insert.queue_id else {
            return Err(Error::transient(format!(
                "{collection} record '{id}' is being confirmed, retry shortly"
            )));
        };
        let mut payload = insert.payload.clone();
        for (key, value) in fields.clone() {
            payload.insert(key, value);
        }
        self.queue.remove(old_queue_id).await?;
        let queue_id = self
            .queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Create,
                collection,
                document_id: None,
                payload: payload.clone(),
                owner_id: self.owner_id.clone(),
            })
            .await?;
        {
            let mut view = self.lock_view();
            let overlay = view.overlays.entry(collection).or_default();
            if let Some(entry) = overlay.inserts.iter_mut().find(|entry| entry.id == id) {
                entry.queue_id = Some(queue_id);
                entry.payload = payload;
                for (key, value) in fields {
                    entry.body.insert(key, value);
                }
            }
        }
        self.refresh_pending_count();
        Ok(())
    }

    /// Deleting a record whose create is still queued withdraws the queued
    /// create instead of enqueueing an unreplayable delete.
    async fn cancel_queued_create(&self, collection: Collection, id: &str) -> Result<()> {
        let Some(insert) = self.queued_insert(collection, id) else {
            return Err(Error::not_found(collection.as_str(), id));
        };
        let Some(queue_id) = insert.queue_id else {
            return Err(Error::transient(format!(
                "{collection} record '{id}' is being confirmed, retry shortly"
            )));
        };
        self.queue.remove(queue_id).await?;
        self.lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .inserts
            .retain(|entry| entry.id != id);
        self.refresh_pending_count();
        Ok(())
    }

    // ── Overlay helpers ─────────────────────────────────────────────────────

    fn queued_insert(&self, collection: Collection, id: &str) -> Option<OptimisticInsert> {
        self.lock_view()
            .overlays
            .get(&collection)
            .and_then(|overlay| overlay.inserts.iter().find(|entry| entry.id == id).cloned())
    }

    /// A confirmed record created through the direct online path is shown
    /// immediately; the next confirmed snapshot absorbs it.
    fn show_confirmed_insert(&self, collection: Collection, body: DocumentBody) {
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .inserts
            .push(OptimisticInsert {
                id,
                queue_id: None,
                payload: DocumentBody::new(),
                body,
            });
    }

    fn apply_patch_overlay(
        &self,
        collection: Collection,
        id: &str,
        fields: DocumentBody,
    ) -> Option<OptimisticPatch> {
        let mut view = self.lock_view();
        let overlay = view.overlays.entry(collection).or_default();
        let prior = overlay.patches.get(id).cloned();
        let patch = overlay
            .patches
            .entry(id.to_string())
            .or_insert_with(|| OptimisticPatch {
                queue_id: None,
                fields: DocumentBody::new(),
            });
        for (key, value) in fields {
            patch.fields.insert(key, value);
        }
        prior
    }

    fn restore_patch_overlay(
        &self,
        collection: Collection,
        id: &str,
        prior: Option<OptimisticPatch>,
    ) {
        let mut view = self.lock_view();
        let overlay = view.overlays.entry(collection).or_default();
        match prior {
            Some(patch) => {
                overlay.patches.insert(id.to_string(), patch);
            }
            None => {
                overlay.patches.remove(id);
            }
        }
    }

    fn apply_tombstone(&self, collection: Collection, id: &str) -> Option<Tombstone> {
        self.lock_view()
            .overlays
            .entry(collection)
            .or_default()
            .tombstones
            .insert(id.to_string(), Tombstone { queue_id: None })
    }

    fn restore_tombstone(&self, collection: Collection, id: &str, prior: Option<Tombstone>) {
        let mut view = self.lock_view();
        let overlay = view.overlays.entry(collection).or_default();
        match prior {
            Some(tomb) => {
                overlay.tombstones.insert(id.to_string(), tomb);
            }
            None => {
                overlay.tombstones.remove(id);
            }
        }
    }

    // ── Small helpers ───────────────────────────────────────────────────────

    fn lock_view(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let _ = self.notice_tx.send(Notice {
            level,
            message: message.into(),
        });
    }

    fn notify_queued_fallback(&self, what: &str, err: &Error) {
        warn!("remote write failed, queueing for replay: {err}");
        self.notify(
            NoticeLevel::Failure,
            format!("The {what} was saved locally and will sync when the server is reachable"),
        );
    }

    fn refresh_pending_count(&self) {
        match self.queue.count() {
            Ok(count) => self.pending_count.store(count, Ordering::SeqCst),
            Err(e) => error!("pending count refresh failed: {e}"),
        }
    }

    fn temp_id() -> String {
        format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
    }

    fn check_owner(&self, payload_owner: &str) -> Result<()> {
        if payload_owner == self.owner_id {
            Ok(())
        } else {
            Err(Error::validation(
                "payload owner does not match the signed-in user",
            ))
        }
    }
}

impl Drop for FinanceFacade {
    fn drop(&mut self) {
        if let Some(driver) = self
            .reconnect_driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            driver.abort();
        }
        self.listener.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountType;
    use crate::queue::MemoryPendingQueue;
    use crate::store::MemoryDocumentStore;
    use crate::transactions::FlowType;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        queue: Arc<MemoryPendingQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        facade: Arc<FinanceFacade>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let queue = Arc::new(MemoryPendingQueue::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let facade = FinanceFacade::new(
            "u1",
            store.clone() as Arc<dyn DocumentStore>,
            queue.clone() as Arc<dyn PendingQueue>,
            connectivity.clone(),
        )
        .await
        .expect("facade");
        Fixture {
            store,
            queue,
            connectivity,
            facade,
        }
    }

    fn new_account(owner: &str) -> NewAccount {
        NewAccount {
            name: "Main Wallet".to_string(),
            account_type: AccountType::Wallet,
            owner_id: owner.to_string(),
            balance: Decimal::ZERO,
        }
    }

    fn new_transaction(account_id: &str, amount: Decimal) -> NewTransaction {
        NewTransaction {
            account_id: account_id.to_string(),
            transaction_type: FlowType::Income,
            amount,
            category_id: "cat-salary".to_string(),
            description: "payday".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            tags: vec![],
            is_pending: false,
            owner_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn offline_adds_synthesize_temp_ids_and_count_pending() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();

        f.connectivity.set_online(false);
        let first = f
            .facade
            .add_transaction(new_transaction(&account_id, dec!(100)))
            .await
            .unwrap();
        let second = f
            .facade
            .add_transaction(new_transaction(&account_id, dec!(25)))
            .await
            .unwrap();

        assert!(first.starts_with(TEMP_ID_PREFIX));
        assert!(second.starts_with(TEMP_ID_PREFIX));
        assert_ne!(first, second);
        assert_eq!(f.facade.pending_operations_count(), 2);

        let transactions = f.facade.transactions();
        assert_eq!(transactions.len(), 2);
        assert!(transactions.iter().all(|tx| tx.is_pending));
        assert_eq!(transactions[0].amount, dec!(100));
    }

    #[tokio::test]
    async fn validation_errors_are_returned_not_queued() {
        let f = fixture().await;
        f.connectivity.set_online(false);
        let err = f
            .facade
            .add_transaction(new_transaction("a1", dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.facade.pending_operations_count(), 0);
    }

    #[tokio::test]
    async fn online_failure_falls_back_to_queue_with_one_notice() {
        let f = fixture().await;
        let mut notices = f.facade.take_notices().unwrap();
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();
        assert_eq!(notices.recv().await.unwrap().level, NoticeLevel::Success);

        f.store.set_available(false);
        let temp_id = f
            .facade
            .add_transaction(new_transaction(&account_id, dec!(10)))
            .await
            .unwrap();
        assert!(temp_id.starts_with(TEMP_ID_PREFIX));
        assert_eq!(f.facade.pending_operations_count(), 1);
        assert_eq!(notices.recv().await.unwrap().level, NoticeLevel::Failure);
    }

    #[tokio::test]
    async fn manual_processing_replays_the_queue_and_reconciles() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();

        f.connectivity.set_online(false);
        f.facade
            .add_transaction(new_transaction(&account_id, dec!(100)))
            .await
            .unwrap();
        f.connectivity.set_online(true);

        // The reconnect driver races this manual run; between the two, the
        // queue fully drains (single-flight coalesces the loser).
        f.facade.process_pending_operations().await.unwrap();
        for _ in 0..50 {
            if f.facade.pending_operations_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            f.facade.process_pending_operations().await.unwrap();
        }
        assert_eq!(f.facade.pending_operations_count(), 0);

        // Wait for the post-sync refresh to land in the confirmed view.
        for _ in 0..50 {
            let accounts = f.facade.accounts();
            let transactions = f.facade.transactions();
            if accounts.len() == 1
                && accounts[0].balance == dec!(100)
                && transactions.len() == 1
                && !transactions[0].is_pending
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let accounts = f.facade.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, dec!(100));
        let transactions = f.facade.transactions();
        assert_eq!(transactions.len(), 1);
        assert!(!transactions[0].is_pending);
    }

    #[tokio::test]
    async fn processing_while_offline_is_an_error() {
        let f = fixture().await;
        f.connectivity.set_online(false);
        assert!(f.facade.process_pending_operations().await.is_err());
    }

    #[tokio::test]
    async fn optimistic_update_survives_remote_failure() {
        let f = fixture().await;
        let goal_id = f
            .facade
            .add_goal(NewGoal {
                owner_id: "u1".to_string(),
                name: "Vacation".to_string(),
                target_amount: dec!(1000),
                current_amount: dec!(0),
                deadline: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
            })
            .await
            .unwrap();

        f.store.set_available(false);
        f.facade
            .update_goal(
                &goal_id,
                GoalUpdate {
                    name: Some("Winter trip".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The optimistic view shows the intended end state, no rollback.
        let goals = f.facade.goals();
        assert_eq!(goals[0].name, "Winter trip");
        assert_eq!(f.facade.pending_operations_count(), 1);
    }

    #[tokio::test]
    async fn validation_failure_on_update_rolls_the_overlay_back() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();
        let err = f
            .facade
            .update_account(
                &account_id,
                AccountUpdate {
                    name: Some("  ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.facade.accounts()[0].name, "Main Wallet");
        assert_eq!(f.facade.pending_operations_count(), 0);
    }

    #[tokio::test]
    async fn optimistic_delete_hides_the_record_immediately() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();

        f.connectivity.set_online(false);
        f.facade.delete_account(&account_id).await.unwrap();
        assert!(f.facade.accounts().is_empty());
        assert_eq!(f.facade.pending_operations_count(), 1);
    }

    #[tokio::test]
    async fn deleting_a_temp_record_withdraws_the_queued_create() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();

        f.connectivity.set_online(false);
        let temp_id = f
            .facade
            .add_transaction(new_transaction(&account_id, dec!(10)))
            .await
            .unwrap();
        assert_eq!(f.facade.pending_operations_count(), 1);

        f.facade.delete_transaction(&temp_id).await.unwrap();
        assert_eq!(f.facade.pending_operations_count(), 0);
        assert!(f.facade.transactions().is_empty());
    }

    #[tokio::test]
    async fn updating_a_temp_record_folds_into_the_queued_create() {
        let f = fixture().await;
        let account_id = f.facade.add_account(new_account("u1")).await.unwrap();

        f.connectivity.set_online(false);
        let temp_id = f
            .facade
            .add_transaction(new_transaction(&account_id, dec!(10)))
            .await
            .unwrap();
        f.facade
            .update_transaction(
                &temp_id,
                TransactionUpdate {
                    amount: Some(dec!(42)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Still exactly one queued intent, now carrying the merged amount.
        assert_eq!(f.facade.pending_operations_count(), 1);
        let queued = f.queue.dequeue_all_ordered().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload.get("amount").unwrap().as_str(), Some("42"));
        assert_eq!(f.facade.transactions()[0].amount, dec!(42));
    }

    #[tokio::test]
    async fn foreign_owner_payload_is_rejected() {
        let f = fixture().await;
        let err = f.facade.add_account(new_account("intruder")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn default_categories_are_seeded_at_startup() {
        let f = fixture().await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(
            f.facade.categories().len(),
            crate::categories::DEFAULT_CATEGORIES.len()
        );
    }

    #[tokio::test]
    async fn seeding_deferred_while_offline_happens_on_reconnect() {
        let store = Arc::new(MemoryDocumentStore::new());
        let queue = Arc::new(MemoryPendingQueue::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let facade = FinanceFacade::new(
            "u1",
            store as Arc<dyn DocumentStore>,
            queue as Arc<dyn PendingQueue>,
            connectivity.clone(),
        )
        .await
        .expect("facade");
        assert!(facade.categories().is_empty());

        connectivity.set_online(true);
        for _ in 0..50 {
            if !facade.categories().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(
            facade.categories().len(),
            crate::categories::DEFAULT_CATEGORIES.len()
        );
    }

    #[tokio::test]
    async fn reload_serves_cached_state_when_the_backend_is_down() {
        let f = fixture().await;
        f.facade.add_account(new_account("u1")).await.unwrap();
        f.facade.reload(Collection::Accounts).await.unwrap();

        f.store.set_available(false);
        f.facade.reload(Collection::Accounts).await.unwrap();
        assert_eq!(f.facade.accounts().len(), 1);
    }
}
