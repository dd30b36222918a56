//! Remote data gateway: validated, ownership-checked CRUD per collection.
//!
//! Every mutation is expressed as one atomic commit against the document
//! store. Balance recomputation rides in the same commit as the transaction
//! write, guarded by a version precondition on the account so concurrent
//! mutations on the same account cannot lose updates.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::accounts::{Account, AccountUpdate, NewAccount};
use crate::categories::{Category, CategoryUpdate, NewCategory, DEFAULT_CATEGORIES};
use crate::errors::{Error, Result};
use crate::goals::{Goal, GoalUpdate, NewGoal};
use crate::queue::{validate_payload, OperationKind, PendingOperation};
use crate::store::{
    to_document_body as to_body, Collection, Document, DocumentBody, DocumentStore, OwnerScope,
    WriteOp,
};
use crate::transactions::{NewTransaction, Transaction, TransactionUpdate};

/// Bounded retries for optimistic-concurrency conflicts on the balance path.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Decode a stored document into a domain value.
fn decode<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc.body.clone())).map_err(|e| {
        Error::Internal(format!(
            "stored document '{}' does not match its schema: {e}",
            doc.id
        ))
    })
}

/// Decode a queued payload into a typed value. Failures here are caller
/// mistakes (malformed payload), not transient conditions.
fn decode_payload<T: DeserializeOwned>(body: &DocumentBody) -> Result<T> {
    serde_json::from_value(Value::Object(body.clone()))
        .map_err(|e| Error::validation(format!("malformed payload: {e}")))
}

/// Coerce a `date` field carrying a datetime string down to its calendar day.
fn normalize_date_field(body: &mut DocumentBody) {
    if let Some(Value::String(raw)) = body.get("date") {
        if raw.len() > 10 {
            if let Ok(day) = NaiveDate::parse_from_str(&raw[..10], "%Y-%m-%d") {
                body.insert(
                    "date".to_string(),
                    Value::String(day.format("%Y-%m-%d").to_string()),
                );
            }
        }
    }
}

fn balance_patch(balance: Decimal, now: DateTime<Utc>) -> Result<DocumentBody> {
    let mut patch = DocumentBody::new();
    patch.insert("balance".to_string(), serde_json::to_value(balance)?);
    patch.insert("updatedAt".to_string(), serde_json::to_value(now)?);
    Ok(patch)
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_positive(field: &str, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::validation(format!(
            "{field} must be a positive amount"
        )));
    }
    Ok(())
}

/// Gateway over the remote document store for all four logical collections.
#[derive(Clone)]
pub struct RemoteGateway {
    store: Arc<dyn DocumentStore>,
}

impl RemoteGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Loads a document and verifies the caller owns it. Shared records
    /// (no owner) are never mutable through the gateway.
    async fn load_owned(
        &self,
        collection: Collection,
        id: &str,
        caller_owner_id: &str,
    ) -> Result<Document> {
        let doc = self
            .store
            .get(collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection.as_str(), id))?;
        match doc.owner_id() {
            Some(owner) if owner == caller_owner_id => Ok(doc),
            Some(_) => Err(Error::permission_denied(format!(
                "{collection} record '{id}' belongs to another user"
            ))),
            None => Err(Error::permission_denied(format!(
                "{collection} record '{id}' is a shared system record"
            ))),
        }
    }

    // ── Accounts ────────────────────────────────────────────────────────────

    pub(crate) fn validate_new_account(new: &NewAccount) -> Result<()> {
        require("name", &new.name)?;
        require("ownerId", &new.owner_id)
    }

    pub(crate) fn validate_account_update(update: &AccountUpdate) -> Result<()> {
        match &update.name {
            Some(name) => require("name", name),
            None => Ok(()),
        }
    }

    pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
        Self::validate_new_account(&new)?;
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            account_type: new.account_type,
            balance: new.balance,
            owner_id: new.owner_id,
            is_pending: false,
            created_at: now,
            updated_at: now,
        };
        self.store
            .commit(vec![WriteOp::Insert {
                collection: Collection::Accounts,
                id: account.id.clone(),
                body: to_body(&account)?,
            }])
            .await?;
        Ok(account)
    }

    pub async fn update_account(
        &self,
        caller_owner_id: &str,
        id: &str,
        update: AccountUpdate,
    ) -> Result<Account> {
        Self::validate_account_update(&update)?;
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let doc = self
                .load_owned(Collection::Accounts, id, caller_owner_id)
                .await?;
            let mut account: Account = decode(&doc)?;
            if let Some(name) = update.name.clone() {
                account.name = name;
            }
            if let Some(account_type) = update.account_type {
                account.account_type = account_type;
            }
            if let Some(is_pending) = update.is_pending {
                account.is_pending = is_pending;
            }
            account.updated_at = Utc::now();
            let result = self
                .store
                .commit(vec![WriteOp::Update {
                    collection: Collection::Accounts,
                    id: id.to_string(),
                    patch: to_body(&account)?,
                    expect_version: Some(doc.version),
                }])
                .await;
            match result {
                Ok(()) => return Ok(account),
                Err(Error::Conflict(_)) if attempt < MAX_COMMIT_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("account update retries exhausted".to_string()))
    }

    pub async fn delete_account(&self, caller_owner_id: &str, id: &str) -> Result<()> {
        let doc = self
            .load_owned(Collection::Accounts, id, caller_owner_id)
            .await?;
        self.store
            .commit(vec![WriteOp::Delete {
                collection: Collection::Accounts,
                id: id.to_string(),
                expect_version: Some(doc.version),
            }])
            .await
    }

    pub async fn get_account(&self, caller_owner_id: &str, id: &str) -> Result<Account> {
        let doc = self
            .load_owned(Collection::Accounts, id, caller_owner_id)
            .await?;
        decode(&doc)
    }

    pub async fn list_accounts(&self, owner_id: &str) -> Result<Vec<Account>> {
        let docs = self
            .store
            .list_by_owner(Collection::Accounts, &OwnerScope::owned(owner_id))
            .await?;
        Ok(decode_all(Collection::Accounts, &docs))
    }

    // ── Transactions ────────────────────────────────────────────────────────

    pub(crate) fn validate_new_transaction(new: &NewTransaction) -> Result<()> {
        require("accountId", &new.account_id)?;
        require("ownerId", &new.owner_id)?;
        require("categoryId", &new.category_id)?;
        require("description", &new.description)?;
        require_positive("amount", new.amount)
    }

    pub(crate) fn validate_transaction_update(update: &TransactionUpdate) -> Result<()> {
        match update.amount {
            Some(amount) => require_positive("amount", amount),
            None => Ok(()),
        }
    }

    /// Creates a transaction; when it is non-pending, its signed effect is
    /// applied to the owning account's balance in the same atomic commit.
    pub async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        Self::validate_new_transaction(&new)?;
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            account_id: new.account_id,
            transaction_type: new.transaction_type,
            amount: new.amount,
            category_id: new.category_id,
            description: new.description,
            date: new.date,
            tags: new.tags,
            is_pending: new.is_pending,
            owner_id: new.owner_id,
            created_at: now,
            updated_at: now,
        };
        let delta = transaction.effect();

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let account_doc = self
                .load_owned(
                    Collection::Accounts,
                    &transaction.account_id,
                    &transaction.owner_id,
                )
                .await?;
            let mut ops = vec![WriteOp::Insert {
                collection: Collection::Transactions,
                id: transaction.id.clone(),
                body: to_body(&transaction)?,
            }];
            if !delta.is_zero() {
                let account: Account = decode(&account_doc)?;
                ops.push(WriteOp::Update {
                    collection: Collection::Accounts,
                    id: account_doc.id.clone(),
                    patch: balance_patch(account.balance + delta, now)?,
                    expect_version: Some(account_doc.version),
                });
            }
            match self.store.commit(ops).await {
                Ok(()) => return Ok(transaction),
                Err(Error::Conflict(_)) if attempt < MAX_COMMIT_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(
            "transaction create retries exhausted".to_string(),
        ))
    }

    /// Merges the patch into the stored transaction and applies the balance
    /// delta (new effect minus old effect) atomically with the update. A
    /// zero delta skips the balance write entirely.
    pub async fn update_transaction(
        &self,
        caller_owner_id: &str,
        id: &str,
        update: TransactionUpdate,
    ) -> Result<Transaction> {
        Self::validate_transaction_update(&update)?;
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let doc = self
                .load_owned(Collection::Transactions, id, caller_owner_id)
                .await?;
            let existing: Transaction = decode(&doc)?;
            let old_effect = existing.effect();

            let mut merged = existing.clone();
            if let Some(transaction_type) = update.transaction_type {
                merged.transaction_type = transaction_type;
            }
            if let Some(amount) = update.amount {
                merged.amount = amount;
            }
            if let Some(category_id) = update.category_id.clone() {
                merged.category_id = category_id;
            }
            if let Some(description) = update.description.clone() {
                merged.description = description;
            }
            if let Some(date) = update.date {
                merged.date = date;
            }
            if let Some(tags) = update.tags.clone() {
                merged.tags = tags;
            }
            if let Some(is_pending) = update.is_pending {
                merged.is_pending = is_pending;
            }
            merged.updated_at = Utc::now();
            let delta = merged.effect() - old_effect;

            let mut ops = vec![WriteOp::Update {
                collection: Collection::Transactions,
                id: id.to_string(),
                patch: to_body(&merged)?,
                expect_version: Some(doc.version),
            }];
            if !delta.is_zero() {
                let account_doc = self
                    .load_account_for_balance(&existing.account_id, id)
                    .await?;
                let account: Account = decode(&account_doc)?;
                ops.push(WriteOp::Update {
                    collection: Collection::Accounts,
                    id: account_doc.id.clone(),
                    patch: balance_patch(account.balance + delta, merged.updated_at)?,
                    expect_version: Some(account_doc.version),
                });
            }
            match self.store.commit(ops).await {
                Ok(()) => return Ok(merged),
                Err(Error::Conflict(_)) if attempt < MAX_COMMIT_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(
            "transaction update retries exhausted".to_string(),
        ))
    }

    pub async fn get_transaction(&self, caller_owner_id: &str, id: &str) -> Result<Transaction> {
        let doc = self
            .load_owned(Collection::Transactions, id, caller_owner_id)
            .await?;
        decode(&doc)
    }

    /// Reverses the transaction's current effect on the account balance and
    /// deletes the record, atomically. The delete never applies without the
    /// reversal.
    pub async fn delete_transaction(&self, caller_owner_id: &str, id: &str) -> Result<()> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let doc = self
                .load_owned(Collection::Transactions, id, caller_owner_id)
                .await?;
            let existing: Transaction = decode(&doc)?;
            let reversal = -existing.effect();

            let mut ops = Vec::new();
            if !reversal.is_zero() {
                let account_doc = self
                    .load_account_for_balance(&existing.account_id, id)
                    .await?;
                let account: Account = decode(&account_doc)?;
                ops.push(WriteOp::Update {
                    collection: Collection::Accounts,
                    id: account_doc.id.clone(),
                    patch: balance_patch(account.balance + reversal, Utc::now())?,
                    expect_version: Some(account_doc.version),
                });
            }
            ops.push(WriteOp::Delete {
                collection: Collection::Transactions,
                id: id.to_string(),
                expect_version: Some(doc.version),
            });
            match self.store.commit(ops).await {
                Ok(()) => return Ok(()),
                Err(Error::Conflict(_)) if attempt < MAX_COMMIT_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(
            "transaction delete retries exhausted".to_string(),
        ))
    }

    /// Account lookup for the balance side-effect path. A missing account
    /// here means a transaction references a vanished account.
    async fn load_account_for_balance(
        &self,
        account_id: &str,
        transaction_id: &str,
    ) -> Result<Document> {
        match self.store.get(Collection::Accounts, account_id).await? {
            Some(doc) => Ok(doc),
            None => {
                error!(
                    "transaction '{transaction_id}' references missing account '{account_id}'; \
                     balance cannot be reconciled"
                );
                Err(Error::not_found("accounts", account_id))
            }
        }
    }

    pub async fn list_transactions(&self, owner_id: &str) -> Result<Vec<Transaction>> {
        let docs = self
            .store
            .list_by_owner(Collection::Transactions, &OwnerScope::owned(owner_id))
            .await?;
        Ok(decode_all(Collection::Transactions, &docs))
    }

    // ── Categories ──────────────────────────────────────────────────────────

    pub(crate) fn validate_new_category(new: &NewCategory) -> Result<()> {
        require("name", &new.name)?;
        require("color", &new.color)
    }

    pub(crate) fn validate_category_update(update: &CategoryUpdate) -> Result<()> {
        match &update.name {
            Some(name) => require("name", name),
            None => Ok(()),
        }
    }

    pub async fn create_category(&self, new: NewCategory) -> Result<Category> {
        Self::validate_new_category(&new)?;
        let category = Category {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            category_type: new.category_type,
            color: new.color,
            owner_id: new.owner_id,
            is_pending: false,
        };
        self.store
            .commit(vec![WriteOp::Insert {
                collection: Collection::Categories,
                id: category.id.clone(),
                body: to_body(&category)?,
            }])
            .await?;
        Ok(category)
    }

    pub async fn update_category(
        &self,
        caller_owner_id: &str,
        id: &str,
        update: CategoryUpdate,
    ) -> Result<Category> {
        Self::validate_category_update(&update)?;
        let doc = self
            .load_owned(Collection::Categories, id, caller_owner_id)
            .await?;
        let mut category: Category = decode(&doc)?;
        if let Some(name) = update.name {
            category.name = name;
        }
        if let Some(category_type) = update.category_type {
            category.category_type = category_type;
        }
        if let Some(color) = update.color {
            category.color = color;
        }
        self.store
            .commit(vec![WriteOp::Update {
                collection: Collection::Categories,
                id: id.to_string(),
                patch: to_body(&category)?,
                expect_version: Some(doc.version),
            }])
            .await?;
        Ok(category)
    }

    pub async fn delete_category(&self, caller_owner_id: &str, id: &str) -> Result<()> {
        let doc = self
            .load_owned(Collection::Categories, id, caller_owner_id)
            .await?;
        self.store
            .commit(vec![WriteOp::Delete {
                collection: Collection::Categories,
                id: id.to_string(),
                expect_version: Some(doc.version),
            }])
            .await
    }

    /// Shared system categories are readable by everyone; owned ones only by
    /// their owner.
    pub async fn get_category(&self, caller_owner_id: &str, id: &str) -> Result<Category> {
        let doc = self
            .store
            .get(Collection::Categories, id)
            .await?
            .ok_or_else(|| Error::not_found("categories", id))?;
        match doc.owner_id() {
            Some(owner) if owner != caller_owner_id => Err(Error::permission_denied(format!(
                "categories record '{id}' belongs to another user"
            ))),
            _ => decode(&doc),
        }
    }

    pub async fn list_categories(&self, owner_id: &str) -> Result<Vec<Category>> {
        let docs = self
            .store
            .list_by_owner(Collection::Categories, &OwnerScope::with_shared(owner_id))
            .await?;
        Ok(decode_all(Collection::Categories, &docs))
    }

    /// Seeds the shared system default category set if it is not present.
    /// Safe to call repeatedly; the existence check makes re-seeding a no-op
    /// and keeps the concurrent-seeding race window small.
    pub async fn ensure_default_categories(&self, owner_id: &str) -> Result<usize> {
        let existing = self
            .store
            .list_by_owner(Collection::Categories, &OwnerScope::with_shared(owner_id))
            .await?;
        if existing.iter().any(|doc| doc.owner_id().is_none()) {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(DEFAULT_CATEGORIES.len());
        for (name, flow, color) in DEFAULT_CATEGORIES {
            let category = Category {
                id: Uuid::new_v4().to_string(),
                name: (*name).to_string(),
                category_type: *flow,
                color: (*color).to_string(),
                owner_id: None,
                is_pending: false,
            };
            ops.push(WriteOp::Insert {
                collection: Collection::Categories,
                id: category.id.clone(),
                body: to_body(&category)?,
            });
        }
        let seeded = ops.len();
        self.store.commit(ops).await?;
        info!("seeded {seeded} default categories");
        Ok(seeded)
    }

    // ── Goals ───────────────────────────────────────────────────────────────

    pub(crate) fn validate_new_goal(new: &NewGoal) -> Result<()> {
        require("name", &new.name)?;
        require("ownerId", &new.owner_id)?;
        require_positive("targetAmount", new.target_amount)
    }

    pub(crate) fn validate_goal_update(update: &GoalUpdate) -> Result<()> {
        match update.target_amount {
            Some(target) => require_positive("targetAmount", target),
            None => Ok(()),
        }
    }

    pub async fn create_goal(&self, new: NewGoal) -> Result<Goal> {
        Self::validate_new_goal(&new)?;
        let mut goal = Goal {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id,
            name: new.name,
            target_amount: new.target_amount,
            current_amount: new.current_amount,
            deadline: new.deadline,
            is_completed: false,
        };
        goal.recompute_completion();
        self.store
            .commit(vec![WriteOp::Insert {
                collection: Collection::Goals,
                id: goal.id.clone(),
                body: to_body(&goal)?,
            }])
            .await?;
        Ok(goal)
    }

    /// Goal update recomputes the completion flag on every write.
    pub async fn update_goal(
        &self,
        caller_owner_id: &str,
        id: &str,
        update: GoalUpdate,
    ) -> Result<Goal> {
        Self::validate_goal_update(&update)?;
        let doc = self.load_owned(Collection::Goals, id, caller_owner_id).await?;
        let mut goal: Goal = decode(&doc)?;
        if let Some(name) = update.name {
            goal.name = name;
        }
        if let Some(target_amount) = update.target_amount {
            goal.target_amount = target_amount;
        }
        if let Some(current_amount) = update.current_amount {
            goal.current_amount = current_amount;
        }
        if let Some(deadline) = update.deadline {
            goal.deadline = deadline;
        }
        goal.recompute_completion();
        self.store
            .commit(vec![WriteOp::Update {
                collection: Collection::Goals,
                id: id.to_string(),
                patch: to_body(&goal)?,
                expect_version: Some(doc.version),
            }])
            .await?;
        Ok(goal)
    }

    pub async fn delete_goal(&self, caller_owner_id: &str, id: &str) -> Result<()> {
        let doc = self.load_owned(Collection::Goals, id, caller_owner_id).await?;
        self.store
            .commit(vec![WriteOp::Delete {
                collection: Collection::Goals,
                id: id.to_string(),
                expect_version: Some(doc.version),
            }])
            .await
    }

    pub async fn get_goal(&self, caller_owner_id: &str, id: &str) -> Result<Goal> {
        let doc = self.load_owned(Collection::Goals, id, caller_owner_id).await?;
        decode(&doc)
    }

    pub async fn list_goals(&self, owner_id: &str) -> Result<Vec<Goal>> {
        let docs = self
            .store
            .list_by_owner(Collection::Goals, &OwnerScope::owned(owner_id))
            .await?;
        Ok(decode_all(Collection::Goals, &docs))
    }

    // ── Queue replay ────────────────────────────────────────────────────────

    /// Applies a queued mutation through the method matching its
    /// (kind, collection). The payload is validated again at replay time.
    pub async fn apply_pending_operation(&self, op: &PendingOperation) -> Result<()> {
        let mut payload = op.payload.clone();
        if op.collection == Collection::Transactions {
            // Foreign payloads may carry a datetime where the schema expects
            // a calendar day.
            normalize_date_field(&mut payload);
        }
        validate_payload(op.kind, op.collection, op.document_id.as_deref(), &payload)?;
        let target_id = op.document_id.clone().unwrap_or_default();

        match (op.kind, op.collection) {
            (OperationKind::Create, Collection::Accounts) => {
                let new: NewAccount = decode_payload(&payload)?;
                Self::check_payload_owner(&new.owner_id, &op.owner_id)?;
                self.create_account(new).await.map(|_| ())
            }
            (OperationKind::Create, Collection::Transactions) => {
                let new: NewTransaction = decode_payload(&payload)?;
                Self::check_payload_owner(&new.owner_id, &op.owner_id)?;
                self.create_transaction(new).await.map(|_| ())
            }
            (OperationKind::Create, Collection::Categories) => {
                let new: NewCategory = decode_payload(&payload)?;
                if let Some(owner) = &new.owner_id {
                    Self::check_payload_owner(owner, &op.owner_id)?;
                }
                self.create_category(new).await.map(|_| ())
            }
            (OperationKind::Create, Collection::Goals) => {
                let new: NewGoal = decode_payload(&payload)?;
                Self::check_payload_owner(&new.owner_id, &op.owner_id)?;
                self.create_goal(new).await.map(|_| ())
            }
            (OperationKind::Update, Collection::Accounts) => {
                let update: AccountUpdate = decode_payload(&payload)?;
                self.update_account(&op.owner_id, &target_id, update)
                    .await
                    .map(|_| ())
            }
            (OperationKind::Update, Collection::Transactions) => {
                let update: TransactionUpdate = decode_payload(&payload)?;
                self.update_transaction(&op.owner_id, &target_id, update)
                    .await
                    .map(|_| ())
            }
            (OperationKind::Update, Collection::Categories) => {
                let update: CategoryUpdate = decode_payload(&payload)?;
                self.update_category(&op.owner_id, &target_id, update)
                    .await
                    .map(|_| ())
            }
            (OperationKind::Update, Collection::Goals) => {
                let update: GoalUpdate = decode_payload(&payload)?;
                self.update_goal(&op.owner_id, &target_id, update)
                    .await
                    .map(|_| ())
            }
            (OperationKind::Delete, Collection::Accounts) => {
                self.delete_account(&op.owner_id, &target_id).await
            }
            (OperationKind::Delete, Collection::Transactions) => {
                self.delete_transaction(&op.owner_id, &target_id).await
            }
            (OperationKind::Delete, Collection::Categories) => {
                self.delete_category(&op.owner_id, &target_id).await
            }
            (OperationKind::Delete, Collection::Goals) => {
                self.delete_goal(&op.owner_id, &target_id).await
            }
        }
    }

    fn check_payload_owner(payload_owner: &str, record_owner: &str) -> Result<()> {
        if payload_owner == record_owner {
            Ok(())
        } else {
            Err(Error::permission_denied(
                "queued payload owner does not match the record owner",
            ))
        }
    }
}

fn decode_all<T: DeserializeOwned>(collection: Collection, docs: &[Document]) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match decode::<T>(doc) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("skipping undecodable {collection} document '{}': {e}", doc.id);
                None
            }
        })
        .collect()
}
