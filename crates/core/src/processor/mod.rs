//! Queue processor: drains the local durable queue against the gateway.
//!
//! Per-record lifecycle: `Pending → (Succeeded | Retrying → Pending | Abandoned)`.
//! A failed record only gets retry bookkeeping within a run — the next
//! attempt happens on a later run, so a transient outage never turns into a
//! tight failure loop. Records that exhaust the retry cap get one best-effort
//! self-repair pass before being abandoned.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::connectivity::ConnectivityMonitor;
use crate::errors::Result;
use crate::gateway::RemoteGateway;
use crate::queue::{strip_null_keys, OperationKind, PendingOperation, PendingQueue};
use crate::store::{Collection, DocumentBody};

/// A record that has failed this many times is no longer retried normally.
pub const MAX_QUEUE_ATTEMPTS: i32 = 5;

/// Outcome of one processing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Records applied and removed this run.
    pub synced: usize,
    /// Queue ids of the synced records, for optimistic-view reconciliation.
    pub succeeded_ids: Vec<i64>,
    /// Queue ids dropped after the retry cap and failed self-repair.
    pub abandoned_ids: Vec<i64>,
}

impl ProcessOutcome {
    pub fn abandoned(&self) -> usize {
        self.abandoned_ids.len()
    }
}

/// A narrowly-scoped correction for a known-recoverable payload shape,
/// evaluated before abandonment.
pub struct RepairRule {
    pub name: &'static str,
    pub applies: fn(&PendingOperation) -> bool,
    pub repair: fn(&mut DocumentBody),
}

/// The shipped repair rules: strip explicit nulls, and default a missing
/// `tags` field on create-transaction payloads to an empty set.
pub fn default_repair_rules() -> Vec<RepairRule> {
    vec![
        RepairRule {
            name: "strip-null-keys",
            applies: |op| op.payload.values().any(Value::is_null),
            repair: strip_null_keys,
        },
        RepairRule {
            name: "default-missing-tags",
            applies: |op| {
                op.kind == OperationKind::Create
                    && op.collection == Collection::Transactions
                    && op.payload.get("tags").map(Value::is_null).unwrap_or(true)
            },
            repair: |payload| {
                payload.insert("tags".to_string(), Value::Array(Vec::new()));
            },
        },
    ]
}

/// Drains queued mutations in FIFO order when connectivity allows.
pub struct QueueProcessor {
    queue: Arc<dyn PendingQueue>,
    gateway: Arc<RemoteGateway>,
    connectivity: Arc<ConnectivityMonitor>,
    repair_rules: Vec<RepairRule>,
    run_lock: Mutex<()>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn PendingQueue>,
        gateway: Arc<RemoteGateway>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self::with_repair_rules(queue, gateway, connectivity, default_repair_rules())
    }

    pub fn with_repair_rules(
        queue: Arc<dyn PendingQueue>,
        gateway: Arc<RemoteGateway>,
        connectivity: Arc<ConnectivityMonitor>,
        repair_rules: Vec<RepairRule>,
    ) -> Self {
        Self {
            queue,
            gateway,
            connectivity,
            repair_rules,
            run_lock: Mutex::new(()),
        }
    }

    /// Runs one processing pass. A no-op while offline, and single-flight:
    /// a run requested while another is in progress is coalesced into that
    /// run's result (returns an empty outcome).
    pub async fn process(&self) -> Result<ProcessOutcome> {
        if !self.connectivity.is_online() {
            debug!("skipping queue processing: offline");
            return Ok(ProcessOutcome::default());
        }
        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("queue processing already in progress, coalescing");
            return Ok(ProcessOutcome::default());
        };

        let records = self.queue.dequeue_all_ordered()?;
        if records.is_empty() {
            return Ok(ProcessOutcome::default());
        }
        debug!("processing {} queued operation(s)", records.len());

        let mut outcome = ProcessOutcome::default();
        for record in records {
            match self.gateway.apply_pending_operation(&record).await {
                Ok(()) => {
                    self.queue.remove(record.id).await?;
                    outcome.succeeded_ids.push(record.id);
                    outcome.synced += 1;
                }
                Err(err) => {
                    let attempts = record.retry_count + 1;
                    if err.is_terminal_for_replay() || attempts >= MAX_QUEUE_ATTEMPTS {
                        self.repair_or_abandon(record, &mut outcome, err.to_string())
                            .await?;
                    } else {
                        warn!(
                            "queued {} {} (id {}) failed attempt {}/{}: {err}",
                            record.kind.as_str(),
                            record.collection,
                            record.id,
                            attempts,
                            MAX_QUEUE_ATTEMPTS
                        );
                        self.queue
                            .update_retry(record.id, attempts, &err.to_string())
                            .await?;
                    }
                }
            }
        }

        if outcome.synced > 0 {
            info!("synced {} queued operation(s)", outcome.synced);
        }
        Ok(outcome)
    }

    /// Applies the first-matching repair rules, resets the retry count, and
    /// makes one immediate re-attempt. If no rule applies or the repaired
    /// attempt still fails, the record is abandoned: removed from the queue
    /// so the rest of the backlog keeps moving.
    async fn repair_or_abandon(
        &self,
        record: PendingOperation,
        outcome: &mut ProcessOutcome,
        last_error: String,
    ) -> Result<()> {
        let Some(repaired) = self.try_repair(&record) else {
            return self.abandon(record, outcome, last_error).await;
        };

        self.queue
            .update_retry(record.id, 0, "self-repair applied")
            .await?;
        match self.gateway.apply_pending_operation(&repaired).await {
            Ok(()) => {
                self.queue.remove(record.id).await?;
                outcome.succeeded_ids.push(record.id);
                outcome.synced += 1;
                info!(
                    "self-repair recovered queued {} {} (id {})",
                    record.kind.as_str(),
                    record.collection,
                    record.id
                );
                Ok(())
            }
            Err(err) => self.abandon(record, outcome, err.to_string()).await,
        }
    }

    fn try_repair(&self, record: &PendingOperation) -> Option<PendingOperation> {
        let mut repaired = record.clone();
        let mut applied = false;
        for rule in &self.repair_rules {
            if (rule.applies)(&repaired) {
                debug!("applying repair rule '{}' to queue id {}", rule.name, record.id);
                (rule.repair)(&mut repaired.payload);
                applied = true;
            }
        }
        applied.then(|| {
            repaired.retry_count = 0;
            repaired
        })
    }

    async fn abandon(
        &self,
        record: PendingOperation,
        outcome: &mut ProcessOutcome,
        last_error: String,
    ) -> Result<()> {
        error!(
            "abandoning queued {} {} (id {}, owner {}) after {} attempt(s): {last_error}",
            record.kind.as_str(),
            record.collection,
            record.id,
            record.owner_id,
            record.retry_count + 1,
        );
        self.queue.remove(record.id).await?;
        outcome.abandoned_ids.push(record.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountType, NewAccount};
    use crate::goals::NewGoal;
    use crate::queue::{MemoryPendingQueue, NewPendingOperation};
    use crate::store::MemoryDocumentStore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        queue: Arc<MemoryPendingQueue>,
        gateway: Arc<RemoteGateway>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let gateway = Arc::new(RemoteGateway::new(store.clone()));
        Fixture {
            store,
            queue: Arc::new(MemoryPendingQueue::new()),
            gateway,
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
        }
    }

    fn processor(f: &Fixture) -> QueueProcessor {
        QueueProcessor::new(f.queue.clone(), f.gateway.clone(), f.connectivity.clone())
    }

    fn object(value: serde_json::Value) -> DocumentBody {
        value.as_object().unwrap().clone()
    }

    async fn seed_goal(f: &Fixture) -> String {
        f.gateway
            .create_goal(NewGoal {
                owner_id: "u1".to_string(),
                name: "Bike".to_string(),
                target_amount: dec!(500),
                current_amount: dec!(0),
                deadline: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn replay_applies_remote_effects_in_fifo_order() {
        let f = fixture();
        let goal_id = seed_goal(&f).await;

        for name in ["First", "Second"] {
            f.queue
                .enqueue(NewPendingOperation {
                    kind: OperationKind::Update,
                    collection: Collection::Goals,
                    document_id: Some(goal_id.clone()),
                    payload: object(json!({ "name": name })),
                    owner_id: "u1".to_string(),
                })
                .await
                .unwrap();
        }

        let outcome = processor(&f).process().await.unwrap();
        assert_eq!(outcome.synced, 2);
        assert_eq!(f.queue.count().unwrap(), 0);

        let goals = f.gateway.list_goals("u1").await.unwrap();
        assert_eq!(goals[0].name, "Second");
    }

    #[tokio::test]
    async fn offline_run_is_a_noop() {
        let f = fixture();
        let goal_id = seed_goal(&f).await;
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Delete,
                collection: Collection::Goals,
                document_id: Some(goal_id),
                payload: DocumentBody::new(),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();

        f.connectivity.set_online(false);
        let outcome = processor(&f).process().await.unwrap();
        assert_eq!(outcome, ProcessOutcome::default());
        assert_eq!(f.queue.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_up_to_cap_then_abandon() {
        let f = fixture();
        let account = f
            .gateway
            .create_account(NewAccount {
                name: "Wallet".to_string(),
                account_type: AccountType::Wallet,
                owner_id: "u1".to_string(),
                balance: dec!(0),
            })
            .await
            .unwrap();
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Create,
                collection: Collection::Transactions,
                document_id: None,
                payload: object(json!({
                    "accountId": account.id,
                    "type": "expense",
                    "amount": "10",
                    "categoryId": "c1",
                    "description": "coffee",
                    "date": "2026-08-01",
                    "ownerId": "u1",
                    "tags": ["drinks"],
                })),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();

        f.store.set_available(false);
        let p = processor(&f);
        for expected_retry in 1..MAX_QUEUE_ATTEMPTS {
            let outcome = p.process().await.unwrap();
            assert_eq!(outcome.synced, 0);
            assert_eq!(outcome.abandoned(), 0);
            let records = f.queue.dequeue_all_ordered().unwrap();
            assert_eq!(records[0].retry_count, expected_retry);
            assert!(records[0].last_error.is_some());
        }

        // Fifth failure hits the cap. No repair rule applies (tags present,
        // no nulls), so the record is abandoned.
        let outcome = p.process().await.unwrap();
        assert_eq!(outcome.abandoned(), 1);
        assert_eq!(f.queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_failure_goes_through_repair_and_recovers() {
        let f = fixture();
        let goal_id = seed_goal(&f).await;
        // Empty name fails validation (terminal) until the rule rewrites it.
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Update,
                collection: Collection::Goals,
                document_id: Some(goal_id.clone()),
                payload: object(json!({ "name": "" })),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();

        let rules = vec![RepairRule {
            name: "fill-empty-goal-name",
            applies: |op| {
                op.payload
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::is_empty)
                    .unwrap_or(false)
            },
            repair: |payload| {
                payload.insert("name".to_string(), Value::String("Untitled".to_string()));
            },
        }];
        let p = QueueProcessor::with_repair_rules(
            f.queue.clone(),
            f.gateway.clone(),
            f.connectivity.clone(),
            rules,
        );

        let outcome = p.process().await.unwrap();
        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.abandoned(), 0);
        assert_eq!(f.queue.count().unwrap(), 0);
        assert_eq!(f.gateway.list_goals("u1").await.unwrap()[0].name, "Untitled");
    }

    #[tokio::test]
    async fn terminal_failure_without_applicable_repair_is_abandoned_once() {
        let f = fixture();
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Delete,
                collection: Collection::Goals,
                document_id: Some("missing-goal".to_string()),
                payload: DocumentBody::new(),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();

        let outcome = processor(&f).process().await.unwrap();
        assert_eq!(outcome.abandoned(), 1);
        assert_eq!(f.queue.count().unwrap(), 0);
    }

    #[test]
    fn default_rules_fill_missing_tags_and_strip_nulls() {
        let rules = default_repair_rules();
        let mut op = PendingOperation {
            id: 7,
            kind: OperationKind::Create,
            collection: Collection::Transactions,
            document_id: None,
            payload: object(json!({ "accountId": "a1", "memo": null })),
            owner_id: "u1".to_string(),
            enqueued_at: chrono::Utc::now(),
            retry_count: 5,
            last_error: None,
        };

        let strip = &rules[0];
        let tags = &rules[1];
        assert!((strip.applies)(&op));
        assert!((tags.applies)(&op));

        (strip.repair)(&mut op.payload);
        (tags.repair)(&mut op.payload);
        assert!(!op.payload.contains_key("memo"));
        assert_eq!(op.payload.get("tags"), Some(&json!([])));
    }

    #[tokio::test]
    async fn null_tags_create_is_self_repaired_and_synced() {
        let f = fixture();
        let account = f
            .gateway
            .create_account(NewAccount {
                name: "Wallet".to_string(),
                account_type: AccountType::Wallet,
                owner_id: "u1".to_string(),
                balance: dec!(0),
            })
            .await
            .unwrap();
        // A legacy record with an explicit null tags field: invalid at
        // replay until the default rules rewrite it.
        f.queue.inject_raw(PendingOperation {
            id: 0,
            kind: OperationKind::Create,
            collection: Collection::Transactions,
            document_id: None,
            payload: object(json!({
                "accountId": account.id,
                "type": "expense",
                "amount": "10",
                "categoryId": "c1",
                "description": "coffee",
                "date": "2026-08-01",
                "ownerId": "u1",
                "tags": null,
            })),
            owner_id: "u1".to_string(),
            enqueued_at: chrono::Utc::now(),
            retry_count: 0,
            last_error: None,
        });

        let outcome = processor(&f).process().await.unwrap();
        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.abandoned(), 0);
        assert_eq!(f.queue.count().unwrap(), 0);

        let transactions = f.gateway.list_transactions("u1").await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert!(transactions[0].tags.is_empty());
    }

    #[tokio::test]
    async fn repair_earns_exactly_one_extra_attempt_before_abandonment() {
        let f = fixture();
        // Tags omitted: a repairable shape. The backend stays down, so the
        // repaired re-attempt fails too; the reset must not buy another
        // five-retry cycle.
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Create,
                collection: Collection::Transactions,
                document_id: None,
                payload: object(json!({
                    "accountId": "a1",
                    "type": "expense",
                    "amount": "10",
                    "categoryId": "c1",
                    "description": "coffee",
                    "date": "2026-08-01",
                    "ownerId": "u1",
                })),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();

        f.store.set_available(false);
        let p = processor(&f);
        for _ in 1..MAX_QUEUE_ATTEMPTS {
            assert_eq!(p.process().await.unwrap().abandoned(), 0);
        }
        let outcome = p.process().await.unwrap();
        assert_eq!(outcome.abandoned(), 1);
        assert_eq!(outcome.synced, 0);
        assert_eq!(f.queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_with_empty_payload_is_enqueueable() {
        // Guards the validate-at-enqueue contract for deletes.
        let f = fixture();
        let goal_id = seed_goal(&f).await;
        f.queue
            .enqueue(NewPendingOperation {
                kind: OperationKind::Delete,
                collection: Collection::Goals,
                document_id: Some(goal_id),
                payload: DocumentBody::new(),
                owner_id: "u1".to_string(),
            })
            .await
            .unwrap();
        let outcome = processor(&f).process().await.unwrap();
        assert_eq!(outcome.synced, 1);
        assert!(f.gateway.list_goals("u1").await.unwrap().is_empty());
    }
}
