//! End-to-end offline flow: mutations queue while offline, replay on
//! reconnect, and the optimistic view reconciles with confirmed state.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fintrack_core::accounts::{AccountType, NewAccount};
use fintrack_core::connectivity::ConnectivityMonitor;
use fintrack_core::facade::{FinanceFacade, TEMP_ID_PREFIX};
use fintrack_core::queue::{MemoryPendingQueue, PendingQueue};
use fintrack_core::store::{DocumentStore, MemoryDocumentStore};
use fintrack_core::transactions::{FlowType, NewTransaction};

struct Harness {
    store: Arc<MemoryDocumentStore>,
    connectivity: Arc<ConnectivityMonitor>,
    facade: Arc<FinanceFacade>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let queue = Arc::new(MemoryPendingQueue::new());
    let connectivity = Arc::new(ConnectivityMonitor::new(true));
    let facade = FinanceFacade::new(
        "u1",
        store.clone() as Arc<dyn DocumentStore>,
        queue as Arc<dyn PendingQueue>,
        connectivity.clone(),
    )
    .await
    .expect("facade");
    Harness {
        store,
        connectivity,
        facade,
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn wallet(owner: &str) -> NewAccount {
    NewAccount {
        name: "Wallet".to_string(),
        account_type: AccountType::Wallet,
        owner_id: owner.to_string(),
        balance: Decimal::ZERO,
    }
}

fn transaction(account_id: &str, flow: FlowType, amount: Decimal) -> NewTransaction {
    NewTransaction {
        account_id: account_id.to_string(),
        transaction_type: flow,
        amount,
        category_id: "cat-general".to_string(),
        description: "entry".to_string(),
        date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        tags: vec![],
        is_pending: false,
        owner_id: "u1".to_string(),
    }
}

#[tokio::test]
async fn offline_mutations_replay_on_reconnect_and_balance_reconciles() {
    let h = harness().await;
    let account_id = h.facade.add_account(wallet("u1")).await.unwrap();

    h.connectivity.set_online(false);
    let first = h
        .facade
        .add_transaction(transaction(&account_id, FlowType::Income, dec!(100)))
        .await
        .unwrap();
    let second = h
        .facade
        .add_transaction(transaction(&account_id, FlowType::Expense, dec!(25)))
        .await
        .unwrap();

    assert!(first.starts_with(TEMP_ID_PREFIX));
    assert!(second.starts_with(TEMP_ID_PREFIX));
    assert_ne!(first, second);
    assert_eq!(h.facade.pending_operations_count(), 2);

    let pending = h.facade.transactions();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|tx| tx.is_pending));

    // Reconnect: the driver replays the queue, FIFO, exactly once.
    h.connectivity.set_online(true);
    wait_until("queue drain", || h.facade.pending_operations_count() == 0).await;
    wait_until("view reconciliation", || {
        let accounts = h.facade.accounts();
        let transactions = h.facade.transactions();
        accounts.len() == 1
            && accounts[0].balance == dec!(75)
            && transactions.len() == 2
            && transactions
                .iter()
                .all(|tx| !tx.is_pending && !tx.id.starts_with(TEMP_ID_PREFIX))
    })
    .await;
}

#[tokio::test]
async fn backend_outage_queues_and_manual_sync_recovers() {
    let h = harness().await;
    let account_id = h.facade.add_account(wallet("u1")).await.unwrap();

    // Online but the backend is down: the write falls back to the queue.
    h.store.set_available(false);
    let temp_id = h
        .facade
        .add_transaction(transaction(&account_id, FlowType::Income, dec!(40)))
        .await
        .unwrap();
    assert!(temp_id.starts_with(TEMP_ID_PREFIX));
    assert_eq!(h.facade.pending_operations_count(), 1);

    h.store.set_available(true);
    let synced = h.facade.process_pending_operations().await.unwrap();
    assert_eq!(synced, 1);
    assert_eq!(h.facade.pending_operations_count(), 0);

    wait_until("balance reconciliation", || {
        let accounts = h.facade.accounts();
        accounts.len() == 1 && accounts[0].balance == dec!(40)
    })
    .await;
}

#[tokio::test]
async fn updates_and_deletes_keep_causal_order_through_the_queue() {
    let h = harness().await;
    let account_id = h.facade.add_account(wallet("u1")).await.unwrap();
    let tx_id = h
        .facade
        .add_transaction(transaction(&account_id, FlowType::Income, dec!(100)))
        .await
        .unwrap();

    h.connectivity.set_online(false);
    h.facade
        .update_transaction(
            &tx_id,
            fintrack_core::transactions::TransactionUpdate {
                amount: Some(dec!(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // The optimistic view shows the intended amount before replay.
    assert_eq!(h.facade.transactions()[0].amount, dec!(60));

    h.connectivity.set_online(true);
    wait_until("queue drain", || h.facade.pending_operations_count() == 0).await;
    wait_until("delta application", || {
        let accounts = h.facade.accounts();
        accounts.len() == 1 && accounts[0].balance == dec!(60)
    })
    .await;
}
