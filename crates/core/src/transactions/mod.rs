//! Transaction domain model and the signed-effect rule.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a transaction's effect on its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Income,
    Expense,
}

/// An income or expense entry against one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub transaction_type: FlowType,
    /// Positive amount; the sign of the balance effect is implied by `type`.
    pub amount: Decimal,
    pub category_id: String,
    pub description: String,
    /// Calendar day, no time-of-day semantics.
    pub date: NaiveDate,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pending transactions do not count toward the account balance.
    #[serde(default)]
    pub is_pending: bool,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed contribution of this transaction to its account's balance:
    /// `+amount` for non-pending income, `-amount` for non-pending expense,
    /// zero while pending.
    pub fn effect(&self) -> Decimal {
        effect(self.transaction_type, self.amount, self.is_pending)
    }
}

/// Signed-effect rule, usable on merged field sets before a `Transaction`
/// value exists.
pub fn effect(transaction_type: FlowType, amount: Decimal, is_pending: bool) -> Decimal {
    if is_pending {
        return Decimal::ZERO;
    }
    match transaction_type {
        FlowType::Income => amount,
        FlowType::Expense => -amount,
    }
}

/// Payload for creating a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub account_id: String,
    #[serde(rename = "type")]
    pub transaction_type: FlowType,
    pub amount: Decimal,
    pub category_id: String,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_pending: bool,
    pub owner_id: String,
}

/// Patch payload for updating a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionUpdate {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<FlowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pending: Option<bool>,
}
