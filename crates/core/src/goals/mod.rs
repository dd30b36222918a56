//! Savings goal domain model.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A savings goal. `is_completed` is derived: true exactly when
/// `current_amount >= target_amount`, recomputed on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub target_amount: Decimal,
    #[serde(default)]
    pub current_amount: Decimal,
    pub deadline: NaiveDate,
    #[serde(default)]
    pub is_completed: bool,
}

impl Goal {
    /// Recompute the derived completion flag from the amounts.
    pub fn recompute_completion(&mut self) {
        self.is_completed = is_completed(self.current_amount, self.target_amount);
    }
}

/// Completion rule shared by create and update paths.
pub fn is_completed(current_amount: Decimal, target_amount: Decimal) -> bool {
    current_amount >= target_amount
}

/// Payload for creating a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGoal {
    pub owner_id: String,
    pub name: String,
    pub target_amount: Decimal,
    #[serde(default)]
    pub current_amount: Decimal,
    pub deadline: NaiveDate,
}

/// Patch payload for updating a goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<NaiveDate>,
}
