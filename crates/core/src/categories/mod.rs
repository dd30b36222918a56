//! Category domain model and the system default set.

use serde::{Deserialize, Serialize};

use crate::transactions::FlowType;

/// A transaction category. `owner_id` is `None` for the system-default
/// categories shared across all users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: FlowType,
    pub color: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_pending: bool,
}

/// Payload for creating a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: FlowType,
    pub color: String,
    pub owner_id: Option<String>,
}

/// Patch payload for updating a category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub category_type: Option<FlowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Fixed default category set seeded once per user on first use.
pub const DEFAULT_CATEGORIES: &[(&str, FlowType, &str)] = &[
    ("Salary", FlowType::Income, "#4CAF50"),
    ("Freelance", FlowType::Income, "#8BC34A"),
    ("Investments", FlowType::Income, "#009688"),
    ("Other Income", FlowType::Income, "#CDDC39"),
    ("Groceries", FlowType::Expense, "#FF9800"),
    ("Rent", FlowType::Expense, "#795548"),
    ("Utilities", FlowType::Expense, "#607D8B"),
    ("Transport", FlowType::Expense, "#3F51B5"),
    ("Dining", FlowType::Expense, "#E91E63"),
    ("Health", FlowType::Expense, "#F44336"),
    ("Entertainment", FlowType::Expense, "#9C27B0"),
    ("Other Expenses", FlowType::Expense, "#9E9E9E"),
];
