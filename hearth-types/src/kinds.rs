//! Household record kinds synchronized by the app.
//!
//! Only the fields the sync layer and its tests care about are modelled
//! here; unknown fields written by newer app versions are kept in `extra`
//! so a round trip through an older client does not drop them.

use crate::{ProfileId, RecordPayload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealLog {
    pub profile_id: ProfileId,
    pub description: String,
    /// Meal time in milliseconds since the Unix epoch.
    pub eaten_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<crate::RecordId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordPayload for MealLog {
    const COLLECTION: &'static str = "meal_logs";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepLog {
    pub profile_id: ProfileId,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordPayload for SleepLog {
    const COLLECTION: &'static str = "sleep_logs";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub title: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Recipe {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ingredients: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl RecordPayload for Recipe {
    const COLLECTION: &'static str = "recipes";
}

/// A user-defined food or product that is not in the built-in catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomItem {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordPayload for CustomItem {
    const COLLECTION: &'static str = "custom_items";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingItem {
    pub name: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShoppingItem {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checked: false,
            extra: Map::new(),
        }
    }
}

impl RecordPayload for ShoppingItem {
    const COLLECTION: &'static str = "shopping_items";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProfile {
    pub profile_id: ProfileId,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordPayload for ChildProfile {
    const COLLECTION: &'static str = "profiles";
}

/// Record sets that follow a collaboration grant by default.
pub const DEFAULT_SHAREABLE_COLLECTIONS: [&str; 3] = [
    Recipe::COLLECTION,
    CustomItem::COLLECTION,
    ShoppingItem::COLLECTION,
];
