use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use pickline_core::{DomainError, LocationId, PickingListId, PickingListItemId, ProductId, UserId};

/// Picking line lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickingItemStatus {
    /// Waiting to be picked; stock not yet deducted.
    Pending,
    /// Picked and deducted from stock.
    Validated,
}

impl PickingItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickingItemStatus::Pending => "PENDING",
            PickingItemStatus::Validated => "VALIDATED",
        }
    }
}

impl FromStr for PickingItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PickingItemStatus::Pending),
            "VALIDATED" => Ok(PickingItemStatus::Validated),
            other => Err(DomainError::validation(format!(
                "unknown picking item status: {other}"
            ))),
        }
    }
}

/// One line of a picking list.
///
/// `suggested_location_id == None` means the line was recorded as backorder
/// and gets a location assigned when it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickingListItem {
    pub id: PickingListItemId,
    pub picking_list_id: PickingListId,
    pub product_id: ProductId,
    pub original_sku: String,
    pub quantity: i64,
    pub status: PickingItemStatus,
    pub suggested_location_id: Option<LocationId>,
    pub validated_by: Option<UserId>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl PickingListItem {
    pub fn is_backorder(&self) -> bool {
        self.suggested_location_id.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.status == PickingItemStatus::Pending
    }
}

/// A picking line that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPickingListItem {
    pub product_id: ProductId,
    pub original_sku: String,
    pub quantity: i64,
    pub suggested_location_id: Option<LocationId>,
}
