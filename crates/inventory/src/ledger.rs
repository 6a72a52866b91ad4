//! Stock movement ledger records.
//!
//! Every quantity change is written exactly once as a movement and never
//! updated afterwards. Quantities are unsigned; direction is carried by
//! `from_location_id` (stock left) and `to_location_id` (stock arrived).

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use pickline_core::{DomainError, DomainResult, LocationId, PickingListItemId, ProductId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Sale,
    Adjustment,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Sale => "SALE",
            MovementType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SALE" => Ok(MovementType::Sale),
            "ADJUSTMENT" => Ok(MovementType::Adjustment),
            other => Err(DomainError::validation(format!("unknown movement type: {other}"))),
        }
    }
}

/// A movement about to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStockMovement {
    pub product_id: ProductId,
    pub quantity: i64,
    pub from_location_id: Option<LocationId>,
    pub to_location_id: Option<LocationId>,
    pub movement_type: MovementType,
    pub user_id: UserId,
    pub notes: Option<String>,
}

impl NewStockMovement {
    /// Stock leaving `from` to fulfil a picking line.
    pub fn sale(
        product_id: ProductId,
        from: LocationId,
        quantity: i64,
        user_id: UserId,
        item_id: PickingListItemId,
        sku: &str,
    ) -> DomainResult<Self> {
        ensure_positive(quantity)?;
        Ok(Self {
            product_id,
            quantity,
            from_location_id: Some(from),
            to_location_id: None,
            movement_type: MovementType::Sale,
            user_id,
            notes: Some(format!("picking item {item_id} ({sku})")),
        })
    }

    /// A stock-count correction at `location` by `delta` (non-zero).
    pub fn adjustment(
        product_id: ProductId,
        location: LocationId,
        delta: i64,
        user_id: UserId,
        notes: Option<String>,
    ) -> DomainResult<Self> {
        if delta == 0 {
            return Err(DomainError::validation("adjustment delta cannot be zero"));
        }
        let (from, to) = if delta < 0 {
            (Some(location), None)
        } else {
            (None, Some(location))
        };
        Ok(Self {
            product_id,
            quantity: delta.abs(),
            from_location_id: from,
            to_location_id: to,
            movement_type: MovementType::Adjustment,
            user_id,
            notes,
        })
    }

    /// Signed effect on the given location.
    pub fn delta_at(&self, location: LocationId) -> i64 {
        let mut delta = 0;
        if self.to_location_id == Some(location) {
            delta += self.quantity;
        }
        if self.from_location_id == Some(location) {
            delta -= self.quantity;
        }
        delta
    }
}

/// A movement as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: i64,
    pub movement: NewStockMovement,
    pub created_at: DateTime<Utc>,
}

fn ensure_positive(quantity: i64) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation(format!(
            "movement quantity must be positive (got {quantity})"
        )));
    }
    Ok(())
}
