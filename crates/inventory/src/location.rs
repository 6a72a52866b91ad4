use core::str::FromStr;

use serde::{Deserialize, Serialize};

use pickline_core::{DomainError, LocationId};

/// What a location is used for. Only `Display` locations take part in
/// customer-order picking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationPurpose {
    Display,
    Storage,
    Returns,
}

impl LocationPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationPurpose::Display => "DISPLAY",
            LocationPurpose::Storage => "STORAGE",
            LocationPurpose::Returns => "RETURNS",
        }
    }

    pub fn is_pickable(&self) -> bool {
        matches!(self, LocationPurpose::Display)
    }
}

impl FromStr for LocationPurpose {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DISPLAY" => Ok(LocationPurpose::Display),
            "STORAGE" => Ok(LocationPurpose::Storage),
            "RETURNS" => Ok(LocationPurpose::Returns),
            other => Err(DomainError::validation(format!(
                "unknown location purpose: {other}"
            ))),
        }
    }
}

/// Physical warehouse location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub code: String,
    pub floor: i32,
    pub purpose: LocationPurpose,
}
