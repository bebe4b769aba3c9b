//! Weight reading data model.
//!
//! One decoded scale measurement. Readings are created once by the device
//! poll loop and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    /// Random v4 identifier; doubles as the `since_uuid` cursor.
    #[serde(rename = "uuid")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub weight: f64,
}

impl Reading {
    pub fn new(weight: f64) -> Self {
        Self::at(weight, Utc::now())
    }

    pub fn at(weight: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            weight,
        }
    }
}
