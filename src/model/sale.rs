use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{default_timestamp, Record, ValidationError};
use crate::topics::EventKind;

/// One sales transaction line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sale {
    pub timestamp: Option<DateTime<Utc>>,
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub customer_id: String,
    pub region: String,
    pub quantity: i64,
    pub unit_price: f64,
    /// Discount in percent (10.0 means 10% off).
    pub discount: f64,
    pub revenue: f64,
}

impl Sale {
    /// Revenue implied by quantity, unit price and discount.
    pub fn computed_revenue(&self) -> f64 {
        self.quantity as f64 * self.unit_price * (1.0 - self.discount / 100.0)
    }
}

impl Record for Sale {
    const KIND: EventKind = EventKind::Sale;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.product_id.is_empty() {
            return Err(ValidationError::Missing("product_id"));
        }
        if self.product_name.is_empty() {
            return Err(ValidationError::Missing("product_name"));
        }
        if self.quantity <= 0 {
            return Err(ValidationError::OutOfRange {
                field: "quantity",
                rule: "greater than zero",
            });
        }
        if self.unit_price <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "unit_price",
                rule: "greater than zero",
            });
        }
        Ok(())
    }

    /// A zero revenue is treated as "not provided" and derived.
    fn enrich(&mut self, now: DateTime<Utc>) {
        default_timestamp(&mut self.timestamp, now);
        if self.revenue == 0.0 {
            self.revenue = self.computed_revenue();
        }
    }
}
