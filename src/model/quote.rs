use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{default_timestamp, Record, ValidationError};
use crate::topics::EventKind;

/// OHLC market quote for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quote {
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub bid: f64,
    pub ask: f64,
    pub change: f64,
    pub change_pct: f64,
}

impl Record for Quote {
    const KIND: EventKind = EventKind::Quote;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.is_empty() {
            return Err(ValidationError::Missing("symbol"));
        }
        Ok(())
    }

    fn enrich(&mut self, now: DateTime<Utc>) {
        default_timestamp(&mut self.timestamp, now);
    }
}
