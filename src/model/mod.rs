//! Domain events ingested from the work queues.
//!
//! Each event kind is its own record type implementing [`Record`]; the
//! closed set is also available as the [`DomainEvent`] sum type for code
//! that handles any kind (the producer, for instance).
//!
//! Records carry three groups of fields:
//! - required inputs, checked by [`Record::validate`]
//! - a timestamp that defaults to ingestion time
//! - derived fields, filled by [`Record::enrich`]
//!
//! Enrichment is idempotent: running it again on an enriched (or stored)
//! record reproduces the same derived values.

mod financial_metric;
mod quote;
mod sale;
mod user_event;

pub use financial_metric::FinancialMetric;
pub use quote::Quote;
pub use sale::Sale;
pub use user_event::UserEvent;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::topics::EventKind;

/// Business validation failures. Retrying never fixes these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("field '{field}' must be {rule}")]
    OutOfRange {
        field: &'static str,
        rule: &'static str,
    },
}

/// A single ingestible record type.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind this record type belongs to; selects queue and channel names.
    const KIND: EventKind;

    /// Check type-specific required fields.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Default the timestamp and compute derived fields.
    fn enrich(&mut self, now: DateTime<Utc>);

    /// Decode a queue payload.
    fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// `0001-01-01T00:00:00Z` in Unix seconds, the zero time some producers emit.
const ZERO_TIME_SECS: i64 = -62_135_596_800;

/// True when a timestamp should be replaced by the ingestion time.
///
/// Only a missing value, the Unix epoch and the zero time count as unset.
/// Any other instant, including ones before 1970, is kept.
pub fn timestamp_unset(timestamp: &Option<DateTime<Utc>>) -> bool {
    match timestamp {
        None => true,
        Some(ts) => {
            ts.timestamp_subsec_nanos() == 0 && matches!(ts.timestamp(), 0 | ZERO_TIME_SECS)
        }
    }
}

pub(crate) fn default_timestamp(timestamp: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if timestamp_unset(timestamp) {
        *timestamp = Some(now);
    }
}

/// Any one of the ingested record types.
///
/// Serialized without a tag: the wire payload is the bare record, and the
/// kind comes from the queue it travels on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Quote(Quote),
    Sale(Sale),
    UserEvent(UserEvent),
    FinancialMetric(FinancialMetric),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Quote(_) => EventKind::Quote,
            DomainEvent::Sale(_) => EventKind::Sale,
            DomainEvent::UserEvent(_) => EventKind::UserEvent,
            DomainEvent::FinancialMetric(_) => EventKind::FinancialMetric,
        }
    }

    /// Decode a payload as the given kind.
    pub fn decode(kind: EventKind, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::Quote => DomainEvent::Quote(Quote::decode(payload)?),
            EventKind::Sale => DomainEvent::Sale(Sale::decode(payload)?),
            EventKind::UserEvent => DomainEvent::UserEvent(UserEvent::decode(payload)?),
            EventKind::FinancialMetric => {
                DomainEvent::FinancialMetric(FinancialMetric::decode(payload)?)
            }
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DomainEvent::Quote(r) => r.validate(),
            DomainEvent::Sale(r) => r.validate(),
            DomainEvent::UserEvent(r) => r.validate(),
            DomainEvent::FinancialMetric(r) => r.validate(),
        }
    }

    pub fn enrich(&mut self, now: DateTime<Utc>) {
        match self {
            DomainEvent::Quote(r) => r.enrich(now),
            DomainEvent::Sale(r) => r.enrich(now),
            DomainEvent::UserEvent(r) => r.enrich(now),
            DomainEvent::FinancialMetric(r) => r.enrich(now),
        }
    }

    /// JSON queue payload for this event.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl From<Quote> for DomainEvent {
    fn from(value: Quote) -> Self {
        DomainEvent::Quote(value)
    }
}

impl From<Sale> for DomainEvent {
    fn from(value: Sale) -> Self {
        DomainEvent::Sale(value)
    }
}

impl From<UserEvent> for DomainEvent {
    fn from(value: UserEvent) -> Self {
        DomainEvent::UserEvent(value)
    }
}

impl From<FinancialMetric> for DomainEvent {
    fn from(value: FinancialMetric) -> Self {
        DomainEvent::FinancialMetric(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_unset() {
        assert!(timestamp_unset(&None));
        assert!(timestamp_unset(&Some(Utc.timestamp_opt(0, 0).unwrap())));

        let zero_time: DateTime<Utc> = "0001-01-01T00:00:00Z".parse().unwrap();
        assert!(timestamp_unset(&Some(zero_time)));

        let real = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert!(!timestamp_unset(&Some(real)));
    }

    #[test]
    fn test_pre_epoch_timestamp_survives_enrich() {
        let mut quote =
            Quote::decode(br#"{"symbol":"IBM","timestamp":"1969-07-20T20:17:00Z"}"#).unwrap();
        let original = quote.timestamp;
        assert!(!timestamp_unset(&original));

        quote.enrich(Utc::now());
        assert_eq!(quote.timestamp, original);

        let just_after_zero: DateTime<Utc> = "0001-01-01T00:00:01Z".parse().unwrap();
        assert!(!timestamp_unset(&Some(just_after_zero)));
    }

    #[test]
    fn test_decode_selects_variant_by_kind() {
        let payload = br#"{"symbol":"AAPL","close":103.0}"#;
        let event = DomainEvent::decode(EventKind::Quote, payload).unwrap();
        assert_eq!(event.kind(), EventKind::Quote);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let payload = br#"{"quantity":"many"}"#;
        assert!(DomainEvent::decode(EventKind::Sale, payload).is_err());
    }

    #[test]
    fn test_payload_is_bare_record() {
        let event = DomainEvent::from(UserEvent {
            event_type: "click".to_string(),
            ..Default::default()
        });
        let value: serde_json::Value =
            serde_json::from_slice(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["event_type"], "click");
        assert!(value.get("UserEvent").is_none());
    }
}
