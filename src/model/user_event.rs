use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{default_timestamp, Record, ValidationError};
use crate::topics::EventKind;

/// Tracked user behaviour (page view, click, purchase, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: String,
    pub user_id: String,
    pub session_id: String,
    pub page: String,
    pub device: String,
    pub browser: String,
    pub country: String,
    pub city: String,
    pub referrer: String,
    /// Free-form JSON document, stored as text.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

impl Record for UserEvent {
    const KIND: EventKind = EventKind::UserEvent;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.event_type.is_empty() {
            return Err(ValidationError::Missing("event_type"));
        }
        Ok(())
    }

    fn enrich(&mut self, now: DateTime<Utc>) {
        default_timestamp(&mut self.timestamp, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_required() {
        let event = UserEvent {
            user_id: "u-1".to_string(),
            ..Default::default()
        };
        assert_eq!(event.validate(), Err(ValidationError::Missing("event_type")));
    }

    #[test]
    fn test_metadata_omitted_when_empty() {
        let event = UserEvent {
            event_type: "page_view".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("metadata").is_none());
    }
}
