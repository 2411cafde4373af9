//! Event kinds and the queue/channel name table.
//!
//! Every event kind owns one logical topic name. The same name is used for
//! the broker work queue and for the live pub/sub channel, so publisher,
//! worker and bridge all resolve names through one shared [`TopicTable`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of ingested event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Quote,
    Sale,
    UserEvent,
    FinancialMetric,
}

impl EventKind {
    /// All kinds, in a stable order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Quote,
        EventKind::Sale,
        EventKind::UserEvent,
        EventKind::FinancialMetric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Quote => "quote",
            EventKind::Sale => "sale",
            EventKind::UserEvent => "user_event",
            EventKind::FinancialMetric => "financial_metric",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default topic for stock quotes.
pub const DEFAULT_QUOTE_TOPIC: &str = "stock_quotes";
/// Default topic for sales.
pub const DEFAULT_SALE_TOPIC: &str = "sales";
/// Default topic for user behaviour events.
pub const DEFAULT_USER_EVENT_TOPIC: &str = "user_events";
/// Default topic for financial metrics.
pub const DEFAULT_FINANCIAL_METRIC_TOPIC: &str = "financial_metrics";

/// Name of the queue and live channel for each event kind.
///
/// Built once from configuration and passed by value (it is cheap to clone)
/// to every component that needs a name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicTable {
    pub quote: String,
    pub sale: String,
    pub user_event: String,
    pub financial_metric: String,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self {
            quote: DEFAULT_QUOTE_TOPIC.to_string(),
            sale: DEFAULT_SALE_TOPIC.to_string(),
            user_event: DEFAULT_USER_EVENT_TOPIC.to_string(),
            financial_metric: DEFAULT_FINANCIAL_METRIC_TOPIC.to_string(),
        }
    }
}

impl TopicTable {
    /// Topic name for a kind.
    pub fn name(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Quote => &self.quote,
            EventKind::Sale => &self.sale,
            EventKind::UserEvent => &self.user_event,
            EventKind::FinancialMetric => &self.financial_metric,
        }
    }

    /// All topic names in [`EventKind::ALL`] order.
    pub fn names(&self) -> Vec<String> {
        EventKind::ALL
            .iter()
            .map(|kind| self.name(*kind).to_string())
            .collect()
    }

    /// True when two kinds share a name (an invalid table).
    pub fn has_duplicates(&self) -> bool {
        let names = self.names();
        names
            .iter()
            .enumerate()
            .any(|(i, name)| names[i + 1..].contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let topics = TopicTable::default();
        assert_eq!(topics.name(EventKind::Quote), "stock_quotes");
        assert_eq!(topics.name(EventKind::Sale), "sales");
        assert_eq!(topics.name(EventKind::UserEvent), "user_events");
        assert_eq!(topics.name(EventKind::FinancialMetric), "financial_metrics");
    }

    #[test]
    fn test_names_follow_kind_order() {
        let topics = TopicTable {
            sale: "retail_sales".to_string(),
            ..Default::default()
        };
        assert_eq!(
            topics.names(),
            vec!["stock_quotes", "retail_sales", "user_events", "financial_metrics"]
        );
    }

    #[test]
    fn test_duplicate_detection() {
        let mut topics = TopicTable::default();
        assert!(!topics.has_duplicates());

        topics.sale = topics.quote.clone();
        assert!(topics.has_duplicates());
    }
}
