use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{default_timestamp, Record, ValidationError};
use crate::topics::EventKind;

/// A financial KPI reading, optionally measured against a budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialMetric {
    pub timestamp: Option<DateTime<Utc>>,
    pub metric_type: String,
    pub department: String,
    pub category: String,
    pub amount: f64,
    pub budget: f64,
    pub variance: f64,
    pub variance_pct: f64,
    pub period: String,
}

impl Record for FinancialMetric {
    const KIND: EventKind = EventKind::FinancialMetric;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.metric_type.is_empty() {
            return Err(ValidationError::Missing("metric_type"));
        }
        if self.amount == 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "amount",
                rule: "non-zero",
            });
        }
        Ok(())
    }

    /// Variance is only meaningful against a positive budget; otherwise the
    /// incoming values are left untouched.
    fn enrich(&mut self, now: DateTime<Utc>) {
        default_timestamp(&mut self.timestamp, now);
        if self.budget > 0.0 {
            self.variance = self.amount - self.budget;
            self.variance_pct = self.variance / self.budget * 100.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(amount: f64, budget: f64) -> FinancialMetric {
        FinancialMetric {
            metric_type: "revenue".to_string(),
            department: "Sales".to_string(),
            amount,
            budget,
            ..Default::default()
        }
    }

    #[test]
    fn test_variance_pct_exact() {
        for (amount, budget) in [(120.0, 100.0), (87.3, 91.7), (-15.0, 40.0), (1e6, 3.0)] {
            let mut m = metric(amount, budget);
            m.enrich(Utc::now());
            assert_eq!(m.variance, amount - budget);
            assert_eq!(m.variance_pct, (amount - budget) / budget * 100.0);
        }
    }

    #[test]
    fn test_no_budget_leaves_variance() {
        let mut m = metric(50.0, 0.0);
        m.variance = 7.0;
        m.enrich(Utc::now());
        assert_eq!(m.variance, 7.0);
        assert_eq!(m.variance_pct, 0.0);
    }

    #[test]
    fn test_enrich_is_idempotent() {
        let mut m = metric(130.0, 100.0);
        m.enrich(Utc::now());
        let first = m.clone();
        m.enrich(Utc::now());
        assert_eq!(m, first);
    }

    #[test]
    fn test_validation() {
        assert!(metric(10.0, 0.0).validate().is_ok());
        assert!(metric(0.0, 10.0).validate().is_err());

        let mut m = metric(10.0, 0.0);
        m.metric_type.clear();
        assert_eq!(m.validate(), Err(ValidationError::Missing("metric_type")));
    }
}
