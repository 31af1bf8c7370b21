use serde::{Deserialize, Serialize};

use crate::{
    error::{AggregatorError, Result},
    tree::{Plan, UNKNOWN_CONSUMER},
};

/// Accumulated usage for one organization, resource and plan, as produced by
/// the upstream accumulator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub metering_plan_id: String,
    #[serde(default)]
    pub rating_plan_id: String,
    #[serde(default)]
    pub pricing_plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,
    #[serde(default)]
    pub prices: Prices,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_usage: Option<Vec<AccumulatedUsage>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Prices {
    #[serde(default)]
    pub metrics: Vec<MetricPrice>,
}

impl Prices {
    pub fn price(&self, metric: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|entry| entry.name == metric)
            .map(|entry| entry.price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPrice {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedUsage {
    pub metric: String,
    pub windows: [Vec<Option<UsageSlice>>; 5],
}

/// Accumulated quantity of one bucket, with the value it had before the
/// latest accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSlice {
    pub current: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<f64>,
}

impl UsageSlice {
    pub fn new(current: f64, previous: Option<f64>) -> Self {
        Self { current, previous }
    }
}

/// Fields of a document that passed validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedUsage<'a> {
    pub processed: i64,
    pub doc_end: i64,
    pub accumulated: &'a [AccumulatedUsage],
}

impl UsageDocument {
    /// Rejects documents missing the fields aggregation depends on.
    pub fn validate(&self) -> Result<ValidatedUsage<'_>> {
        let missing = |field| AggregatorError::MalformedUsageDocument {
            document_id: self.id.clone(),
            field,
        };

        if self.organization_id.trim().is_empty() {
            return Err(missing("organization_id"));
        }
        if self.resource_id.trim().is_empty() {
            return Err(missing("resource_id"));
        }
        let processed = self.processed.ok_or_else(|| missing("processed"))?;
        let accumulated = self
            .accumulated_usage
            .as_deref()
            .filter(|usage| !usage.is_empty())
            .ok_or_else(|| missing("accumulated_usage"))?;

        Ok(ValidatedUsage {
            processed,
            doc_end: self.end.unwrap_or(processed),
            accumulated,
        })
    }

    pub fn consumer(&self) -> &str {
        self.consumer_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_CONSUMER)
    }

    pub fn composite_plan_id(&self) -> String {
        Plan::composite_id(
            &self.plan_id,
            &self.metering_plan_id,
            &self.rating_plan_id,
            &self.pricing_plan_id,
        )
    }

    /// Key of the partition this document is folded in.
    pub fn partition_key(&self) -> &str {
        &self.organization_id
    }

    /// Key of the consumer aggregate this document updates.
    pub fn consumer_key(&self) -> String {
        [
            self.organization_id.as_str(),
            self.space_id.as_str(),
            self.consumer(),
        ]
        .join("/")
    }

    /// Space consumer entry recorded for this document.
    pub fn consumer_entry(&self, processed: i64) -> String {
        let stamp = self
            .id
            .as_deref()
            .and_then(document_timestamp)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{processed:016}"));
        format!("{}/t/{}", self.consumer(), stamp)
    }
}

/// Time segment of a stored document id such as
/// `k/org-1/t/0001446418800000-0-0-1-0`.
pub fn document_timestamp(id: &str) -> Option<&str> {
    let mut segments = id.split('/');
    while let Some(segment) = segments.next() {
        if segment == "t" {
            return segments.next().filter(|stamp| !stamp.is_empty());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> UsageDocument {
        serde_json::from_value(json!({
            "id": "k/org-1/t/0001700000000000-0-0-1-0",
            "organization_id": "org-1",
            "space_id": "space-1",
            "resource_id": "storage",
            "plan_id": "basic",
            "metering_plan_id": "m1",
            "rating_plan_id": "r1",
            "pricing_plan_id": "p1",
            "processed": 1_700_000_000_000i64,
            "prices": { "metrics": [{ "name": "STORAGE", "price": 2.0 }] },
            "accumulated_usage": [{
                "metric": "STORAGE",
                "windows": [[{ "current": 1, "previous": 0 }], [], [], [], []]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn parses_usage_document() {
        let doc = sample();
        let validated = doc.validate().unwrap();
        assert_eq!(validated.processed, 1_700_000_000_000);
        assert_eq!(validated.doc_end, 1_700_000_000_000);
        assert_eq!(
            validated.accumulated[0].windows[0][0],
            Some(UsageSlice::new(1.0, Some(0.0)))
        );
        assert_eq!(doc.prices.price("STORAGE"), Some(2.0));
        assert_eq!(doc.prices.price("MEMORY"), None);
    }

    #[test]
    fn keys_default_consumer_to_unknown() {
        let doc = sample();
        assert_eq!(doc.partition_key(), "org-1");
        assert_eq!(doc.consumer_key(), "org-1/space-1/UNKNOWN");
        assert_eq!(doc.composite_plan_id(), "basic/m1/r1/p1");
        assert_eq!(
            doc.consumer_entry(0),
            "UNKNOWN/t/0001700000000000-0-0-1-0"
        );
    }

    #[test]
    fn consumer_entry_falls_back_to_processed() {
        let mut doc = sample();
        doc.id = None;
        doc.consumer_id = Some("app-1".into());
        assert_eq!(doc.consumer_entry(1_000), "app-1/t/0000000000001000");
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut doc = sample();
        doc.processed = None;
        let err = doc.validate().unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::MalformedUsageDocument { field: "processed", .. }
        ));

        let mut doc = sample();
        doc.accumulated_usage = None;
        assert!(doc.validate().is_err());
        doc.accumulated_usage = Some(Vec::new());
        assert!(doc.validate().is_err());

        let mut doc = sample();
        doc.organization_id.clear();
        assert!(matches!(
            doc.validate().unwrap_err(),
            AggregatorError::MalformedUsageDocument {
                field: "organization_id",
                ..
            }
        ));
    }

    #[test]
    fn document_timestamp_reads_time_segment() {
        assert_eq!(document_timestamp("k/org/t/123-0"), Some("123-0"));
        assert_eq!(document_timestamp("t/456"), Some("456"));
        assert_eq!(document_timestamp("k/org"), None);
        assert_eq!(document_timestamp("k/org/t/"), None);
    }
}
