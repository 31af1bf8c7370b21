//! Aggregated usage tree: organization, spaces, consumers, resources, plans
//! and metrics.
//!
//! Nodes are plain serde values. Child lists are keyed by an id field and
//! grown through [`find_or_create`], so a tree revived from JSON navigates
//! exactly like one built in memory.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::Result,
    time_window::{Slack, retention_deadline},
};

/// Consumer id used when a usage document carries none.
pub const UNKNOWN_CONSUMER: &str = "UNKNOWN";

/// One window-list per scale, index 0 holding the most recent bucket.
pub type Windows = [Vec<Option<Quantity>>; 5];

/// Node addressable by a string key inside its parent's child list.
pub trait Keyed {
    fn key(&self) -> &str;
    fn with_key(key: &str) -> Self;
}

/// Returns the node keyed `key`, appending a new one when none exists.
pub fn find_or_create<'a, T: Keyed>(list: &'a mut Vec<T>, key: &str) -> &'a mut T {
    let index = match list.iter().position(|node| node.key() == key) {
        Some(index) => index,
        None => {
            list.push(T::with_key(key));
            list.len() - 1
        }
    };
    &mut list[index]
}

pub fn find<'a, T: Keyed>(list: &'a [T], key: &str) -> Option<&'a T> {
    list.iter().find(|node| node.key() == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Quantity {
    pub fn new(quantity: f64) -> Self {
        Self {
            quantity,
            cost: None,
        }
    }

    pub fn rated(quantity: f64, cost: f64) -> Self {
        Self {
            quantity,
            cost: Some(cost),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric: String,
    pub windows: Windows,
}

impl Metric {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            windows: [
                vec![None],
                vec![None],
                vec![None],
                vec![None],
                vec![None],
            ],
        }
    }
}

impl Keyed for Metric {
    fn key(&self) -> &str {
        &self.metric
    }

    fn with_key(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Composite `plan/metering/rating/pricing` id.
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_plan_id: Option<String>,
    #[serde(default, alias = "aggregated_usage")]
    pub metrics: Vec<Metric>,
}

impl Plan {
    pub fn new(plan_id: impl Into<String>) -> Self {
        let plan_id = plan_id.into();
        let mut parts = plan_id.split('/').skip(1).map(str::to_string);
        let metering_plan_id = parts.next();
        let rating_plan_id = parts.next();
        let pricing_plan_id = parts.next();
        Self {
            plan_id,
            metering_plan_id,
            rating_plan_id,
            pricing_plan_id,
            metrics: Vec::new(),
        }
    }

    /// Builds the composite id stored on plan nodes.
    pub fn composite_id(
        plan_id: &str,
        metering_plan_id: &str,
        rating_plan_id: &str,
        pricing_plan_id: &str,
    ) -> String {
        [plan_id, metering_plan_id, rating_plan_id, pricing_plan_id].join("/")
    }

    pub fn metric_mut(&mut self, metric: &str) -> &mut Metric {
        find_or_create(&mut self.metrics, metric)
    }

    pub fn metric(&self, metric: &str) -> Option<&Metric> {
        find(&self.metrics, metric)
    }
}

impl Keyed for Plan {
    fn key(&self) -> &str {
        &self.plan_id
    }

    fn with_key(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default, alias = "aggregated_usage")]
    pub metrics: Vec<Metric>,
}

impl Resource {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            plans: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn plan_mut(&mut self, plan_id: &str) -> &mut Plan {
        find_or_create(&mut self.plans, plan_id)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        find(&self.plans, plan_id)
    }

    pub fn metric_mut(&mut self, metric: &str) -> &mut Metric {
        find_or_create(&mut self.metrics, metric)
    }

    pub fn metric(&self, metric: &str) -> Option<&Metric> {
        find(&self.metrics, metric)
    }
}

impl Keyed for Resource {
    fn key(&self) -> &str {
        &self.resource_id
    }

    fn with_key(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    pub space_id: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Entries of the form `consumerId/t/<dbTimestamp>`.
    #[serde(default)]
    pub consumers: Vec<String>,
}

impl Space {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            resources: Vec::new(),
            consumers: Vec::new(),
        }
    }

    pub fn resource_mut(&mut self, resource_id: &str) -> &mut Resource {
        find_or_create(&mut self.resources, resource_id)
    }

    pub fn resource(&self, resource_id: &str) -> Option<&Resource> {
        find(&self.resources, resource_id)
    }

    /// Prunes expired consumer entries, then records `entry` unless it is
    /// expired too. An entry for the same base consumer id is replaced in
    /// place.
    pub fn record_consumer(&mut self, entry: &str, now: i64, slack: Option<&Slack>) {
        let before = self.consumers.len();
        self.consumers
            .retain(|existing| consumer_retained(existing, now, slack));
        if self.consumers.len() != before {
            trace!(
                space_id = %self.space_id,
                pruned = before - self.consumers.len(),
                "pruned expired consumers"
            );
        }

        if !consumer_retained(entry, now, slack) {
            return;
        }

        let base = consumer_base(entry);
        match self
            .consumers
            .iter()
            .position(|existing| consumer_base(existing) == base)
        {
            Some(index) => self.consumers[index] = entry.to_string(),
            None => self.consumers.push(entry.to_string()),
        }
    }
}

impl Keyed for Space {
    fn key(&self) -> &str {
        &self.space_id
    }

    fn with_key(key: &str) -> Self {
        Self::new(key)
    }
}

/// Consumer id without its `/t/<timestamp>` suffix.
pub fn consumer_base(entry: &str) -> &str {
    entry.split('/').next().unwrap_or(entry)
}

/// Timestamp embedded in a `consumerId/t/<timestamp>` entry. Trailing
/// non-digit characters (sequence suffixes) are ignored.
pub fn consumer_timestamp(entry: &str) -> Option<i64> {
    let stamp = entry.split('/').nth(2)?;
    let digits: String = stamp.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn consumer_retained(entry: &str, now: i64, slack: Option<&Slack>) -> bool {
    consumer_timestamp(entry)
        .and_then(|stamp| retention_deadline(stamp, slack))
        .is_some_and(|deadline| deadline > now)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgAggregate {
    pub organization_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub spaces: Vec<Space>,
}

impl OrgAggregate {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            account_id: None,
            start: None,
            end: None,
            processed: None,
            resources: Vec::new(),
            spaces: Vec::new(),
        }
    }

    /// Structural copy of a persisted version carrying a new account and end.
    pub fn rebase(&self, account_id: Option<String>, end: Option<i64>) -> Self {
        let mut next = self.clone();
        next.account_id = account_id;
        next.end = end;
        next
    }

    pub fn resource_mut(&mut self, resource_id: &str) -> &mut Resource {
        find_or_create(&mut self.resources, resource_id)
    }

    pub fn resource(&self, resource_id: &str) -> Option<&Resource> {
        find(&self.resources, resource_id)
    }

    pub fn space_mut(&mut self, space_id: &str) -> &mut Space {
        find_or_create(&mut self.spaces, space_id)
    }

    pub fn space(&self, space_id: &str) -> Option<&Space> {
        find(&self.spaces, space_id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerAggregate {
    pub consumer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl ConsumerAggregate {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            processed: None,
            resources: Vec::new(),
        }
    }

    pub fn resource_mut(&mut self, resource_id: &str) -> &mut Resource {
        find_or_create(&mut self.resources, resource_id)
    }

    pub fn resource(&self, resource_id: &str) -> Option<&Resource> {
        find(&self.resources, resource_id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
