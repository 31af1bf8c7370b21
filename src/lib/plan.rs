use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Combines the previously aggregated quantity with an accumulated
/// `(previous, current)` pair.
pub type AggregateFn = Arc<dyn Fn(f64, f64, f64) -> f64 + Send + Sync>;
/// Converts a unit price and an aggregated quantity into a cost.
pub type RateFn = Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("plan not found")]
    NotFound,
    #[error("plan source unavailable: {0}")]
    Unavailable(String),
}

/// Resolves metering and rating plan definitions.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn metering_plan(
        &self,
        plan_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Arc<MeteringPlan>, LookupError>;

    async fn rating_plan(
        &self,
        plan_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Arc<RatingPlan>, LookupError>;
}

#[derive(Clone)]
pub struct MeteringMetric {
    pub name: String,
    pub aggregate: AggregateFn,
}

impl fmt::Debug for MeteringMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteringMetric")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct MeteringPlan {
    pub plan_id: String,
    pub metrics: Vec<MeteringMetric>,
}

impl MeteringPlan {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            metrics: Vec::new(),
        }
    }

    pub fn with_metric<F>(mut self, name: impl Into<String>, aggregate: F) -> Self
    where
        F: Fn(f64, f64, f64) -> f64 + Send + Sync + 'static,
    {
        self.metrics.push(MeteringMetric {
            name: name.into(),
            aggregate: Arc::new(aggregate),
        });
        self
    }

    pub fn aggregate_fn(&self, metric: &str) -> Option<&AggregateFn> {
        self.metrics
            .iter()
            .find(|entry| entry.name == metric)
            .map(|entry| &entry.aggregate)
    }
}

#[derive(Clone)]
pub struct RatingMetric {
    pub name: String,
    pub rate: RateFn,
}

impl fmt::Debug for RatingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatingMetric")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RatingPlan {
    pub plan_id: String,
    pub metrics: Vec<RatingMetric>,
}

impl RatingPlan {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            metrics: Vec::new(),
        }
    }

    pub fn with_metric<F>(mut self, name: impl Into<String>, rate: F) -> Self
    where
        F: Fn(f64, f64) -> f64 + Send + Sync + 'static,
    {
        self.metrics.push(RatingMetric {
            name: name.into(),
            rate: Arc::new(rate),
        });
        self
    }

    pub fn rate_fn(&self, metric: &str) -> Option<&RateFn> {
        self.metrics
            .iter()
            .find(|entry| entry.name == metric)
            .map(|entry| &entry.rate)
    }
}

/// Aggregate functions that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    /// `aggregated - previous + current`
    Sum,
    /// `max(aggregated, current)`
    Max,
    /// `current`
    Latest,
}

impl AggregateKind {
    pub fn function(self) -> AggregateFn {
        match self {
            Self::Sum => Arc::new(|aggregated: f64, previous: f64, current: f64| {
                aggregated - previous + current
            }),
            Self::Max => {
                Arc::new(|aggregated: f64, _previous: f64, current: f64| aggregated.max(current))
            }
            Self::Latest => Arc::new(|_aggregated: f64, _previous: f64, current: f64| current),
        }
    }
}

/// Rate functions that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateKind {
    /// `price * quantity`
    Linear,
    Free,
}

impl RateKind {
    pub fn function(self) -> RateFn {
        match self {
            Self::Linear => Arc::new(|price: f64, quantity: f64| price * quantity),
            Self::Free => Arc::new(|_price: f64, _quantity: f64| 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringPlanConfig {
    pub id: String,
    #[serde(default)]
    pub metrics: Vec<MeteringMetricConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringMetricConfig {
    pub name: String,
    pub aggregate: AggregateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingPlanConfig {
    pub id: String,
    #[serde(default)]
    pub metrics: Vec<RatingMetricConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingMetricConfig {
    pub name: String,
    pub rate: RateKind,
}

impl From<&MeteringPlanConfig> for MeteringPlan {
    fn from(config: &MeteringPlanConfig) -> Self {
        Self {
            plan_id: config.id.clone(),
            metrics: config
                .metrics
                .iter()
                .map(|metric| MeteringMetric {
                    name: metric.name.clone(),
                    aggregate: metric.aggregate.function(),
                })
                .collect(),
        }
    }
}

impl From<&RatingPlanConfig> for RatingPlan {
    fn from(config: &RatingPlanConfig) -> Self {
        Self {
            plan_id: config.id.clone(),
            metrics: config
                .metrics
                .iter()
                .map(|metric| RatingMetric {
                    name: metric.name.clone(),
                    rate: metric.rate.function(),
                })
                .collect(),
        }
    }
}

/// In-memory catalog. Plans are fixed once the catalog is built.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanCatalog {
    metering: HashMap<String, Arc<MeteringPlan>>,
    rating: HashMap<String, Arc<RatingPlan>>,
}

impl StaticPlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(metering: &[MeteringPlanConfig], rating: &[RatingPlanConfig]) -> Self {
        let mut catalog = Self::new();
        for plan in metering {
            catalog = catalog.with_metering_plan(MeteringPlan::from(plan));
        }
        for plan in rating {
            catalog = catalog.with_rating_plan(RatingPlan::from(plan));
        }
        catalog
    }

    pub fn with_metering_plan(mut self, plan: MeteringPlan) -> Self {
        self.metering.insert(plan.plan_id.clone(), Arc::new(plan));
        self
    }

    pub fn with_rating_plan(mut self, plan: RatingPlan) -> Self {
        self.rating.insert(plan.plan_id.clone(), Arc::new(plan));
        self
    }
}

#[async_trait]
impl PlanCatalog for StaticPlanCatalog {
    async fn metering_plan(
        &self,
        plan_id: &str,
        _auth_token: Option<&str>,
    ) -> Result<Arc<MeteringPlan>, LookupError> {
        self.metering
            .get(plan_id)
            .cloned()
            .ok_or(LookupError::NotFound)
    }

    async fn rating_plan(
        &self,
        plan_id: &str,
        _auth_token: Option<&str>,
    ) -> Result<Arc<RatingPlan>, LookupError> {
        self.rating.get(plan_id).cloned().ok_or(LookupError::NotFound)
    }
}
