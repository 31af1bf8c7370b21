use std::{fmt, io};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Which external plan lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Metering,
    Rating,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metering => f.write_str("metering plan"),
            Self::Rating => f.write_str("rating plan"),
        }
    }
}

/// Where a per-metric lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSource {
    MeteringPlan,
    RatingPlan,
    PriceTable,
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeteringPlan => f.write_str("metering plan"),
            Self::RatingPlan => f.write_str("rating plan"),
            Self::PriceTable => f.write_str("pricing plan"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(
        "{kind} '{plan_id}' could not be resolved for organization {organization_id} resource {resource_id}: {reason}"
    )]
    ConfigLookup {
        kind: PlanKind,
        plan_id: String,
        organization_id: String,
        resource_id: String,
        reason: String,
    },
    #[error(
        "metric '{metric}' is not configured in {lookup} '{config_id}' (organization {organization_id}, resource {resource_id})"
    )]
    MetricNotConfigured {
        lookup: MetricSource,
        config_id: String,
        metric: String,
        organization_id: String,
        resource_id: String,
    },
    #[error("malformed usage document {}: missing {field}", .document_id.as_deref().unwrap_or("<no id>"))]
    MalformedUsageDocument {
        document_id: Option<String>,
        field: &'static str,
    },
    #[error("usage for organization {organization_id} processed at {processed} is older than {latest}")]
    OutOfOrder {
        organization_id: String,
        processed: i64,
        latest: i64,
    },
    #[error("document for organization {found} delivered to partition {expected}")]
    PartitionMismatch { expected: String, found: String },
    #[error("aggregation aborted at document {index}: {source}")]
    Fold {
        index: usize,
        #[source]
        source: Box<AggregatorError>,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AggregatorError {
    pub(crate) fn at_index(self, index: usize) -> Self {
        Self::Fold {
            index,
            source: Box::new(self),
        }
    }

    /// Innermost error, unwrapping fold positions.
    pub fn root(&self) -> &AggregatorError {
        match self {
            Self::Fold { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<toml::de::Error> for AggregatorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for AggregatorError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
