//! Time-windowed aggregation and rating of metered usage.
//!
//! Accumulated usage documents are folded into an organization tree
//! (organization → space → resource → plan → metric) and a consumer tree,
//! keeping per-scale window-lists of aggregated quantities and plan-level
//! cost.

pub mod aggregator;
pub mod config;
pub mod document;
pub mod error;
pub mod logging;
pub mod partition;
pub mod plan;
pub mod seqid;
pub mod time_window;
pub mod tree;

pub use aggregator::{AggregatedUsage, Aggregator, PriorUsage};
pub use document::{AccumulatedUsage, UsageDocument, UsageSlice};
pub use error::{AggregatorError, Result};
pub use partition::{AggregateRecord, PartitionReducer};
pub use plan::{PlanCatalog, StaticPlanCatalog};
pub use tree::{ConsumerAggregate, Metric, OrgAggregate, Quantity};
