//! Folds accumulated usage documents into organization and consumer
//! aggregates.
//!
//! [`Aggregator::aggregate`] derives the next version of both trees from the
//! previous ones and a single document. [`Aggregator::fold_batch`] chains it
//! over an ordered batch for one partition.
//!
//! Neither entry point locks anything. Callers must deliver a partition's
//! documents in a single total order with at most one fold in flight per
//! partition; window shifting compares consecutive `processed` times, so
//! interleaved folds produce shifts that cannot be reproduced.
//! [`crate::partition::PartitionReducer`] provides that guarantee in process.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    document::{AccumulatedUsage, UsageDocument, UsageSlice},
    error::{AggregatorError, MetricSource, PlanKind, Result},
    plan::{AggregateFn, PlanCatalog, RateFn},
    time_window::{SCALES, Slack, shift_window, time_window_index},
    tree::{ConsumerAggregate, Metric, OrgAggregate, Quantity},
};

/// Wall clock used for consumer pruning, in Unix milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Output of one aggregation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUsage {
    pub aggregate: OrgAggregate,
    pub consumer: ConsumerAggregate,
}

impl AggregatedUsage {
    pub fn as_prior(&self) -> PriorUsage<'_> {
        PriorUsage {
            aggregate: Some(&self.aggregate),
            consumer: Some(&self.consumer),
        }
    }
}

/// Previously persisted versions a step starts from. Either side may be
/// missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorUsage<'a> {
    pub aggregate: Option<&'a OrgAggregate>,
    pub consumer: Option<&'a ConsumerAggregate>,
}

impl<'a> PriorUsage<'a> {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Functions and price resolved for one metric of a document.
struct MetricRating<'a> {
    usage: &'a AccumulatedUsage,
    aggregate: AggregateFn,
    rate: RateFn,
    price: f64,
}

/// Timing shared by every window update of one step.
#[derive(Clone, Copy)]
struct StepTimes {
    new_end: i64,
    doc_end: i64,
}

pub struct Aggregator<C> {
    catalog: C,
    slack: Option<Slack>,
    system_token: Option<String>,
    clock: Clock,
}

impl<C: PlanCatalog> Aggregator<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            slack: None,
            system_token: None,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        }
    }

    pub fn with_slack(mut self, slack: Option<Slack>) -> Self {
        self.slack = slack;
        self
    }

    pub fn with_system_token(mut self, token: Option<String>) -> Self {
        self.system_token = token;
        self
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Produces the next aggregate pair from `prior` and one usage document.
    ///
    /// Works on private copies of the prior trees, so a failure leaves no
    /// trace in either the inputs or the output.
    pub async fn aggregate(
        &self,
        prior: PriorUsage<'_>,
        doc: &UsageDocument,
    ) -> Result<AggregatedUsage> {
        let validated = doc.validate()?;
        let times = StepTimes {
            new_end: validated.processed,
            doc_end: validated.doc_end,
        };
        debug!(
            organization_id = %doc.organization_id,
            resource_id = %doc.resource_id,
            processed = times.new_end,
            prior_processed = prior.aggregate.and_then(|a| a.processed),
            "aggregating usage"
        );

        let mut aggregate = match prior.aggregate {
            Some(previous) => previous.rebase(doc.account_id.clone(), doc.end),
            None => {
                let mut fresh = OrgAggregate::new(doc.organization_id.clone());
                fresh.start = doc.start;
                fresh.end = doc.end;
                fresh.account_id = doc.account_id.clone();
                fresh
            }
        };
        let mut consumer = match prior.consumer {
            Some(previous) if previous.consumer_id == doc.consumer() => previous.clone(),
            _ => ConsumerAggregate::new(doc.consumer()),
        };
        let org_prior = prior.aggregate.and_then(|a| a.processed);
        let consumer_prior = prior
            .consumer
            .filter(|c| c.consumer_id == doc.consumer())
            .and_then(|c| c.processed);

        let ratings = self.resolve_ratings(doc, validated.accumulated).await?;

        let plan_id = doc.composite_plan_id();
        let consumer_entry = doc.consumer_entry(times.new_end);
        let now = (self.clock)();

        for rating in &ratings {
            let name = rating.usage.metric.as_str();

            let resource = aggregate.resource_mut(&doc.resource_id);
            apply_window(resource.metric_mut(name), rating, false, org_prior, times);
            apply_window(
                resource.plan_mut(&plan_id).metric_mut(name),
                rating,
                true,
                org_prior,
                times,
            );

            let space = aggregate.space_mut(&doc.space_id);
            let space_resource = space.resource_mut(&doc.resource_id);
            apply_window(space_resource.metric_mut(name), rating, false, org_prior, times);
            apply_window(
                space_resource.plan_mut(&plan_id).metric_mut(name),
                rating,
                true,
                org_prior,
                times,
            );
            space.record_consumer(&consumer_entry, now, self.slack.as_ref());

            let consumer_resource = consumer.resource_mut(&doc.resource_id);
            apply_window(
                consumer_resource.metric_mut(name),
                rating,
                false,
                consumer_prior,
                times,
            );
            apply_window(
                consumer_resource.plan_mut(&plan_id).metric_mut(name),
                rating,
                true,
                consumer_prior,
                times,
            );
        }

        aggregate.processed = Some(times.new_end);
        consumer.processed = Some(times.new_end);
        Ok(AggregatedUsage {
            aggregate,
            consumer,
        })
    }

    /// Folds `docs` in order starting from `seed`, returning one output per
    /// document. Stops at the first failure, reporting its index; no outputs
    /// are returned in that case.
    pub async fn fold_batch(
        &self,
        seed: PriorUsage<'_>,
        docs: &[UsageDocument],
    ) -> Result<Vec<AggregatedUsage>> {
        let mut outputs: Vec<AggregatedUsage> = Vec::with_capacity(docs.len());
        for (index, doc) in docs.iter().enumerate() {
            let prior = outputs.last().map_or(seed, AggregatedUsage::as_prior);
            let next = self
                .aggregate(prior, doc)
                .await
                .map_err(|err| err.at_index(index))?;
            outputs.push(next);
        }
        Ok(outputs)
    }

    async fn resolve_ratings<'d>(
        &self,
        doc: &UsageDocument,
        accumulated: &'d [AccumulatedUsage],
    ) -> Result<Vec<MetricRating<'d>>> {
        let token = self.system_token.as_deref();
        let lookup_failed = |kind, plan_id: &str, reason: String| AggregatorError::ConfigLookup {
            kind,
            plan_id: plan_id.to_string(),
            organization_id: doc.organization_id.clone(),
            resource_id: doc.resource_id.clone(),
            reason,
        };

        let metering = self
            .catalog
            .metering_plan(&doc.metering_plan_id, token)
            .await
            .map_err(|err| lookup_failed(PlanKind::Metering, &doc.metering_plan_id, err.to_string()))?;
        let rating = self
            .catalog
            .rating_plan(&doc.rating_plan_id, token)
            .await
            .map_err(|err| lookup_failed(PlanKind::Rating, &doc.rating_plan_id, err.to_string()))?;

        let not_configured = |lookup, config_id: &str, metric: &str| {
            AggregatorError::MetricNotConfigured {
                lookup,
                config_id: config_id.to_string(),
                metric: metric.to_string(),
                organization_id: doc.organization_id.clone(),
                resource_id: doc.resource_id.clone(),
            }
        };

        let mut ratings = Vec::with_capacity(accumulated.len());
        for usage in accumulated {
            let name = usage.metric.as_str();
            let aggregate = metering.aggregate_fn(name).cloned().ok_or_else(|| {
                not_configured(MetricSource::MeteringPlan, &doc.metering_plan_id, name)
            })?;
            let rate = rating.rate_fn(name).cloned().ok_or_else(|| {
                not_configured(MetricSource::RatingPlan, &doc.rating_plan_id, name)
            })?;
            let price = doc.prices.price(name).ok_or_else(|| {
                not_configured(MetricSource::PriceTable, &doc.pricing_plan_id, name)
            })?;
            ratings.push(MetricRating {
                usage,
                aggregate,
                rate,
                price,
            });
        }
        Ok(ratings)
    }
}

/// Updates every window-list of `metric` from the incoming usage.
///
/// Each list grows to the incoming length, ages by the buckets elapsed since
/// `prior_processed`, and then only the slot picked by
/// [`time_window_index`] may take a new quantity. Plan-level metrics pass
/// `include_cost`, which re-prices every stored quantity of the list at the
/// document's price.
fn apply_window(
    metric: &mut Metric,
    rating: &MetricRating<'_>,
    include_cost: bool,
    prior_processed: Option<i64>,
    times: StepTimes,
) {
    for scale in SCALES {
        let slot = scale.slot();
        let incoming = &rating.usage.windows[slot];
        let window = &mut metric.windows[slot];

        if window.len() < incoming.len() {
            window.resize(incoming.len(), None);
        }

        if let Some(old_end) = prior_processed {
            if times.new_end > old_end {
                shift_window(old_end, times.new_end, window, scale);
            }
        }

        let index = time_window_index(window.as_slice(), times.new_end, times.doc_end, scale);
        match incoming.get(index).copied().flatten() {
            Some(slice) => window[index] = Some(aggregate_slice(window[index], slice, rating)),
            None => {
                if incoming.iter().enumerate().any(|(i, s)| i != index && s.is_some()) {
                    trace!(
                        metric = %metric.metric,
                        scale = %scale,
                        index,
                        "incoming usage outside the current window slot left unapplied"
                    );
                }
            }
        }

        if include_cost {
            for quantity in window.iter_mut().flatten() {
                quantity.cost = Some(cost_of(quantity.quantity, rating));
            }
        }
    }
}

fn aggregate_slice(existing: Option<Quantity>, slice: UsageSlice, rating: &MetricRating<'_>) -> Quantity {
    let aggregated = existing.map_or(0.0, |q| q.quantity);
    Quantity::new((rating.aggregate)(
        aggregated,
        slice.previous.unwrap_or(0.0),
        slice.current,
    ))
}

fn cost_of(quantity: f64, rating: &MetricRating<'_>) -> f64 {
    if quantity != 0.0 && !quantity.is_nan() {
        (rating.rate)(rating.price, quantity)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::plan::{MeteringPlan, RatingPlan, StaticPlanCatalog};

    const DAY: i64 = 86_400_000;

    fn catalog() -> StaticPlanCatalog {
        StaticPlanCatalog::new()
            .with_metering_plan(MeteringPlan::new("m1").with_metric("STORAGE", |a, p, c| a - p + c))
            .with_rating_plan(RatingPlan::new("r1").with_metric("STORAGE", |price, q| price * q))
    }

    fn aggregator() -> Aggregator<StaticPlanCatalog> {
        Aggregator::new(catalog()).with_clock(|| 0)
    }

    fn usage(processed: i64, windows: serde_json::Value) -> UsageDocument {
        serde_json::from_value(json!({
            "organization_id": "org1",
            "space_id": "sp1",
            "resource_id": "storage",
            "plan_id": "basic",
            "metering_plan_id": "m1",
            "rating_plan_id": "r1",
            "pricing_plan_id": "p1",
            "processed": processed,
            "prices": { "metrics": [{ "name": "STORAGE", "price": 2 }] },
            "accumulated_usage": [{ "metric": "STORAGE", "windows": windows }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn first_document_seeds_all_paths() {
        let doc = usage(1000, json!([[{ "current": 1, "previous": 0 }], [], [], [], []]));
        let out = aggregator().aggregate(PriorUsage::empty(), &doc).await.unwrap();

        let resource = out.aggregate.resource("storage").unwrap();
        let metric = resource.metric("STORAGE").unwrap();
        assert_eq!(metric.windows[0][0], Some(Quantity::new(1.0)));

        let plan_metric = resource.plan("basic/m1/r1/p1").unwrap().metric("STORAGE").unwrap();
        assert_eq!(plan_metric.windows[0][0], Some(Quantity::rated(1.0, 2.0)));

        let space = out.aggregate.space("sp1").unwrap();
        let space_metric = space.resource("storage").unwrap().metric("STORAGE").unwrap();
        assert_eq!(space_metric.windows[0][0], Some(Quantity::new(1.0)));
        assert_eq!(space.consumers, vec!["UNKNOWN/t/0000000000001000".to_string()]);

        assert_eq!(out.consumer.consumer_id, "UNKNOWN");
        let consumer_plan = out
            .consumer
            .resource("storage")
            .unwrap()
            .plan("basic/m1/r1/p1")
            .unwrap()
            .metric("STORAGE")
            .unwrap();
        assert_eq!(consumer_plan.windows[0][0], Some(Quantity::rated(1.0, 2.0)));
        assert_eq!(out.aggregate.processed, Some(1000));
    }

    #[tokio::test]
    async fn cost_is_zero_for_zero_quantity() {
        let doc = usage(1000, json!([[{ "current": 0 }], [], [], [], []]));
        let out = aggregator().aggregate(PriorUsage::empty(), &doc).await.unwrap();
        let plan_metric = out.aggregate.resources[0].plans[0].metric("STORAGE").unwrap();
        assert_eq!(plan_metric.windows[0][0], Some(Quantity::rated(0.0, 0.0)));
    }

    #[tokio::test]
    async fn windows_grow_to_incoming_length() {
        let doc = usage(
            1000,
            json!([[null, null, null], [null, null], [], [], [{ "current": 4 }]]),
        );
        let out = aggregator().aggregate(PriorUsage::empty(), &doc).await.unwrap();
        let metric = out.aggregate.resources[0].metric("STORAGE").unwrap();
        assert_eq!(metric.windows[0].len(), 3);
        assert_eq!(metric.windows[1].len(), 2);
        assert_eq!(metric.windows[2].len(), 1);
        assert_eq!(metric.windows[4], vec![Some(Quantity::new(4.0))]);
    }

    #[tokio::test]
    async fn month_window_shifts_before_write() {
        let agg = aggregator();
        let jan = 1_704_067_200_000; // 2024-01-01T00:00:00Z
        let first = usage(jan, json!([[], [], [], [], [{ "current": 5 }, null]]));
        let out = agg.aggregate(PriorUsage::empty(), &first).await.unwrap();

        let feb = jan + 31 * DAY;
        let second = usage(feb, json!([[], [], [], [], [{ "current": 3 }, null]]));
        let out = agg.aggregate(out.as_prior(), &second).await.unwrap();

        let metric = out.aggregate.resources[0].metric("STORAGE").unwrap();
        assert_eq!(
            metric.windows[4],
            vec![Some(Quantity::new(3.0)), Some(Quantity::new(5.0))]
        );
    }

    #[tokio::test]
    async fn carried_plan_quantities_are_repriced() {
        let revived = OrgAggregate::from_json(
            r#"{
                "organization_id": "org1",
                "processed": 1000,
                "resources": [{
                    "resource_id": "storage",
                    "plans": [{
                        "plan_id": "basic/m1/r1/p1",
                        "aggregated_usage": [{
                            "metric": "STORAGE",
                            "windows": [[null, {"quantity": 4}], [null], [null], [null], [null]]
                        }]
                    }],
                    "aggregated_usage": [{
                        "metric": "STORAGE",
                        "windows": [[null, {"quantity": 4}], [null], [null], [null], [null]]
                    }]
                }],
                "spaces": []
            }"#,
        )
        .unwrap();
        let prior = PriorUsage {
            aggregate: Some(&revived),
            consumer: None,
        };

        let agg = aggregator();
        let first = usage(1000, json!([[{ "current": 1 }, null], [], [], [], []]));
        let out = agg.aggregate(prior, &first).await.unwrap();
        let plan = out.aggregate.resources[0].plans[0].metric("STORAGE").unwrap();
        assert_eq!(
            plan.windows[0],
            vec![Some(Quantity::rated(1.0, 2.0)), Some(Quantity::rated(4.0, 8.0))]
        );
        let resource = out.aggregate.resources[0].metric("STORAGE").unwrap();
        assert_eq!(resource.windows[0][1], Some(Quantity::new(4.0)));

        let mut repriced = usage(1500, json!([[{ "current": 2, "previous": 1 }, null], [], [], [], []]));
        repriced.prices.metrics[0].price = 3.0;
        let out = agg.aggregate(out.as_prior(), &repriced).await.unwrap();
        let plan = out.aggregate.resources[0].plans[0].metric("STORAGE").unwrap();
        assert_eq!(
            plan.windows[0],
            vec![Some(Quantity::rated(2.0, 6.0)), Some(Quantity::rated(4.0, 12.0))]
        );
    }

    #[tokio::test]
    async fn unknown_metric_is_rejected() {
        let mut doc = usage(1000, json!([[{ "current": 1 }], [], [], [], []]));
        doc.prices.metrics.clear();
        let err = aggregator()
            .aggregate(PriorUsage::empty(), &doc)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::MetricNotConfigured {
                lookup: MetricSource::PriceTable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected() {
        let mut doc = usage(1000, json!([[{ "current": 1 }], [], [], [], []]));
        doc.rating_plan_id = "r9".into();
        let err = aggregator()
            .aggregate(PriorUsage::empty(), &doc)
            .await
            .unwrap_err();
        match err {
            AggregatorError::ConfigLookup { kind, plan_id, .. } => {
                assert_eq!(kind, PlanKind::Rating);
                assert_eq!(plan_id, "r9");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn fold_reports_failing_index() {
        let good = usage(1000, json!([[{ "current": 1 }], [], [], [], []]));
        let mut bad = good.clone();
        bad.resource_id.clear();
        let err = aggregator()
            .fold_batch(PriorUsage::empty(), &[good.clone(), bad, good])
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Fold { index: 1, .. }));
        assert!(matches!(
            err.root(),
            AggregatorError::MalformedUsageDocument { field: "resource_id", .. }
        ));
    }

    #[tokio::test]
    async fn consumer_aggregate_restarts_for_other_consumer() {
        let agg = aggregator();
        let mut first = usage(1000, json!([[{ "current": 1 }], [], [], [], []]));
        first.consumer_id = Some("app-1".into());
        let out = agg.aggregate(PriorUsage::empty(), &first).await.unwrap();

        let mut second = usage(2000, json!([[{ "current": 1 }], [], [], [], []]));
        second.consumer_id = Some("app-2".into());
        let out = agg.aggregate(out.as_prior(), &second).await.unwrap();
        assert_eq!(out.consumer.consumer_id, "app-2");
        assert_eq!(out.consumer.processed, Some(2000));
        assert_eq!(
            out.consumer.resources[0].metric("STORAGE").unwrap().windows[0][0],
            Some(Quantity::new(1.0))
        );
        let org_metric = out.aggregate.resources[0].metric("STORAGE").unwrap();
        assert_eq!(org_metric.windows[0].len(), 1);
    }
}
