//! In-process host for the aggregator: serializes folds per organization and
//! keeps every emitted version.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::{
    aggregator::{AggregatedUsage, Aggregator, PriorUsage},
    document::UsageDocument,
    error::{AggregatorError, Result},
    plan::PlanCatalog,
    seqid::{SequenceId, VersionClock},
    tree::{ConsumerAggregate, OrgAggregate},
};

/// One persisted aggregate version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub sequence: SequenceId,
    pub partition_key: String,
    pub consumer_key: String,
    pub usage: AggregatedUsage,
}

#[derive(Debug)]
struct PartitionLog {
    records: Vec<AggregateRecord>,
    consumers: HashMap<String, ConsumerAggregate>,
    versions: VersionClock,
}

impl PartitionLog {
    fn new(worker: u16) -> Self {
        Self {
            records: Vec::new(),
            consumers: HashMap::new(),
            versions: VersionClock::new(worker),
        }
    }

    fn latest(&self) -> Option<&OrgAggregate> {
        self.records.last().map(|record| &record.usage.aggregate)
    }
}

/// Runs batches through an [`Aggregator`] with one writer per partition.
///
/// Different organizations are folded concurrently; batches for the same
/// organization queue on that partition's lock and always start from the
/// version the previous batch committed.
pub struct PartitionReducer<C> {
    aggregator: Aggregator<C>,
    partitions: Mutex<HashMap<String, Arc<AsyncMutex<PartitionLog>>>>,
    worker: u16,
}

impl<C: PlanCatalog> PartitionReducer<C> {
    pub fn new(aggregator: Aggregator<C>, worker: u16) -> Self {
        Self {
            aggregator,
            partitions: Mutex::new(HashMap::new()),
            worker,
        }
    }

    fn partition(&self, organization_id: &str) -> Arc<AsyncMutex<PartitionLog>> {
        let mut partitions = self.partitions.lock();
        partitions
            .entry(organization_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(PartitionLog::new(self.worker))))
            .clone()
    }

    /// Groups `docs` by organization, keeping their relative order, and
    /// reduces each group. Partitions commit independently; the first
    /// failure stops the call.
    pub async fn reduce(&self, docs: Vec<UsageDocument>) -> Result<Vec<AggregateRecord>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<UsageDocument>> = HashMap::new();
        for doc in docs {
            let key = doc.partition_key().to_string();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(doc);
        }

        let mut records = Vec::new();
        for key in order {
            let batch = groups.remove(&key).unwrap_or_default();
            records.extend(self.reduce_partition(&key, &batch).await?);
        }
        Ok(records)
    }

    /// Folds `docs` into the partition of `organization_id` and appends one
    /// record per document. Nothing is committed unless every document
    /// succeeds.
    pub async fn reduce_partition(
        &self,
        organization_id: &str,
        docs: &[UsageDocument],
    ) -> Result<Vec<AggregateRecord>> {
        if let Some(doc) = docs
            .iter()
            .find(|doc| doc.partition_key() != organization_id)
        {
            return Err(AggregatorError::PartitionMismatch {
                expected: organization_id.to_string(),
                found: doc.organization_id.clone(),
            });
        }

        let partition = self.partition(organization_id);
        let mut log = partition.lock().await;

        let mut pending: Vec<(String, AggregatedUsage)> = Vec::with_capacity(docs.len());
        let mut consumers: HashMap<String, ConsumerAggregate> = HashMap::new();
        for (index, doc) in docs.iter().enumerate() {
            let latest = pending
                .last()
                .map(|(_, usage)| &usage.aggregate)
                .or_else(|| log.latest());

            if let (Some(latest), Some(processed)) =
                (latest.and_then(|a| a.processed), doc.processed)
            {
                if processed < latest {
                    warn!(
                        organization_id,
                        index,
                        processed,
                        latest,
                        "rejecting out of order usage"
                    );
                    return Err(AggregatorError::OutOfOrder {
                        organization_id: organization_id.to_string(),
                        processed,
                        latest,
                    }
                    .at_index(index));
                }
            }

            let consumer_key = doc.consumer_key();
            let prior = PriorUsage {
                aggregate: latest,
                consumer: consumers
                    .get(&consumer_key)
                    .or_else(|| log.consumers.get(&consumer_key)),
            };
            let usage = self
                .aggregator
                .aggregate(prior, doc)
                .await
                .map_err(|err| err.at_index(index))?;

            consumers.insert(consumer_key.clone(), usage.consumer.clone());
            pending.push((consumer_key, usage));
        }

        let mut committed = Vec::with_capacity(pending.len());
        for (consumer_key, usage) in pending {
            committed.push(AggregateRecord {
                sequence: log.versions.next_id(),
                partition_key: organization_id.to_string(),
                consumer_key,
                usage,
            });
        }
        log.consumers.extend(consumers);
        log.records.extend(committed.iter().cloned());

        info!(
            organization_id,
            documents = committed.len(),
            versions = log.records.len(),
            "committed aggregated usage"
        );
        Ok(committed)
    }

    pub async fn latest(&self, organization_id: &str) -> Option<AggregateRecord> {
        let partition = self.partition(organization_id);
        let log = partition.lock().await;
        log.records.last().cloned()
    }

    pub async fn history(&self, organization_id: &str) -> Vec<AggregateRecord> {
        let partition = self.partition(organization_id);
        let log = partition.lock().await;
        log.records.clone()
    }

    /// Latest consumer aggregate stored under an
    /// `organization/space/consumer` key.
    pub async fn latest_consumer(&self, consumer_key: &str) -> Option<ConsumerAggregate> {
        let organization_id = consumer_key.split('/').next().unwrap_or(consumer_key);
        let partition = self.partition(organization_id);
        let log = partition.lock().await;
        log.consumers.get(consumer_key).cloned()
    }
}
