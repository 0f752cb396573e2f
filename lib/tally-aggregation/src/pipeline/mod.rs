//! Aggregate consumers.
//!
//! Completed aggregates leave the aggregation subsystem through a [`MetricAggregateConsumer`]. Two consumers are
//! provided: [`MemoryPipeline`], which keeps the most recent aggregates in memory, and [`ForwardingPipeline`], which
//! converts aggregates into a destination record type and sends them over a channel.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{aggregate::MetricAggregate, config::AggregationConfiguration, error::GenericError};

mod convert;
pub use self::convert::{ConverterRegistry, ForwardingPipeline, MetricAggregateConverter};

mod record;
pub use self::record::{MetricRecord, MetricRecordConverter, AGGREGATION_INTERVAL_PROPERTY, AGGREGATION_KIND_PROPERTY};

/// A consumer of completed aggregates.
#[async_trait]
pub trait MetricAggregateConsumer: Send + Sync {
    /// Consumes an aggregate.
    ///
    /// ## Errors
    ///
    /// If the aggregate cannot be consumed, an error is returned. Errors are logged by the caller, and the remaining
    /// aggregates of the summary are still handed over.
    async fn track(&self, aggregate: MetricAggregate, cancel: &CancellationToken) -> Result<(), GenericError>;

    /// Flushes anything buffered by the consumer.
    ///
    /// Called once after every aggregate of a summary has been handed over.
    ///
    /// ## Errors
    ///
    /// If the consumer fails to flush, an error is returned.
    async fn flush(&self, cancel: &CancellationToken) -> Result<(), GenericError>;
}

/// A bounded, in-memory consumer.
///
/// Keeps the most recent aggregates, evicting the oldest once full. Mostly useful for tests and for inspecting live
/// aggregates.
pub struct MemoryPipeline {
    capacity: usize,
    aggregates: Mutex<VecDeque<MetricAggregate>>,
    evicted: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryPipeline {
    /// Creates a new `MemoryPipeline` holding at most `capacity` aggregates.
    ///
    /// A capacity of zero is treated as a capacity of one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            aggregates: Mutex::new(VecDeque::with_capacity(capacity)),
            evicted: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Creates a new `MemoryPipeline` with the capacity set in the given configuration.
    pub fn from_configuration(config: &AggregationConfiguration) -> Self {
        Self::new(config.memory_pipeline_capacity())
    }

    /// Returns the number of aggregates held.
    pub fn len(&self) -> usize {
        self.aggregates().len()
    }

    /// Returns `true` if no aggregates are held.
    pub fn is_empty(&self) -> bool {
        self.aggregates().is_empty()
    }

    /// Returns a copy of the aggregates held, oldest first.
    pub fn snapshot(&self) -> Vec<MetricAggregate> {
        self.aggregates().iter().cloned().collect()
    }

    /// Removes and returns every aggregate held, oldest first.
    pub fn drain(&self) -> Vec<MetricAggregate> {
        self.aggregates().drain(..).collect()
    }

    /// Returns the number of aggregates evicted to make room for newer ones.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Returns the number of times the pipeline was flushed.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn aggregates(&self) -> std::sync::MutexGuard<'_, VecDeque<MetricAggregate>> {
        self.aggregates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetricAggregateConsumer for MemoryPipeline {
    async fn track(&self, aggregate: MetricAggregate, _cancel: &CancellationToken) -> Result<(), GenericError> {
        let mut aggregates = self.aggregates();
        if aggregates.len() == self.capacity {
            aggregates.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
            trace!("Memory pipeline full. Evicted oldest aggregate.");
        }
        aggregates.push_back(aggregate);
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> Result<(), GenericError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::aggregate::AggregateData;

    fn gauge(last: f64) -> MetricAggregate {
        MetricAggregate::new(
            "test",
            "depth",
            Utc::now(),
            Duration::from_secs(60),
            Default::default(),
            AggregateData::Gauge {
                last,
                min: last,
                max: last,
            },
        )
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let pipeline = MemoryPipeline::new(2);
        let cancel = CancellationToken::new();
        for last in [1.0, 2.0, 3.0] {
            pipeline.track(gauge(last), &cancel).await.unwrap();
        }
        pipeline.flush(&cancel).await.unwrap();

        let lasts = pipeline
            .snapshot()
            .iter()
            .filter_map(|aggregate| aggregate.data().get("Last"))
            .collect::<Vec<_>>();
        assert_eq!(lasts, [2.0, 3.0]);
        assert_eq!(pipeline.evicted_count(), 1);
        assert_eq!(pipeline.flush_count(), 1);

        assert_eq!(pipeline.drain().len(), 2);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn capacity_from_configuration() {
        let pipeline = MemoryPipeline::from_configuration(&AggregationConfiguration::with_defaults());
        assert_eq!(pipeline.capacity, 1000);
    }
}
