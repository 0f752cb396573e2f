use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tally_aggregation::{GenericError, MetricAggregate, MetricAggregateConsumer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Logs every aggregate it receives.
#[derive(Default)]
pub struct LoggingConsumer {
    pending: AtomicU64,
    total: AtomicU64,
    flushes: AtomicU64,
}

impl LoggingConsumer {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricAggregateConsumer for LoggingConsumer {
    async fn track(&self, aggregate: MetricAggregate, _cancel: &CancellationToken) -> Result<(), GenericError> {
        debug!(
            namespace = aggregate.namespace(),
            metric_id = aggregate.metric_id(),
            dimensions = ?aggregate.dimensions(),
            period_start = %aggregate.period_start(),
            period = ?aggregate.period_duration(),
            data = ?aggregate.data(),
            "Received aggregate."
        );
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> Result<(), GenericError> {
        let aggregates = self.pending.swap(0, Ordering::Relaxed);
        let flush = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        info!(flush, aggregates, "Flushed aggregates.");
        Ok(())
    }
}
