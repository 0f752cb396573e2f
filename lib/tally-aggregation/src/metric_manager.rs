//! Entry point for applications.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    collections::FastHashMap,
    config::{AggregationConfiguration, SeriesConfiguration},
    cycle::{forward_summary, AggregationPeriodCycle, Clock, SystemClock},
    error::{CycleError, MetricError},
    filter::SeriesFilter,
    manager::{AggregationManager, CycleKind},
    metric::Metric,
    pipeline::MetricAggregateConsumer,
    series::MetricSeries,
    summary::AggregationPeriodSummary,
};

static DEFAULT_MANAGER: Mutex<Option<Arc<MetricManager>>> = Mutex::new(None);

/// Installs the process-wide default manager, returning the one it replaces.
pub fn set_default_manager(manager: Arc<MetricManager>) -> Option<Arc<MetricManager>> {
    DEFAULT_MANAGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(manager)
}

/// Returns the process-wide default manager, if one is installed.
pub fn default_manager() -> Option<Arc<MetricManager>> {
    DEFAULT_MANAGER.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Removes the process-wide default manager, returning it.
///
/// The removed manager keeps running until it is stopped.
pub fn reset_default_manager() -> Option<Arc<MetricManager>> {
    DEFAULT_MANAGER.lock().unwrap_or_else(PoisonError::into_inner).take()
}

type MetricKey = (String, String);

/// Ties an [`AggregationManager`] to a consumer.
///
/// The default cycle is completed about once a minute by an [`AggregationPeriodCycle`], which runs from creation until
/// [`stop`][Self::stop] is called. Metrics are created once per namespace and identifier, and handed out again on later
/// requests.
pub struct MetricManager {
    config: AggregationConfiguration,
    aggregation: Arc<AggregationManager>,
    cycle: AggregationPeriodCycle,
    consumer: Arc<dyn MetricAggregateConsumer>,
    metrics: RwLock<FastHashMap<MetricKey, Arc<Metric>>>,
    shutdown: CancellationToken,
}

impl MetricManager {
    /// Creates a new `MetricManager`, and starts its scheduler on the given runtime.
    pub fn new(
        consumer: Arc<dyn MetricAggregateConsumer>, config: AggregationConfiguration, handle: &Handle,
    ) -> Arc<Self> {
        Self::with_clock(consumer, config, Arc::new(SystemClock), handle)
    }

    /// Creates a new `MetricManager` using the given clock, and starts its scheduler on the given runtime.
    pub fn with_clock(
        consumer: Arc<dyn MetricAggregateConsumer>, config: AggregationConfiguration, clock: Arc<dyn Clock>,
        handle: &Handle,
    ) -> Arc<Self> {
        let aggregation = Arc::new(AggregationManager::with_clock(&config, clock));
        let cycle = AggregationPeriodCycle::new(Arc::clone(&aggregation), Arc::clone(&consumer), &config);
        cycle.start(handle);

        Arc::new(Self {
            config,
            aggregation,
            cycle,
            consumer,
            metrics: RwLock::new(FastHashMap::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the aggregation manager.
    pub fn aggregation_manager(&self) -> &Arc<AggregationManager> {
        &self.aggregation
    }

    /// Returns the scheduler.
    pub fn cycle(&self) -> &AggregationPeriodCycle {
        &self.cycle
    }

    /// Creates a new series, outside of any metric.
    ///
    /// Series created this way are not subject to series limits. Creating two series with the same identity yields two
    /// independent series.
    pub fn create_new_series<N, I>(
        &self, namespace: N, metric_id: I, dimensions: IndexMap<String, String>, config: SeriesConfiguration,
    ) -> MetricSeries
    where
        N: Into<String>,
        I: Into<String>,
    {
        self.aggregation.create_series(namespace, metric_id, dimensions, config)
    }

    /// Returns the metric with the given namespace and identifier, creating it if necessary.
    ///
    /// # Errors
    ///
    /// If the metric already exists with different dimension names or a different configuration, an error is returned.
    pub fn metric(
        &self, namespace: &str, metric_id: &str, dimension_names: &[&str], config: SeriesConfiguration,
    ) -> Result<Arc<Metric>, MetricError> {
        let key = (namespace.to_string(), metric_id.to_string());
        if let Some(metric) = self.metrics.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return check_metric(metric, dimension_names, &config);
        }

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let metric = metrics.entry(key).or_insert_with(|| {
            debug!(namespace, metric_id, "Created metric.");
            Arc::new(Metric::new(
                namespace.to_string(),
                metric_id.to_string(),
                dimension_names.iter().map(|name| name.to_string()).collect(),
                config.clone(),
                self.config.series_count_limit(),
                self.config.values_per_dimension_limit(),
                Arc::clone(&self.aggregation),
            ))
        });
        check_metric(metric, dimension_names, &config)
    }

    /// Completes the current period of the default cycle now, and hands its aggregates to the consumer.
    ///
    /// Consumer failures are logged, and do not stop the remaining aggregates from being handed over.
    pub async fn flush(&self) {
        let tact = self.aggregation.now();
        match self.aggregation.cycle_aggregators(CycleKind::Default, tact, None) {
            Ok(summary) => {
                forward_summary(
                    Arc::clone(&self.consumer),
                    summary,
                    self.aggregation.telemetry(),
                    &self.shutdown,
                )
                .await
            }
            Err(e) => warn!(error = %e, "Failed to complete default aggregation cycle."),
        }
    }

    /// Starts the given cycle if it is not running, or completes its current period otherwise.
    ///
    /// Either way, a new period begins at `tact`, aggregating series accepted by `filter`. The summary of the completed
    /// period is returned, and is empty if the cycle was just started.
    ///
    /// # Errors
    ///
    /// If the cycle is not running and cannot be started, an error is returned.
    pub fn start_or_cycle_aggregators(
        &self, kind: CycleKind, tact: DateTime<Utc>, filter: Option<Arc<dyn SeriesFilter>>,
    ) -> Result<AggregationPeriodSummary, CycleError> {
        if self.aggregation.is_cycle_active(kind) {
            return self.aggregation.cycle_aggregators(kind, tact, filter);
        }

        if self.aggregation.start_aggregators(kind, tact, filter.clone())? {
            Ok(AggregationPeriodSummary::empty())
        } else {
            // Started concurrently.
            self.aggregation.cycle_aggregators(kind, tact, filter)
        }
    }

    /// Completes the current period of the given cycle, and stops the cycle.
    ///
    /// # Errors
    ///
    /// If the cycle is the default cycle, an error is returned.
    pub fn stop_aggregators(
        &self, kind: CycleKind, tact: DateTime<Utc>,
    ) -> Result<AggregationPeriodSummary, CycleError> {
        self.aggregation.stop_aggregators(kind, tact)
    }

    /// Stops the scheduler, then flushes whatever the default cycle aggregated since the last tick.
    pub async fn stop(&self) {
        self.cycle.stop().await;
        self.flush().await;
        self.shutdown.cancel();
    }
}

fn check_metric(
    metric: &Arc<Metric>, dimension_names: &[&str], config: &SeriesConfiguration,
) -> Result<Arc<Metric>, MetricError> {
    if metric.matches(dimension_names, config) {
        Ok(Arc::clone(metric))
    } else {
        Err(MetricError::ConfigurationMismatch {
            namespace: metric.namespace().to_string(),
            metric_id: metric.metric_id().to_string(),
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{cycle::SchedulerState, filter::SeriesFilterDecision, pipeline::MemoryPipeline};

    fn manager() -> (Arc<MetricManager>, Arc<MemoryPipeline>) {
        let pipeline = Arc::new(MemoryPipeline::new(64));
        let manager = MetricManager::new(
            pipeline.clone(),
            AggregationConfiguration::with_defaults(),
            &Handle::current(),
        );
        (manager, pipeline)
    }

    #[tokio::test]
    async fn metrics_are_shared() {
        let (manager, _pipeline) = manager();
        let a = manager
            .metric("app", "requests", &["route"], SeriesConfiguration::measurement())
            .unwrap();
        let b = manager
            .metric("app", "requests", &["route"], SeriesConfiguration::measurement())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mismatch = manager.metric("app", "requests", &["route"], SeriesConfiguration::gauge());
        assert!(matches!(mismatch, Err(MetricError::ConfigurationMismatch { .. })));

        let mismatch = manager.metric("app", "requests", &["host"], SeriesConfiguration::measurement());
        assert!(matches!(mismatch, Err(MetricError::ConfigurationMismatch { .. })));

        manager.stop().await;
    }

    #[tokio::test]
    async fn flush_forwards_default_cycle() {
        let (manager, pipeline) = manager();
        let metric = manager
            .metric("app", "requests", &["route"], SeriesConfiguration::measurement())
            .unwrap();
        metric.track_value(2, &["/a"]).unwrap();
        metric.track_value(4, &["/a"]).unwrap();
        metric.track_value(1, &["/b"]).unwrap();

        manager.flush().await;

        let aggregates = pipeline.drain();
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].dimensions()["route"], "/a");
        assert_eq!(aggregates[0].data().get("Sum"), Some(6.0));
        assert_eq!(pipeline.flush_count(), 1);

        // A fresh period has begun.
        manager.flush().await;
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.flush_count(), 2);

        manager.stop().await;
        assert_eq!(manager.cycle().state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn stop_flushes_remaining_values() {
        let (manager, pipeline) = manager();
        manager
            .create_new_series("app", "depth", IndexMap::new(), SeriesConfiguration::gauge())
            .track_value(7)
            .unwrap();

        manager.stop().await;

        let aggregates = pipeline.drain();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].data().get("Last"), Some(7.0));
    }

    #[tokio::test]
    async fn start_or_cycle_custom_aggregators() {
        let (manager, _pipeline) = manager();
        let series = manager.create_new_series("app", "latency", IndexMap::new(), SeriesConfiguration::measurement());
        let now = manager.aggregation_manager().now();

        let filter: Arc<dyn SeriesFilter> = Arc::new(|_: &MetricSeries| SeriesFilterDecision::accept_all());
        let summary = manager
            .start_or_cycle_aggregators(CycleKind::Custom, now, Some(filter))
            .unwrap();
        assert!(summary.is_empty());

        series.track_value(5).unwrap();
        let summary = manager.start_or_cycle_aggregators(CycleKind::Custom, now, None).unwrap();
        assert_eq!(summary.non_persistent_aggregates().len(), 1);

        series.track_value(6).unwrap();
        let summary = manager.stop_aggregators(CycleKind::Custom, now).unwrap();
        assert_eq!(summary.non_persistent_aggregates()[0].data().get("Sum"), Some(6.0));
        assert!(!manager.aggregation_manager().is_cycle_active(CycleKind::Custom));

        assert!(matches!(
            manager.stop_aggregators(CycleKind::Default, now),
            Err(CycleError::NotControllable { .. })
        ));

        manager.stop().await;
    }

    #[tokio::test]
    async fn default_manager_is_replaceable() {
        let (first, _) = manager();
        let (second, _) = manager();

        assert!(set_default_manager(Arc::clone(&first)).is_none());
        let replaced = set_default_manager(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&default_manager().unwrap(), &second));

        assert!(reset_default_manager().is_some());
        assert!(default_manager().is_none());

        first.stop().await;
        second.stop().await;
    }
}
