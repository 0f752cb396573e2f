//! Dimensioned metrics.

use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use snafu::{ensure, ResultExt as _};
use tracing::debug;

use crate::{
    collections::{FastHashMap, FastHashSet},
    config::SeriesConfiguration,
    error::{DimensionCountMismatch, EmptyDimensionValue, InvalidValue, MetricError},
    manager::AggregationManager,
    series::MetricSeries,
    value::TrackedValue,
};

#[derive(Default)]
struct SeriesTable {
    series: FastHashMap<Vec<String>, MetricSeries>,
    dimension_values: Vec<FastHashSet<String>>,
}

/// A family of series sharing a namespace, a metric identifier, a set of dimension names, and a configuration.
///
/// Each distinct combination of dimension values is its own series, created on first use. The number of series, and
/// the number of distinct values of each dimension, are both capped: once a cap is reached, values for new series are
/// dropped.
pub struct Metric {
    namespace: String,
    metric_id: String,
    dimension_names: Vec<String>,
    config: SeriesConfiguration,
    series_count_limit: usize,
    values_per_dimension_limit: usize,
    manager: Arc<AggregationManager>,
    table: RwLock<SeriesTable>,
}

impl Metric {
    pub(crate) fn new(
        namespace: String, metric_id: String, dimension_names: Vec<String>, config: SeriesConfiguration,
        series_count_limit: usize, values_per_dimension_limit: usize, manager: Arc<AggregationManager>,
    ) -> Self {
        let table = SeriesTable {
            series: FastHashMap::default(),
            dimension_values: vec![FastHashSet::default(); dimension_names.len()],
        };

        Self {
            namespace,
            metric_id,
            dimension_names,
            config,
            series_count_limit,
            values_per_dimension_limit,
            manager,
            table: RwLock::new(table),
        }
    }

    /// Returns the metric namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the metric identifier.
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Returns the dimension names, in declaration order.
    pub fn dimension_names(&self) -> &[String] {
        &self.dimension_names
    }

    /// Returns the series configuration shared by every series of this metric.
    pub fn configuration(&self) -> &SeriesConfiguration {
        &self.config
    }

    /// Returns the number of series created so far.
    pub fn series_count(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).series.len()
    }

    /// Returns the series for the given dimension values, creating it if necessary.
    ///
    /// Returns `None` if the series does not exist yet and creating it would exceed the series count limit, or the
    /// limit on distinct values of one of the dimensions.
    ///
    /// # Errors
    ///
    /// If the number of values does not match the number of dimensions, or a value is empty, an error is returned.
    pub fn get_or_create_series(&self, dimension_values: &[&str]) -> Result<Option<MetricSeries>, MetricError> {
        ensure!(
            dimension_values.len() == self.dimension_names.len(),
            DimensionCountMismatch {
                metric_id: self.metric_id.as_str(),
                expected: self.dimension_names.len(),
                actual: dimension_values.len(),
            }
        );
        for (name, value) in self.dimension_names.iter().zip(dimension_values) {
            ensure!(
                !value.trim().is_empty(),
                EmptyDimensionValue {
                    metric_id: self.metric_id.as_str(),
                    dimension: name.as_str(),
                }
            );
        }

        let key = dimension_values.iter().map(|value| value.to_string()).collect::<Vec<_>>();
        if let Some(series) = self.table.read().unwrap_or_else(PoisonError::into_inner).series.get(&key) {
            return Ok(Some(series.clone()));
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(series) = table.series.get(&key) {
            return Ok(Some(series.clone()));
        }

        if table.series.len() >= self.series_count_limit {
            debug!(metric_id = %self.metric_id, limit = self.series_count_limit, "Series count limit reached.");
            return Ok(None);
        }

        for (i, value) in key.iter().enumerate() {
            let values = &table.dimension_values[i];
            if !values.contains(value) && values.len() >= self.values_per_dimension_limit {
                debug!(
                    metric_id = %self.metric_id,
                    dimension = %self.dimension_names[i],
                    limit = self.values_per_dimension_limit,
                    "Dimension value limit reached."
                );
                return Ok(None);
            }
        }

        for (values, value) in table.dimension_values.iter_mut().zip(&key) {
            values.insert(value.clone());
        }

        let dimensions = self
            .dimension_names
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect::<IndexMap<_, _>>();
        let series = self.manager.create_series(
            self.namespace.as_str(),
            self.metric_id.as_str(),
            dimensions,
            self.config.clone(),
        );
        table.series.insert(key, series.clone());

        Ok(Some(series))
    }

    /// Tracks a value on the series for the given dimension values.
    ///
    /// Returns `false` if the value was dropped because a series limit was reached.
    ///
    /// # Errors
    ///
    /// If the dimension values are invalid, or the value cannot be converted into the domain of the series, an error
    /// is returned.
    pub fn track_value<V>(&self, value: V, dimension_values: &[&str]) -> Result<bool, MetricError>
    where
        V: Into<TrackedValue>,
    {
        match self.get_or_create_series(dimension_values)? {
            Some(series) => {
                series.track_value(value).context(InvalidValue {
                    metric_id: self.metric_id.as_str(),
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn matches(&self, dimension_names: &[&str], config: &SeriesConfiguration) -> bool {
        self.config == *config
            && self.dimension_names.len() == dimension_names.len()
            && self.dimension_names.iter().zip(dimension_names).all(|(a, b)| a == b)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{config::AggregationConfiguration, error::TrackValueError, manager::CycleKind};

    fn metric(dimension_names: &[&str], series_count_limit: usize, values_per_dimension_limit: usize) -> Metric {
        let manager = Arc::new(AggregationManager::new(&AggregationConfiguration::with_defaults()));
        Metric::new(
            "app".to_string(),
            "latency".to_string(),
            dimension_names.iter().map(|name| name.to_string()).collect(),
            SeriesConfiguration::whole_number_measurement(),
            series_count_limit,
            values_per_dimension_limit,
            manager,
        )
    }

    #[test]
    fn same_values_same_series() {
        let metric = metric(&["region", "host"], 10, 10);
        let a = metric.get_or_create_series(&["eu", "a"]).unwrap().unwrap();
        let b = metric.get_or_create_series(&["eu", "a"]).unwrap().unwrap();
        metric.get_or_create_series(&["eu", "b"]).unwrap().unwrap();

        assert_eq!(a.identity(), b.identity());
        assert_eq!(metric.series_count(), 2);

        let dimensions = a.identity().dimensions().iter().collect::<Vec<_>>();
        assert_eq!(dimensions[0], (&"region".to_string(), &"eu".to_string()));
        assert_eq!(dimensions[1], (&"host".to_string(), &"a".to_string()));
    }

    #[test]
    fn zero_dimensions() {
        let metric = metric(&[], 10, 10);
        assert!(metric.track_value(3, &[]).unwrap());
        assert!(metric.track_value(4, &[]).unwrap());
        assert_eq!(metric.series_count(), 1);

        let series = metric.get_or_create_series(&[]).unwrap().unwrap();
        let aggregate = series.get_current_aggregate_unsafe(CycleKind::Default).unwrap();
        assert_eq!(aggregate.data().get("Sum"), Some(7.0));
    }

    #[test]
    fn invalid_dimension_values() {
        let metric = metric(&["region"], 10, 10);
        assert!(matches!(
            metric.get_or_create_series(&[]),
            Err(MetricError::DimensionCountMismatch {
                expected: 1,
                actual: 0,
                ..
            })
        ));
        assert!(matches!(
            metric.get_or_create_series(&["  "]),
            Err(MetricError::EmptyDimensionValue { .. })
        ));
    }

    #[test]
    fn series_count_limit() {
        let metric = metric(&["host"], 2, 10);
        assert!(metric.track_value(1, &["a"]).unwrap());
        assert!(metric.track_value(1, &["b"]).unwrap());
        assert!(!metric.track_value(1, &["c"]).unwrap());
        assert!(metric.track_value(1, &["a"]).unwrap());
        assert_eq!(metric.series_count(), 2);
    }

    #[test]
    fn values_per_dimension_limit() {
        let metric = metric(&["region", "host"], 100, 2);
        assert!(metric.get_or_create_series(&["eu", "a"]).unwrap().is_some());
        assert!(metric.get_or_create_series(&["us", "a"]).unwrap().is_some());
        assert!(metric.get_or_create_series(&["ap", "a"]).unwrap().is_none());

        // Known values still combine freely.
        assert!(metric.get_or_create_series(&["us", "b"]).unwrap().is_some());
        assert!(metric.get_or_create_series(&["eu", "b"]).unwrap().is_some());
        assert!(metric.get_or_create_series(&["eu", "c"]).unwrap().is_none());
    }

    #[test]
    fn invalid_value_is_reported() {
        let metric = metric(&[], 10, 10);
        let result = metric.track_value(-5, &[]);
        assert!(matches!(
            result,
            Err(MetricError::InvalidValue {
                source: TrackValueError::OutOfRange { .. },
                ..
            })
        ));
    }
}
