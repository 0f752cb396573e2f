//! Series and aggregation configuration.

use std::time::Duration;

use serde::Deserialize;
use snafu::ResultExt as _;
use tally_config::GenericConfiguration;

use crate::{
    aggregate::AggregationKind,
    buffer::DEFAULT_BUFFER_CAPACITY,
    error::{Configuration, SettingsError},
};

/// Kind-specific series options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SeriesKind {
    /// Simple statistics over measurements.
    Measurement {
        /// Whether values must be whole numbers between zero and `u32::MAX`, inclusive.
        restrict_to_whole_numbers: bool,
    },

    /// Gauge level.
    Gauge,

    /// Naive distinct count.
    NaiveDistinctCount {
        /// Whether values differing only by case are counted as distinct.
        case_sensitive: bool,
    },
}

/// Configuration of a metric series.
///
/// Describes which kind of aggregation a series requires, whether its aggregated state must persist across
/// aggregation cycles, and any restrictions on the values it accepts. Configurations are immutable once built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeriesConfiguration {
    persistent: bool,
    kind: SeriesKind,
}

impl SeriesConfiguration {
    /// Creates a configuration for a measurement series, accepting any number.
    pub const fn measurement() -> Self {
        Self {
            persistent: false,
            kind: SeriesKind::Measurement {
                restrict_to_whole_numbers: false,
            },
        }
    }

    /// Creates a configuration for a measurement series accepting only whole numbers between zero and `u32::MAX`.
    pub const fn whole_number_measurement() -> Self {
        Self {
            persistent: false,
            kind: SeriesKind::Measurement {
                restrict_to_whole_numbers: true,
            },
        }
    }

    /// Creates a configuration for a gauge series.
    pub const fn gauge() -> Self {
        Self {
            persistent: false,
            kind: SeriesKind::Gauge,
        }
    }

    /// Creates a configuration for a naive distinct-count series.
    pub const fn naive_distinct_count(case_sensitive: bool) -> Self {
        Self {
            persistent: false,
            kind: SeriesKind::NaiveDistinctCount { case_sensitive },
        }
    }

    /// Sets whether aggregated state persists across aggregation cycles.
    ///
    /// Persistent series are aggregated over their entire lifetime, and are never reset when a cycle completes.
    pub const fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Returns `true` if aggregated state persists across aggregation cycles.
    pub const fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Returns the kind-specific options.
    pub const fn kind(&self) -> &SeriesKind {
        &self.kind
    }

    /// Returns the aggregation kind.
    pub const fn aggregation_kind(&self) -> AggregationKind {
        match self.kind {
            SeriesKind::Measurement { .. } => AggregationKind::Measurement,
            SeriesKind::Gauge => AggregationKind::Gauge,
            SeriesKind::NaiveDistinctCount { .. } => AggregationKind::NaiveDistinctCount,
        }
    }
}

const fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

const fn default_cycle_offset_secs() -> u64 {
    61
}

const fn default_cycle_min_wait_secs() -> u64 {
    20
}

const fn default_series_count_limit() -> usize {
    1000
}

const fn default_values_per_dimension_limit() -> usize {
    100
}

const fn default_memory_pipeline_capacity() -> usize {
    1000
}

/// Aggregation configuration.
///
/// Tunables for buffering, scheduling, and series limits.
#[derive(Clone, Debug, Deserialize)]
pub struct AggregationConfiguration {
    /// Number of values each aggregator buffers before folding them into its running totals.
    ///
    /// Defaults to 500.
    #[serde(default = "default_buffer_capacity")]
    buffer_capacity: usize,

    /// Offset, from the start of the current minute, at which the default cycle completes.
    ///
    /// Defaults to 61 seconds, placing each tick one second past the start of the next minute.
    #[serde(default = "default_cycle_offset_secs")]
    cycle_offset_secs: u64,

    /// Shortest wait the scheduler accepts before a tick.
    ///
    /// When the computed tick is closer than this, the tick moves one more minute out. Defaults to 20 seconds.
    #[serde(default = "default_cycle_min_wait_secs")]
    cycle_min_wait_secs: u64,

    /// Maximum number of series per metric.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_series_count_limit")]
    series_count_limit: usize,

    /// Maximum number of distinct values per dimension of a metric.
    ///
    /// Defaults to 100.
    #[serde(default = "default_values_per_dimension_limit")]
    values_per_dimension_limit: usize,

    /// Number of aggregates an in-memory pipeline keeps before evicting the oldest.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_memory_pipeline_capacity")]
    memory_pipeline_capacity: usize,
}

impl AggregationConfiguration {
    /// Creates a new `AggregationConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or a setting is out of range, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, SettingsError> {
        let aggregation_config: Self = config.as_typed().context(Configuration)?;
        aggregation_config.validate()?;
        Ok(aggregation_config)
    }

    /// Creates a new `AggregationConfiguration` with default values.
    pub const fn with_defaults() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            cycle_offset_secs: default_cycle_offset_secs(),
            cycle_min_wait_secs: default_cycle_min_wait_secs(),
            series_count_limit: default_series_count_limit(),
            values_per_dimension_limit: default_values_per_dimension_limit(),
            memory_pipeline_capacity: default_memory_pipeline_capacity(),
        }
    }

    /// Sets the buffer capacity.
    pub const fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Sets the series count and values-per-dimension limits.
    pub const fn with_series_limits(mut self, series_count_limit: usize, values_per_dimension_limit: usize) -> Self {
        self.series_count_limit = series_count_limit;
        self.values_per_dimension_limit = values_per_dimension_limit;
        self
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let checks = [
            ("buffer_capacity", self.buffer_capacity == 0, "must be greater than zero"),
            (
                "cycle_offset_secs",
                self.cycle_offset_secs < 60 || self.cycle_offset_secs >= 120,
                "must be between 60 and 119 seconds",
            ),
            (
                "cycle_min_wait_secs",
                self.cycle_min_wait_secs >= 60,
                "must be less than 60 seconds",
            ),
            ("memory_pipeline_capacity", self.memory_pipeline_capacity == 0, "must be greater than zero"),
        ];

        match checks.into_iter().find(|(_, invalid, _)| *invalid) {
            Some((setting, _, reason)) => Err(SettingsError::InvalidSetting {
                setting,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Returns the buffer capacity.
    pub const fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Returns the offset within each minute at which the default cycle completes.
    pub const fn cycle_offset(&self) -> Duration {
        Duration::from_secs(self.cycle_offset_secs)
    }

    /// Returns the shortest wait accepted before a tick.
    pub const fn cycle_min_wait(&self) -> Duration {
        Duration::from_secs(self.cycle_min_wait_secs)
    }

    /// Returns the maximum number of series per metric.
    pub const fn series_count_limit(&self) -> usize {
        self.series_count_limit
    }

    /// Returns the maximum number of distinct values per dimension of a metric.
    pub const fn values_per_dimension_limit(&self) -> usize {
        self.values_per_dimension_limit
    }

    /// Returns the capacity of in-memory pipelines.
    pub const fn memory_pipeline_capacity(&self) -> usize {
        self.memory_pipeline_capacity
    }
}

impl Default for AggregationConfiguration {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use tally_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults() {
        let config = AggregationConfiguration::from_configuration(&GenericConfiguration::empty()).unwrap();
        assert_eq!(config.buffer_capacity(), 500);
        assert_eq!(config.cycle_offset(), Duration::from_secs(61));
        assert_eq!(config.cycle_min_wait(), Duration::from_secs(20));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = ConfigurationLoader::default()
            .with_defaults(std::collections::BTreeMap::from([("buffer_capacity", 0usize)]))
            .into_generic();

        let result = AggregationConfiguration::from_configuration(&config);
        assert!(matches!(
            result,
            Err(SettingsError::InvalidSetting {
                setting: "buffer_capacity",
                ..
            })
        ));
    }

    #[test]
    fn series_configuration_kinds() {
        let config = SeriesConfiguration::naive_distinct_count(false).with_persistence(true);
        assert!(config.is_persistent());
        assert_eq!(config.aggregation_kind(), AggregationKind::NaiveDistinctCount);
        assert_eq!(
            SeriesConfiguration::whole_number_measurement().kind(),
            &SeriesKind::Measurement {
                restrict_to_whole_numbers: true
            }
        );
    }
}
