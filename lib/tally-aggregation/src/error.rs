//! Error types.

use snafu::Snafu;

use crate::manager::CycleKind;

/// A type-erased error.
///
/// Used at the boundaries where user-supplied code runs: filters, converters, and consumers.
pub type GenericError = anyhow::Error;

/// An error that occurred while tracking a value.
///
/// These are only ever caused by the caller supplying a value the series cannot represent. The aggregator is left
/// unmodified when one is returned.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum TrackValueError {
    /// A textual value could not be parsed as a number.
    #[snafu(display("Value '{}' could not be parsed as a number.", value))]
    Unparseable {
        /// The rejected value.
        value: String,
    },

    /// A value fell outside of the range the series accepts.
    #[snafu(display("Value {} is outside of the allowed range [{}, {}].", value, min, max))]
    OutOfRange {
        /// The rejected value.
        value: f64,

        /// Smallest accepted value.
        min: f64,

        /// Largest accepted value.
        max: f64,
    },

    /// A value with a fractional part was given to a series restricted to whole numbers.
    #[snafu(display("Value {} is not a whole number.", value))]
    NotWholeNumber {
        /// The rejected value.
        value: f64,
    },
}

/// An error that occurred while controlling an aggregation cycle.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum CycleError {
    /// The cycle is always running and cannot be started or stopped.
    #[snafu(display("The {} aggregation cycle is always running and cannot be started or stopped.", kind))]
    NotControllable {
        /// The cycle kind.
        kind: CycleKind,
    },
}

/// An error that occurred while handing aggregates to a downstream pipeline.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum PipelineError {
    /// No converter was registered for the aggregation kind and destination record type.
    #[snafu(display("No converter registered for '{}' aggregates into '{}'.", moniker, record_type))]
    MissingConverter {
        /// Moniker of the aggregation kind.
        moniker: &'static str,

        /// Name of the destination record type.
        record_type: &'static str,
    },

    /// The operation was cancelled before it completed.
    #[snafu(display("Operation was cancelled."))]
    Cancelled,

    /// The downstream channel was closed.
    #[snafu(display("Downstream channel was closed."))]
    ChannelClosed,
}

/// An error that occurred while resolving the series of a metric.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum MetricError {
    /// The number of dimension values did not match the number of dimensions of the metric.
    #[snafu(display("Metric '{}' has {} dimension(s), but {} value(s) were given.", metric_id, expected, actual))]
    DimensionCountMismatch {
        /// Metric identifier.
        metric_id: String,

        /// Number of dimensions of the metric.
        expected: usize,

        /// Number of dimension values given.
        actual: usize,
    },

    /// A dimension value was empty.
    #[snafu(display("Value for dimension '{}' of metric '{}' must not be empty.", dimension, metric_id))]
    EmptyDimensionValue {
        /// Metric identifier.
        metric_id: String,

        /// Name of the dimension.
        dimension: String,
    },

    /// A value tracked on a metric was rejected by its series.
    #[snafu(display("Invalid value for metric '{}'.", metric_id))]
    InvalidValue {
        /// Metric identifier.
        metric_id: String,

        /// Error source.
        source: TrackValueError,
    },

    /// A metric was requested with a configuration that differs from the one it was created with.
    #[snafu(display(
        "Metric '{}' in namespace '{}' already exists with a different configuration or dimensions.",
        metric_id,
        namespace
    ))]
    ConfigurationMismatch {
        /// Metric namespace.
        namespace: String,

        /// Metric identifier.
        metric_id: String,
    },
}

/// An error with the aggregation settings.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum SettingsError {
    /// The configuration could not be read.
    #[snafu(display("Failed to read aggregation configuration."))]
    Configuration {
        /// Error source.
        source: tally_config::ConfigurationError,
    },

    /// A setting had a value outside of its valid range.
    #[snafu(display("Invalid value for '{}': {}", setting, reason))]
    InvalidSetting {
        /// Name of the setting.
        setting: &'static str,

        /// Description of the problem.
        reason: String,
    },
}
