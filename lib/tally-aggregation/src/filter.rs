//! Series and value filters.
//!
//! Filters are supplied by whoever starts an aggregation cycle, and decide which series, and which values of those
//! series, the cycle aggregates. Filters run user code on hot paths, so a filter that fails, whether by returning an
//! error or by panicking, never stops collection: the failure is logged and the filter is treated as accepting.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::debug;

use crate::{error::GenericError, series::MetricSeries, telemetry::Telemetry, value::TrackedValue};

/// Decision of a [`SeriesFilter`].
#[derive(Clone)]
pub enum SeriesFilterDecision {
    /// The series is aggregated, optionally with a filter applied to each of its values.
    Accept(Option<Arc<dyn ValueFilter>>),

    /// The series is not aggregated by the cycle.
    Reject,
}

impl SeriesFilterDecision {
    /// Accepts the series and all of its values.
    pub const fn accept_all() -> Self {
        Self::Accept(None)
    }

    /// Returns `true` if the series is accepted.
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Decides whether an aggregation cycle aggregates a series.
///
/// Consulted once per series and cycle period, when the aggregator for the series is added to the cycle, and again
/// when the cycle completes for persistent series.
pub trait SeriesFilter: Send + Sync {
    /// Decides whether the given series should be aggregated.
    ///
    /// # Errors
    ///
    /// Errors are logged and treated as accepting the series with no value filter.
    fn will_consume(&self, series: &MetricSeries) -> Result<SeriesFilterDecision, GenericError>;
}

impl<F> SeriesFilter for F
where
    F: Fn(&MetricSeries) -> SeriesFilterDecision + Send + Sync,
{
    fn will_consume(&self, series: &MetricSeries) -> Result<SeriesFilterDecision, GenericError> {
        Ok(self(series))
    }
}

/// Decides whether an aggregator aggregates a single value.
pub trait ValueFilter: Send + Sync {
    /// Decides whether the given value of the given series should be aggregated.
    ///
    /// # Errors
    ///
    /// Errors are logged and treated as accepting the value.
    fn will_consume(&self, series: &MetricSeries, value: &TrackedValue) -> Result<bool, GenericError>;
}

impl<F> ValueFilter for F
where
    F: Fn(&MetricSeries, &TrackedValue) -> bool + Send + Sync,
{
    fn will_consume(&self, series: &MetricSeries, value: &TrackedValue) -> Result<bool, GenericError> {
        Ok(self(series, value))
    }
}

pub(crate) fn consult_series_filter(
    filter: &dyn SeriesFilter, series: &MetricSeries, telemetry: &Telemetry,
) -> SeriesFilterDecision {
    match catch_unwind(AssertUnwindSafe(|| filter.will_consume(series))) {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            debug!(error = %e, metric_id = series.identity().metric_id(), "Series filter failed. Accepting series.");
            telemetry.filter_errors().increment(1);
            SeriesFilterDecision::accept_all()
        }
        Err(_) => {
            debug!(metric_id = series.identity().metric_id(), "Series filter panicked. Accepting series.");
            telemetry.filter_errors().increment(1);
            SeriesFilterDecision::accept_all()
        }
    }
}

pub(crate) fn consult_value_filter(
    filter: &dyn ValueFilter, series: &MetricSeries, value: &TrackedValue, telemetry: &Telemetry,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| filter.will_consume(series, value))) {
        Ok(Ok(consume)) => consume,
        Ok(Err(e)) => {
            debug!(error = %e, metric_id = series.identity().metric_id(), "Value filter failed. Accepting value.");
            telemetry.filter_errors().increment(1);
            true
        }
        Err(_) => {
            debug!(metric_id = series.identity().metric_id(), "Value filter panicked. Accepting value.");
            telemetry.filter_errors().increment(1);
            true
        }
    }
}
