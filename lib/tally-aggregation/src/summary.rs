use serde::Serialize;

use crate::aggregate::MetricAggregate;

/// Aggregates produced by completing one period of an aggregation cycle.
///
/// Aggregates of persistent series, which cover the lifetime of their series, are kept apart from the aggregates of the
/// period itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregationPeriodSummary {
    persistent: Vec<MetricAggregate>,
    non_persistent: Vec<MetricAggregate>,
}

impl AggregationPeriodSummary {
    /// Creates a new `AggregationPeriodSummary`.
    pub fn new(persistent: Vec<MetricAggregate>, non_persistent: Vec<MetricAggregate>) -> Self {
        Self {
            persistent,
            non_persistent,
        }
    }

    /// Creates an empty `AggregationPeriodSummary`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the aggregates of persistent series.
    pub fn persistent_aggregates(&self) -> &[MetricAggregate] {
        &self.persistent
    }

    /// Returns the aggregates of non-persistent series.
    pub fn non_persistent_aggregates(&self) -> &[MetricAggregate] {
        &self.non_persistent
    }

    /// Returns the total number of aggregates.
    pub fn len(&self) -> usize {
        self.persistent.len() + self.non_persistent.len()
    }

    /// Returns `true` if the summary holds no aggregates.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over every aggregate, persistent ones first.
    pub fn iter(&self) -> impl Iterator<Item = &MetricAggregate> {
        self.persistent.iter().chain(self.non_persistent.iter())
    }

    /// Consumes the summary, returning every aggregate, persistent ones first.
    pub fn into_aggregates(self) -> impl Iterator<Item = MetricAggregate> {
        self.persistent.into_iter().chain(self.non_persistent)
    }
}
