use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use super::MetricAggregateConverter;
use crate::{
    aggregate::{AggregateData, MetricAggregate},
    error::GenericError,
};

/// Property holding the aggregation kind moniker.
pub const AGGREGATION_KIND_PROPERTY: &str = "aggregation.kind";

/// Property holding the aggregation period length, in milliseconds.
pub const AGGREGATION_INTERVAL_PROPERTY: &str = "aggregation.interval_ms";

/// A flat metric record, suitable for most metric backends.
///
/// Every aggregation kind maps onto the same statistics:
///
/// - measurements map directly
/// - gauges report a count of one, with the last level as the sum
/// - distinct counts report the total count as the count, and the distinct count as the sum, minimum, and maximum
///
/// The dimensions of the series become properties, along with the aggregation kind and period length.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricRecord {
    /// Metric namespace.
    pub namespace: String,

    /// Metric name.
    pub name: String,

    /// Number of values.
    pub count: u64,

    /// Sum of values.
    pub sum: f64,

    /// Smallest value.
    pub min: f64,

    /// Largest value.
    pub max: f64,

    /// Standard deviation of values.
    pub std_dev: f64,

    /// Start of the aggregation period.
    pub timestamp: DateTime<Utc>,

    /// Series dimensions and aggregation details.
    pub properties: IndexMap<String, String>,
}

/// Converts aggregates of every kind into [`MetricRecord`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricRecordConverter;

impl MetricAggregateConverter<MetricRecord> for MetricRecordConverter {
    fn convert(&self, aggregate: &MetricAggregate) -> Result<MetricRecord, GenericError> {
        let (count, sum, min, max, std_dev) = match *aggregate.data() {
            AggregateData::Measurement {
                count,
                sum,
                min,
                max,
                std_dev,
            } => (count, sum, min, max, std_dev),
            AggregateData::Gauge { last, min, max } => (1, last, min, max, 0.0),
            AggregateData::DistinctCount {
                total_count,
                distinct_count,
            } => {
                let distinct = distinct_count as f64;
                (total_count, distinct, distinct, distinct, 0.0)
            }
        };

        let mut properties = aggregate.dimensions().clone();
        properties.insert(AGGREGATION_KIND_PROPERTY.to_string(), aggregate.moniker().to_string());
        properties.insert(
            AGGREGATION_INTERVAL_PROPERTY.to_string(),
            aggregate.period_duration().as_millis().to_string(),
        );

        Ok(MetricRecord {
            namespace: aggregate.namespace().to_string(),
            name: aggregate.metric_id().to_string(),
            count,
            sum,
            min,
            max,
            std_dev,
            timestamp: aggregate.period_start(),
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn gauge_record() {
        let mut dimensions = IndexMap::new();
        dimensions.insert("queue".to_string(), "ingest".to_string());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let aggregate = MetricAggregate::new(
            "app",
            "queue_depth",
            start,
            Duration::from_secs(60),
            dimensions,
            AggregateData::Gauge {
                last: 4.0,
                min: 1.0,
                max: 9.0,
            },
        );

        let record = MetricRecordConverter.convert(&aggregate).unwrap();
        assert_eq!(record.name, "queue_depth");
        assert_eq!((record.count, record.sum, record.min, record.max), (1, 4.0, 1.0, 9.0));
        assert_eq!(record.timestamp, start);

        let properties = record.properties.iter().collect::<Vec<_>>();
        assert_eq!(properties[0], (&"queue".to_string(), &"ingest".to_string()));
        assert_eq!(record.properties[AGGREGATION_KIND_PROPERTY], "gauge");
        assert_eq!(record.properties[AGGREGATION_INTERVAL_PROPERTY], "60000");
    }

    #[test]
    fn distinct_count_record() {
        let aggregate = MetricAggregate::new(
            "app",
            "users",
            Utc::now(),
            Duration::from_secs(60),
            IndexMap::new(),
            AggregateData::DistinctCount {
                total_count: 10,
                distinct_count: 4,
            },
        );

        let record = MetricRecordConverter.convert(&aggregate).unwrap();
        assert_eq!((record.count, record.sum, record.max), (10, 4.0, 4.0));
    }
}
