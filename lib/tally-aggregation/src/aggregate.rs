//! Aggregate snapshots.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{ser::SerializeMap as _, Serialize, Serializer};

use crate::series::SeriesIdentity;

/// The kind of aggregation performed for a series.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(into = "&'static str")]
pub enum AggregationKind {
    /// Simple statistics over arbitrary measurements: count, sum, minimum, maximum, and standard deviation.
    Measurement,

    /// The level of a gauge: last, minimum, and maximum.
    Gauge,

    /// Total and distinct counts of the values observed, computed by keeping every distinct value.
    NaiveDistinctCount,
}

impl AggregationKind {
    /// Returns the moniker of this kind.
    ///
    /// Monikers identify the kind of an aggregate to downstream converters.
    pub const fn moniker(&self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::Gauge => "gauge",
            Self::NaiveDistinctCount => "naive_distinct_count",
        }
    }
}

impl From<AggregationKind> for &'static str {
    fn from(kind: AggregationKind) -> Self {
        kind.moniker()
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.moniker())
    }
}

/// Kind-specific aggregate data.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregateData {
    /// Simple statistics.
    Measurement {
        /// Number of values.
        count: u64,

        /// Sum of all values.
        sum: f64,

        /// Smallest value, or zero if there were no values.
        min: f64,

        /// Largest value, or zero if there were no values.
        max: f64,

        /// Population standard deviation of the values.
        std_dev: f64,
    },

    /// Gauge level.
    Gauge {
        /// Most recently folded value, or zero if there were no values.
        last: f64,

        /// Smallest value, or zero if there were no values.
        min: f64,

        /// Largest value, or zero if there were no values.
        max: f64,
    },

    /// Distinct counts.
    DistinctCount {
        /// Number of values.
        total_count: u64,

        /// Number of distinct values.
        distinct_count: u64,
    },
}

impl AggregateData {
    /// Returns the aggregation kind of this data.
    pub const fn kind(&self) -> AggregationKind {
        match self {
            Self::Measurement { .. } => AggregationKind::Measurement,
            Self::Gauge { .. } => AggregationKind::Gauge,
            Self::DistinctCount { .. } => AggregationKind::NaiveDistinctCount,
        }
    }

    /// Returns the data as key/value pairs.
    ///
    /// Keys are `Count`, `Sum`, `Min`, `Max`, and `StdDev` for measurements, `Last`, `Min`, and `Max` for gauges, and
    /// `TotalCount` and `DistinctCount` for distinct counts.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> {
        let pairs: Vec<(&'static str, f64)> = match *self {
            Self::Measurement {
                count,
                sum,
                min,
                max,
                std_dev,
            } => vec![
                ("Count", count as f64),
                ("Sum", sum),
                ("Min", min),
                ("Max", max),
                ("StdDev", std_dev),
            ],
            Self::Gauge { last, min, max } => vec![("Last", last), ("Min", min), ("Max", max)],
            Self::DistinctCount {
                total_count,
                distinct_count,
            } => vec![
                ("TotalCount", total_count as f64),
                ("DistinctCount", distinct_count as f64),
            ],
        };
        pairs.into_iter()
    }

    /// Returns the value for the given key, if present.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.iter().find(|(k, _)| *k == key).map(|(_, value)| value)
    }
}

impl Serialize for AggregateData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs = self.iter().collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(pairs.len()))?;
        for (key, value) in pairs {
            map.serialize_entry(key, &value)?;
        }
        map.end()
    }
}

/// An immutable snapshot of the aggregated values of one series over one aggregation period.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricAggregate {
    namespace: String,
    metric_id: String,
    kind: AggregationKind,
    period_start: DateTime<Utc>,
    period_duration: Duration,
    dimensions: IndexMap<String, String>,
    data: AggregateData,
}

impl MetricAggregate {
    /// Creates a new `MetricAggregate`.
    pub fn new<N, I>(
        namespace: N, metric_id: I, period_start: DateTime<Utc>, period_duration: Duration,
        dimensions: IndexMap<String, String>, data: AggregateData,
    ) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            metric_id: metric_id.into(),
            kind: data.kind(),
            period_start,
            period_duration,
            dimensions,
            data,
        }
    }

    pub(crate) fn for_series(
        identity: &SeriesIdentity, period_start: DateTime<Utc>, period_end: DateTime<Utc>, data: AggregateData,
    ) -> Self {
        let period_duration = (period_end - period_start).to_std().unwrap_or_default();
        Self::new(
            identity.namespace(),
            identity.metric_id(),
            period_start,
            period_duration,
            identity.dimensions().clone(),
            data,
        )
    }

    /// Returns the metric namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the metric identifier.
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Returns the aggregation kind.
    pub fn kind(&self) -> AggregationKind {
        self.kind
    }

    /// Returns the moniker of the aggregation kind.
    pub fn moniker(&self) -> &'static str {
        self.kind.moniker()
    }

    /// Returns the start of the aggregation period.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    /// Returns the duration of the aggregation period.
    pub fn period_duration(&self) -> Duration {
        self.period_duration
    }

    /// Returns the dimensions of the series, in the order they were declared.
    pub fn dimensions(&self) -> &IndexMap<String, String> {
        &self.dimensions
    }

    /// Returns the aggregate data.
    pub fn data(&self) -> &AggregateData {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn data_lookup() {
        let data = AggregateData::Measurement {
            count: 2,
            sum: 3.0,
            min: 1.0,
            max: 2.0,
            std_dev: 0.5,
        };

        assert_eq!(data.get("Count"), Some(2.0));
        assert_eq!(data.get("StdDev"), Some(0.5));
        assert_eq!(data.get("Last"), None);
        assert_eq!(data.kind(), AggregationKind::Measurement);
    }

    #[test]
    fn serializes_as_flat_record() {
        let mut dimensions = IndexMap::new();
        dimensions.insert("region".to_string(), "eu".to_string());

        let aggregate = MetricAggregate::new(
            "app",
            "queue_depth",
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            Duration::from_secs(60),
            dimensions,
            AggregateData::Gauge {
                last: 4.0,
                min: 1.0,
                max: 9.0,
            },
        );

        let json = serde_json::to_value(&aggregate).unwrap();
        assert_eq!(json["kind"], "gauge");
        assert_eq!(json["dimensions"]["region"], "eu");
        assert_eq!(json["data"]["Last"], 4.0);
        assert_eq!(json["data"]["Max"], 9.0);
    }
}
