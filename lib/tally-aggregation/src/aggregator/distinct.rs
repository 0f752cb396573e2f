use std::sync::Arc;

use super::AggregationState;
use crate::{
    aggregate::AggregateData,
    collections::FastHashSet,
    error::TrackValueError,
    sync::{lock, Mutex},
    value::TrackedValue,
};

#[derive(Default)]
struct Observed {
    total: u64,
    distinct: FastHashSet<Arc<String>>,
}

/// Total and distinct counts of a set of textual values.
///
/// Every distinct value is kept until the aggregator is reset, which is what makes the count naive.
pub(crate) struct DistinctCountState {
    case_sensitive: bool,
    observed: Mutex<Observed>,
}

impl DistinctCountState {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            observed: Mutex::new(Observed::default()),
        }
    }
}

impl AggregationState for DistinctCountState {
    type Value = Arc<String>;
    type Delta = Vec<Arc<String>>;

    fn convert(&self, value: &TrackedValue) -> Result<Option<Arc<String>>, TrackValueError> {
        let value = match value {
            TrackedValue::Text(text) => text.clone(),
            other => other.to_string(),
        };

        let value = if self.case_sensitive {
            value
        } else {
            value.to_lowercase()
        };
        Ok(Some(Arc::new(value)))
    }

    fn accumulate(delta: &mut Vec<Arc<String>>, value: Arc<String>) {
        delta.push(value);
    }

    fn fold(&self, delta: Vec<Arc<String>>) {
        let mut observed = lock(&self.observed);
        observed.total += delta.len() as u64;
        observed.distinct.extend(delta);
    }

    fn snapshot(&self) -> AggregateData {
        let observed = lock(&self.observed);
        AggregateData::DistinctCount {
            total_count: observed.total,
            distinct_count: observed.distinct.len() as u64,
        }
    }

    fn reset(&self) {
        let mut observed = lock(&self.observed);
        observed.total = 0;
        observed.distinct.clear();
    }
}
