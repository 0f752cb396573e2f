use metrics::{counter, Counter};

use crate::manager::CycleKind;

#[derive(Clone)]
pub(crate) struct Telemetry {
    buffer_rotations: Counter,
    buffers_recycled: Counter,
    aggregators_recycled: Counter,
    values_filtered: Counter,
    invalid_values: Counter,
    filter_errors: Counter,
    aggregates_emitted: Counter,
    consumer_errors: Counter,
    cycles_completed: [Counter; CycleKind::COUNT],
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            buffer_rotations: counter!("tally_aggregation_buffer_rotations_total"),
            buffers_recycled: counter!("tally_aggregation_buffers_recycled_total"),
            aggregators_recycled: counter!("tally_aggregation_aggregators_recycled_total"),
            values_filtered: counter!("tally_aggregation_values_filtered_total"),
            invalid_values: counter!("tally_aggregation_invalid_values_total"),
            filter_errors: counter!("tally_aggregation_filter_errors_total"),
            aggregates_emitted: counter!("tally_aggregation_aggregates_emitted_total"),
            consumer_errors: counter!("tally_aggregation_consumer_errors_total"),
            cycles_completed: CycleKind::ALL
                .map(|kind| counter!("tally_aggregation_cycles_completed_total", "cycle" => kind.as_str())),
        }
    }

    pub fn buffer_rotations(&self) -> &Counter {
        &self.buffer_rotations
    }

    pub fn buffers_recycled(&self) -> &Counter {
        &self.buffers_recycled
    }

    pub fn aggregators_recycled(&self) -> &Counter {
        &self.aggregators_recycled
    }

    pub fn values_filtered(&self) -> &Counter {
        &self.values_filtered
    }

    pub fn invalid_values(&self) -> &Counter {
        &self.invalid_values
    }

    pub fn filter_errors(&self) -> &Counter {
        &self.filter_errors
    }

    pub fn aggregates_emitted(&self) -> &Counter {
        &self.aggregates_emitted
    }

    pub fn consumer_errors(&self) -> &Counter {
        &self.consumer_errors
    }

    pub fn cycles_completed(&self, kind: CycleKind) -> &Counter {
        &self.cycles_completed[kind.index()]
    }
}

#[cfg(all(test, not(feature = "loom")))]
pub(crate) fn get_counter_value(
    metrics: &[(
        metrics_util::CompositeKey,
        Option<metrics::Unit>,
        Option<metrics::SharedString>,
        metrics_util::debugging::DebugValue,
    )],
    name: &str, label: Option<&str>,
) -> u64 {
    use metrics_util::{debugging::DebugValue, MetricKind};

    metrics
        .iter()
        .find(|(k, _, _, _)| {
            k.kind() == MetricKind::Counter
                && k.key().name() == name
                && label.map_or(true, |label| k.key().labels().any(|l| l.value() == label))
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(value) => *value,
            other => panic!("expected a counter, got: {:?}", other),
        })
        .unwrap_or_else(|| panic!("no metric found with key: {}", name))
}
