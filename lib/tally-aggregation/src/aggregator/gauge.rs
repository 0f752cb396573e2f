use super::{finite_or_zero, AggregationState};
use crate::{
    aggregate::AggregateData,
    error::TrackValueError,
    sync::{lock, Mutex},
    value::TrackedValue,
};

#[derive(Default)]
pub(crate) struct Level {
    last: Option<f64>,
    min: f64,
    max: f64,
}

impl Level {
    fn observe(&mut self, value: f64) {
        if self.last.is_none() {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.last = Some(value);
    }

    fn merge(&mut self, other: Level) {
        if let Some(last) = other.last {
            self.observe(other.min);
            self.observe(other.max);
            self.last = Some(last);
        }
    }
}

/// Last, minimum, and maximum level of a gauge.
pub(crate) struct GaugeState {
    level: Mutex<Level>,
}

impl GaugeState {
    pub fn new() -> Self {
        Self {
            level: Mutex::new(Level::default()),
        }
    }
}

impl AggregationState for GaugeState {
    type Value = f64;
    type Delta = Level;

    fn convert(&self, value: &TrackedValue) -> Result<Option<f64>, TrackValueError> {
        let value = value.to_f64()?;
        Ok((!value.is_nan()).then_some(value))
    }

    fn accumulate(delta: &mut Level, value: f64) {
        delta.observe(value);
    }

    fn fold(&self, delta: Level) {
        lock(&self.level).merge(delta);
    }

    fn snapshot(&self) -> AggregateData {
        let level = lock(&self.level);
        match level.last {
            Some(last) => AggregateData::Gauge {
                last: finite_or_zero(last),
                min: finite_or_zero(level.min),
                max: finite_or_zero(level.max),
            },
            None => AggregateData::Gauge {
                last: 0.0,
                min: 0.0,
                max: 0.0,
            },
        }
    }

    fn reset(&self) {
        *lock(&self.level) = Level::default();
    }
}
