use std::sync::atomic::{AtomicU64, Ordering};

use super::{finite_or_zero, AggregationState};
use crate::{
    aggregate::AggregateData,
    error::{NotWholeNumber, OutOfRange, TrackValueError},
    sync::{lock, Mutex},
    value::TrackedValue,
};

const WHOLE_NUMBER_TOLERANCE: f64 = 1e-6;
const WHOLE_NUMBER_MAX: f64 = u32::MAX as f64;

#[derive(Default)]
struct Moments {
    count: u64,
    sum: f64,
    sum_of_squares: f64,
}

pub(crate) struct MeasurementDelta {
    moments: Moments,
    min: f64,
    max: f64,
}

impl Default for MeasurementDelta {
    fn default() -> Self {
        Self {
            moments: Moments::default(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

/// Count, sum, minimum, maximum, and standard deviation of a set of measurements.
///
/// The moments are updated together under a lock, while the extremes are updated independently with compare-and-swap
/// loops.
pub(crate) struct MeasurementState {
    restrict_to_whole_numbers: bool,
    moments: Mutex<Moments>,
    min: AtomicU64,
    max: AtomicU64,
}

impl MeasurementState {
    pub fn new(restrict_to_whole_numbers: bool) -> Self {
        Self {
            restrict_to_whole_numbers,
            moments: Mutex::new(Moments::default()),
            min: AtomicU64::new(f64::INFINITY.to_bits()),
            max: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    fn whole_number(value: f64) -> Result<f64, TrackValueError> {
        if !(-WHOLE_NUMBER_TOLERANCE..=WHOLE_NUMBER_MAX + WHOLE_NUMBER_TOLERANCE).contains(&value) {
            return OutOfRange {
                value,
                min: 0.0,
                max: WHOLE_NUMBER_MAX,
            }
            .fail();
        }

        let rounded = value.round();
        if (value - rounded).abs() > WHOLE_NUMBER_TOLERANCE {
            return NotWholeNumber { value }.fail();
        }

        Ok(rounded.clamp(0.0, WHOLE_NUMBER_MAX))
    }
}

fn update_extreme(cell: &AtomicU64, candidate: f64, replaces: impl Fn(f64, f64) -> bool) {
    let mut current = cell.load(Ordering::Relaxed);
    while replaces(candidate, f64::from_bits(current)) {
        match cell.compare_exchange_weak(current, candidate.to_bits(), Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

impl AggregationState for MeasurementState {
    type Value = f64;
    type Delta = MeasurementDelta;

    fn convert(&self, value: &TrackedValue) -> Result<Option<f64>, TrackValueError> {
        let value = value.to_f64()?;
        if value.is_nan() {
            return Ok(None);
        }

        if self.restrict_to_whole_numbers {
            Self::whole_number(value).map(Some)
        } else {
            Ok(Some(value))
        }
    }

    fn accumulate(delta: &mut MeasurementDelta, value: f64) {
        delta.moments.count += 1;
        delta.moments.sum += value;
        delta.moments.sum_of_squares += value * value;
        delta.min = delta.min.min(value);
        delta.max = delta.max.max(value);
    }

    fn fold(&self, delta: MeasurementDelta) {
        {
            let mut moments = lock(&self.moments);
            moments.count += delta.moments.count;
            moments.sum += delta.moments.sum;
            moments.sum_of_squares += delta.moments.sum_of_squares;
        }

        update_extreme(&self.min, delta.min, |candidate, current| candidate < current);
        update_extreme(&self.max, delta.max, |candidate, current| candidate > current);
    }

    fn snapshot(&self) -> AggregateData {
        let (count, sum, sum_of_squares) = {
            let moments = lock(&self.moments);
            (moments.count, moments.sum, moments.sum_of_squares)
        };

        if count == 0 {
            return AggregateData::Measurement {
                count: 0,
                sum: 0.0,
                min: 0.0,
                max: 0.0,
                std_dev: 0.0,
            };
        }

        let n = count as f64;
        let mean = sum / n;
        let variance = sum_of_squares / n - mean * mean;
        // Rounding can push the variance of near-identical values slightly below zero.
        let std_dev = variance.max(0.0).sqrt();

        AggregateData::Measurement {
            count,
            sum: finite_or_zero(sum),
            min: finite_or_zero(f64::from_bits(self.min.load(Ordering::Acquire))),
            max: finite_or_zero(f64::from_bits(self.max.load(Ordering::Acquire))),
            std_dev: finite_or_zero(std_dev),
        }
    }

    fn reset(&self) {
        *lock(&self.moments) = Moments::default();
        self.min.store(f64::INFINITY.to_bits(), Ordering::Release);
        self.max.store(f64::NEG_INFINITY.to_bits(), Ordering::Release);
    }
}
