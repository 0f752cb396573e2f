//! Series aggregators.
//!
//! An aggregator accumulates the values tracked for one series within one aggregation cycle. Producers never take a
//! lock to track a value: they claim a slot in the aggregator's current [`ValuesBuffer`] and write the value into it.
//! The producer that fills the last slot of a buffer installs a replacement buffer, and then folds the values of the
//! full buffer into the running totals of the aggregator. Producers that claim a slot past the end of a full buffer
//! wait until the replacement is visible, and retry against it.
//!
//! Buffers live for roughly one aggregation period, so a drained buffer is kept in a single-entry slot and reused by
//! the next rotation, as long as nothing else still references it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::{
    aggregate::{AggregateData, AggregationKind, MetricAggregate},
    buffer::{SlotValue, ValuesBuffer},
    config::{SeriesConfiguration, SeriesKind},
    error::TrackValueError,
    filter::{consult_value_filter, ValueFilter},
    manager::CycleKind,
    series::{MetricSeries, SeriesIdentity, SeriesInner},
    sync::Backoff,
    telemetry::Telemetry,
    value::TrackedValue,
};

mod distinct;
use self::distinct::DistinctCountState;

mod gauge;
use self::gauge::GaugeState;

mod measurement;
use self::measurement::MeasurementState;

/// Running state of one kind of aggregation.
///
/// Values are first converted into the buffered representation, then folded in batches: a drain accumulates the
/// buffered values into a `Delta` while holding the buffer lock, and the delta is then folded into the running state,
/// which does its own synchronization.
pub(crate) trait AggregationState: Send + Sync + 'static {
    type Value: SlotValue;
    type Delta: Default;

    /// Converts a tracked value, returning `None` if the value should be ignored.
    fn convert(&self, value: &TrackedValue) -> Result<Option<Self::Value>, TrackValueError>;

    fn accumulate(delta: &mut Self::Delta, value: Self::Value);

    fn fold(&self, delta: Self::Delta);

    fn snapshot(&self) -> AggregateData;

    fn reset(&self);
}

/// Replaces an infinite or NaN statistic with zero before it is reported.
fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

struct BufferedAggregator<S: AggregationState> {
    state: S,
    buffer: ArcSwap<ValuesBuffer<S::Value>>,
    spare_buffer: ArcSwapOption<ValuesBuffer<S::Value>>,
    buffer_capacity: usize,
}

impl<S: AggregationState> BufferedAggregator<S> {
    fn new(state: S, buffer_capacity: usize) -> Self {
        Self {
            state,
            buffer: ArcSwap::from_pointee(ValuesBuffer::new(buffer_capacity)),
            spare_buffer: ArcSwapOption::empty(),
            buffer_capacity,
        }
    }

    fn track(&self, value: &TrackedValue, telemetry: &Telemetry) -> Result<(), TrackValueError> {
        if let Some(value) = self.state.convert(value)? {
            self.append(value, telemetry);
        }
        Ok(())
    }

    fn append(&self, value: S::Value, telemetry: &Telemetry) {
        let mut backoff = Backoff::new();
        loop {
            // Hold a counted reference to the buffer we claim on, so that it cannot be recycled underneath us.
            let buffer = self.buffer.load_full();
            let index = buffer.increment_write_index();
            let capacity = buffer.capacity();

            if index < capacity {
                buffer.write_value(index, value);
                if index == capacity - 1 {
                    self.rotate(buffer, telemetry);
                }
                return;
            }

            // The buffer is full, and whoever filled it is installing a replacement.
            while Arc::ptr_eq(&self.buffer.load(), &buffer) {
                backoff.snooze();
            }
        }
    }

    fn rotate(&self, full: Arc<ValuesBuffer<S::Value>>, telemetry: &Telemetry) {
        let replacement = self.take_spare_buffer();
        let previous = self.buffer.compare_and_swap(&full, replacement);
        if !Arc::ptr_eq(&previous, &full) {
            // The aggregator was reset while we were filling the last slot: the buffer was already replaced.
            trace!("Buffer replaced during rotation.");
        }
        drop(previous);

        telemetry.buffer_rotations().increment(1);
        self.drain(&full);
        self.recycle_buffer(full, telemetry);
    }

    fn take_spare_buffer(&self) -> Arc<ValuesBuffer<S::Value>> {
        self.spare_buffer
            .swap(None)
            .unwrap_or_else(|| Arc::new(ValuesBuffer::new(self.buffer_capacity)))
    }

    fn recycle_buffer(&self, buffer: Arc<ValuesBuffer<S::Value>>, telemetry: &Telemetry) {
        // A producer still holding the buffer could claim a slot in it after it was reset and reinstalled, so only a
        // buffer nothing else references is reused.
        if Arc::strong_count(&buffer) != 1 {
            return;
        }

        buffer.reset_indices_and_data();
        let previous = self
            .spare_buffer
            .compare_and_swap(&None::<Arc<ValuesBuffer<S::Value>>>, Some(buffer));
        if previous.is_none() {
            telemetry.buffers_recycled().increment(1);
        }
    }

    fn drain(&self, buffer: &ValuesBuffer<S::Value>) {
        let mut delta = S::Delta::default();
        let drained = buffer.drain(|value| S::accumulate(&mut delta, value));
        if drained > 0 {
            self.state.fold(delta);
        }
    }

    fn force_drain(&self) {
        let current = self.buffer.load_full();
        self.drain(&current);
    }

    fn reset(&self, telemetry: &Telemetry) {
        let stale = self.buffer.swap(self.take_spare_buffer());
        self.state.reset();
        self.recycle_buffer(stale, telemetry);
    }
}

enum Core {
    Measurement(BufferedAggregator<MeasurementState>),
    Gauge(BufferedAggregator<GaugeState>),
    DistinctCount(BufferedAggregator<DistinctCountState>),
}

macro_rules! with_core {
    ($core:expr, $inner:ident => $body:expr) => {
        match $core {
            Core::Measurement($inner) => $body,
            Core::Gauge($inner) => $body,
            Core::DistinctCount($inner) => $body,
        }
    };
}

struct PeriodSettings {
    start: DateTime<Utc>,
    value_filter: Option<Arc<dyn ValueFilter>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aggregates the values of one series for one aggregation cycle, or for the lifetime of a persistent series.
///
/// Aggregators are created by their [`MetricSeries`] when a value is first tracked while a cycle is running, and are
/// owned by the cycle until it completes. Persistent series instead have a single aggregator, created with the series,
/// that every cycle reports on and none resets.
pub struct SeriesAggregator {
    core: Core,
    identity: Arc<SeriesIdentity>,
    series: Weak<SeriesInner>,
    cycle: Option<CycleKind>,
    persistent: bool,
    settings: ArcSwap<PeriodSettings>,
    in_flight: AtomicUsize,
    telemetry: Arc<Telemetry>,
}

impl SeriesAggregator {
    pub(crate) fn new(
        config: &SeriesConfiguration, identity: Arc<SeriesIdentity>, series: Weak<SeriesInner>,
        cycle: Option<CycleKind>, period_start: DateTime<Utc>, buffer_capacity: usize, telemetry: Arc<Telemetry>,
    ) -> Self {
        let core = match *config.kind() {
            SeriesKind::Measurement {
                restrict_to_whole_numbers,
            } => Core::Measurement(BufferedAggregator::new(
                MeasurementState::new(restrict_to_whole_numbers),
                buffer_capacity,
            )),
            SeriesKind::Gauge => Core::Gauge(BufferedAggregator::new(GaugeState::new(), buffer_capacity)),
            SeriesKind::NaiveDistinctCount { case_sensitive } => Core::DistinctCount(BufferedAggregator::new(
                DistinctCountState::new(case_sensitive),
                buffer_capacity,
            )),
        };

        Self {
            core,
            identity,
            series,
            cycle,
            persistent: config.is_persistent(),
            settings: ArcSwap::from_pointee(PeriodSettings {
                start: period_start,
                value_filter: None,
            }),
            in_flight: AtomicUsize::new(0),
            telemetry,
        }
    }

    /// Returns the aggregation kind.
    pub fn kind(&self) -> AggregationKind {
        match self.core {
            Core::Measurement(_) => AggregationKind::Measurement,
            Core::Gauge(_) => AggregationKind::Gauge,
            Core::DistinctCount(_) => AggregationKind::NaiveDistinctCount,
        }
    }

    /// Returns `true` if this aggregator keeps its state across aggregation cycles.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Returns the cycle this aggregator belongs to, or `None` for persistent aggregators.
    pub fn cycle_kind(&self) -> Option<CycleKind> {
        self.cycle
    }

    /// Returns the identity of the series.
    pub fn identity(&self) -> &SeriesIdentity {
        &self.identity
    }

    /// Returns the series this aggregator belongs to, if it still exists.
    pub fn series(&self) -> Option<MetricSeries> {
        self.series.upgrade().map(MetricSeries::from_inner)
    }

    /// Returns the start of the current aggregation period.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.settings.load().start
    }

    /// Tracks a value.
    ///
    /// NaN values are ignored. If the current period has a value filter, and the filter rejects the value, the value
    /// is ignored as well.
    ///
    /// # Errors
    ///
    /// If the value cannot be converted into the domain of the aggregator, an error is returned and the aggregator is
    /// left unmodified.
    pub fn track_value<V>(&self, value: V) -> Result<(), TrackValueError>
    where
        V: Into<TrackedValue>,
    {
        self.track(&value.into())
    }

    pub(crate) fn track(&self, value: &TrackedValue) -> Result<(), TrackValueError> {
        if value.is_nan() {
            trace!(metric_id = self.identity.metric_id(), "Ignoring NaN value.");
            return Ok(());
        }

        let _in_flight = InFlight::enter(&self.in_flight);

        let settings = self.settings.load();
        if let Some(filter) = settings.value_filter.as_deref() {
            if let Some(series) = self.series() {
                if !consult_value_filter(filter, &series, value, &self.telemetry) {
                    self.telemetry.values_filtered().increment(1);
                    return Ok(());
                }
            }
        }

        let result = with_core!(&self.core, core => core.track(value, &self.telemetry));
        if result.is_err() {
            self.telemetry.invalid_values().increment(1);
        }
        result
    }

    /// Creates an aggregate from the values tracked so far in the current period.
    ///
    /// The current buffer is drained first. Producers may keep tracking values concurrently, so the aggregate is only
    /// a point-in-time estimate; this is meant for peeking at an in-progress period.
    pub fn create_aggregate_unsafe(&self, period_end: DateTime<Utc>) -> MetricAggregate {
        let data = with_core!(&self.core, core => {
            core.force_drain();
            core.state.snapshot()
        });

        MetricAggregate::for_series(&self.identity, self.period_start(), period_end, data)
    }

    /// Completes the current aggregation period, returning its aggregate.
    ///
    /// A non-persistent aggregator is first detached from its series, so that new values are routed to the next
    /// aggregator, and then waits for in-flight tracking calls to finish before draining. A persistent aggregator is
    /// neither detached nor reset: its aggregate covers the lifetime of the series, and its individual fields may be
    /// momentarily out of sync with one another if values are being tracked concurrently.
    pub fn complete_aggregation(self: &Arc<Self>, period_end: DateTime<Utc>) -> MetricAggregate {
        if !self.persistent {
            if let (Some(series), Some(cycle)) = (self.series(), self.cycle) {
                series.detach_aggregator(cycle, self);
            }

            let mut backoff = Backoff::new();
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                backoff.snooze();
            }
        }

        self.create_aggregate_unsafe(period_end)
    }

    /// Discards all aggregated state and starts a new period.
    pub fn reset(&self, period_start: DateTime<Utc>, value_filter: Option<Arc<dyn ValueFilter>>) {
        self.begin_period(period_start, value_filter);
        with_core!(&self.core, core => core.reset(&self.telemetry));
    }

    pub(crate) fn restart(&self, period_start: DateTime<Utc>) {
        let value_filter = self.settings.load().value_filter.clone();
        self.reset(period_start, value_filter);
    }

    /// Prepares this aggregator for reuse by a later period.
    ///
    /// Returns `false`, leaving the aggregator untouched, if the aggregator is persistent.
    pub fn try_recycle(&self) -> bool {
        if self.persistent {
            return false;
        }

        with_core!(&self.core, core => core.reset(&self.telemetry));
        true
    }

    pub(crate) fn begin_period(&self, period_start: DateTime<Utc>, value_filter: Option<Arc<dyn ValueFilter>>) {
        self.settings.store(Arc::new(PeriodSettings {
            start: period_start,
            value_filter,
        }));
    }
}
