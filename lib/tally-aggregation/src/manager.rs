//! Aggregation cycles.
//!
//! Every series is aggregated by up to three independent cycles. The default cycle always runs, and is completed once
//! a minute by the [`AggregationPeriodCycle`][crate::AggregationPeriodCycle] scheduler. The quick pulse and custom
//! cycles are started, cycled, and stopped on demand by whoever consumes them.
//!
//! Each running cycle owns the collection of aggregators of its current period. Cycling a cycle swaps in a fresh
//! period, seals the collection of the old one, and completes every aggregator in it. Persistent aggregators do not
//! belong to any one cycle: they live in a single collection for the lifetime of the manager, and every cycle reports
//! on them when it completes.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;

use crate::{
    aggregator::SeriesAggregator,
    collection::AggregatorCollection,
    config::{AggregationConfiguration, SeriesConfiguration},
    cycle::{Clock, SystemClock},
    error::{CycleError, NotControllable},
    filter::{consult_series_filter, SeriesFilter, SeriesFilterDecision},
    series::{MetricSeries, SeriesIdentity, SeriesInner},
    summary::AggregationPeriodSummary,
    telemetry::Telemetry,
};

/// An aggregation cycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CycleKind {
    /// The always-running cycle, completed by the scheduler.
    Default,

    /// A short-lived cycle for live views, controlled by its consumer.
    QuickPulse,

    /// A cycle controlled entirely by its consumer.
    Custom,
}

impl CycleKind {
    pub(crate) const COUNT: usize = 3;

    /// Every cycle kind.
    pub const ALL: [CycleKind; Self::COUNT] = [Self::Default, Self::QuickPulse, Self::Custom];

    /// Returns the name of this cycle kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::QuickPulse => "quick_pulse",
            Self::Custom => "custom",
        }
    }

    /// Returns `true` if this cycle can be started and stopped on demand.
    pub const fn is_controllable(&self) -> bool {
        !matches!(self, Self::Default)
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::Default => 0,
            Self::QuickPulse => 1,
            Self::Custom => 2,
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of adding an aggregator to a cycle.
pub(crate) enum Admission {
    Added,

    /// The series filter of the given period rejected the series.
    Rejected(u64),

    Inactive,
}

struct CycleState {
    generation: u64,
    start: DateTime<Utc>,
    filter: Option<Arc<dyn SeriesFilter>>,
    aggregators: AggregatorCollection,
}

/// Tracks the aggregators of every aggregation cycle, and completes them.
pub struct AggregationManager {
    cycles: [ArcSwapOption<CycleState>; CycleKind::COUNT],
    persistent: AggregatorCollection,
    generations: AtomicU64,
    clock: Arc<dyn Clock>,
    buffer_capacity: usize,
    telemetry: Arc<Telemetry>,
}

impl AggregationManager {
    /// Creates a new `AggregationManager` using the system clock.
    ///
    /// The default cycle starts immediately.
    pub fn new(config: &AggregationConfiguration) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a new `AggregationManager` using the given clock.
    pub fn with_clock(config: &AggregationConfiguration, clock: Arc<dyn Clock>) -> Self {
        let manager = Self {
            cycles: std::array::from_fn(|_| ArcSwapOption::empty()),
            persistent: AggregatorCollection::new(),
            generations: AtomicU64::new(1),
            clock,
            buffer_capacity: config.buffer_capacity(),
            telemetry: Arc::new(Telemetry::new()),
        };

        let default_state = manager.new_state(manager.now(), None);
        manager.cycles[CycleKind::Default.index()].store(Some(default_state));
        manager
    }

    /// Returns the clock of this manager.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the current time, according to the clock of this manager.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates a new series aggregated by this manager.
    pub fn create_series<N, I>(
        self: &Arc<Self>, namespace: N, metric_id: I, dimensions: IndexMap<String, String>,
        config: SeriesConfiguration,
    ) -> MetricSeries
    where
        N: Into<String>,
        I: Into<String>,
    {
        let identity = Arc::new(SeriesIdentity::new(namespace, metric_id, dimensions));
        MetricSeries::new(identity, config, Arc::clone(self))
    }

    /// Returns `true` if the given cycle is running.
    pub fn is_cycle_active(&self, kind: CycleKind) -> bool {
        self.cycles[kind.index()].load().is_some()
    }

    /// Starts the given cycle, with its first period beginning at `start`.
    ///
    /// Returns `false` if the cycle was already running, in which case the filter is ignored.
    ///
    /// # Errors
    ///
    /// If the cycle is the default cycle, which is always running, an error is returned.
    pub fn start_aggregators(
        &self, kind: CycleKind, start: DateTime<Utc>, filter: Option<Arc<dyn SeriesFilter>>,
    ) -> Result<bool, CycleError> {
        ensure_controllable(kind)?;

        let previous = self.cycles[kind.index()]
            .compare_and_swap(&None::<Arc<CycleState>>, Some(self.new_state(start, filter)));
        let started = previous.is_none();
        if started {
            debug!(cycle = %kind, "Started aggregation cycle.");
        }
        Ok(started)
    }

    /// Completes the current period of the given cycle, and begins the next period at `tact`.
    ///
    /// The new period aggregates series accepted by `new_filter`. The summary of the completed period includes every
    /// persistent aggregator whose series was accepted by the filter of the completed period, and every aggregator of
    /// the completed period. If the cycle is not running, the summary is empty.
    pub fn cycle_aggregators(
        &self, kind: CycleKind, tact: DateTime<Utc>, new_filter: Option<Arc<dyn SeriesFilter>>,
    ) -> Result<AggregationPeriodSummary, CycleError> {
        let previous = self.cycles[kind.index()].rcu(|current| {
            current
                .as_ref()
                .map(|_| self.new_state(tact, new_filter.clone()))
        });

        Ok(match previous {
            Some(state) => self.complete_period(kind, &state, tact),
            None => AggregationPeriodSummary::empty(),
        })
    }

    /// Completes the current period of the given cycle, and stops the cycle.
    ///
    /// Stopping a cycle that is not running returns an empty summary.
    ///
    /// # Errors
    ///
    /// If the cycle is the default cycle, which is always running, an error is returned.
    pub fn stop_aggregators(&self, kind: CycleKind, tact: DateTime<Utc>) -> Result<AggregationPeriodSummary, CycleError> {
        ensure_controllable(kind)?;

        Ok(match self.cycles[kind.index()].swap(None) {
            Some(state) => {
                let summary = self.complete_period(kind, &state, tact);
                debug!(cycle = %kind, "Stopped aggregation cycle.");
                summary
            }
            None => AggregationPeriodSummary::empty(),
        })
    }

    /// Adds an aggregator to the current period of the given cycle.
    ///
    /// Persistent aggregators are added to the persistent collection regardless of the cycle. Otherwise, the series
    /// filter of the cycle is consulted, and the aggregator begins the current period with the value filter it
    /// returns.
    ///
    /// Returns `false` if the cycle is not running, or if the series filter rejected the series of the aggregator.
    pub fn add_aggregator(&self, aggregator: &Arc<SeriesAggregator>, kind: CycleKind) -> bool {
        matches!(self.admit(aggregator, kind), Admission::Added)
    }

    pub(crate) fn admit(&self, aggregator: &Arc<SeriesAggregator>, kind: CycleKind) -> Admission {
        if aggregator.is_persistent() {
            self.persistent.add(Arc::clone(aggregator));
            return Admission::Added;
        }

        loop {
            let Some(state) = self.cycles[kind.index()].load_full() else {
                return Admission::Inactive;
            };

            let value_filter = match state.filter.as_deref() {
                None => None,
                Some(filter) => {
                    let Some(series) = aggregator.series() else {
                        return Admission::Inactive;
                    };
                    match consult_series_filter(filter, &series, &self.telemetry) {
                        SeriesFilterDecision::Accept(value_filter) => value_filter,
                        SeriesFilterDecision::Reject => return Admission::Rejected(state.generation),
                    }
                }
            };

            aggregator.begin_period(state.start, value_filter);
            if state.aggregators.add(Arc::clone(aggregator)) {
                return Admission::Added;
            }

            // The period ended while we were adding to it, so try again with the next one.
        }
    }

    pub(crate) fn active_generation(&self, kind: CycleKind) -> Option<u64> {
        self.cycles[kind.index()].load().as_ref().map(|state| state.generation)
    }

    pub(crate) fn new_aggregator(
        &self, config: &SeriesConfiguration, identity: Arc<SeriesIdentity>, series: Weak<SeriesInner>,
        cycle: Option<CycleKind>,
    ) -> SeriesAggregator {
        SeriesAggregator::new(
            config,
            identity,
            series,
            cycle,
            self.now(),
            self.buffer_capacity,
            Arc::clone(&self.telemetry),
        )
    }

    pub(crate) fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    fn new_state(&self, start: DateTime<Utc>, filter: Option<Arc<dyn SeriesFilter>>) -> Arc<CycleState> {
        Arc::new(CycleState {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            start,
            filter,
            aggregators: AggregatorCollection::new(),
        })
    }

    fn complete_period(&self, kind: CycleKind, state: &CycleState, tact: DateTime<Utc>) -> AggregationPeriodSummary {
        let completed = state.aggregators.seal();

        let persistent = self
            .persistent
            .snapshot()
            .iter()
            .filter(|aggregator| self.passes_filter(state.filter.as_deref(), aggregator))
            .map(|aggregator| aggregator.complete_aggregation(tact))
            .collect::<Vec<_>>();

        let non_persistent = completed
            .iter()
            .map(|aggregator| aggregator.complete_aggregation(tact))
            .collect::<Vec<_>>();

        self.recycle(kind, completed);

        let summary = AggregationPeriodSummary::new(persistent, non_persistent);
        self.telemetry.aggregates_emitted().increment(summary.len() as u64);
        self.telemetry.cycles_completed(kind).increment(1);
        debug!(
            cycle = %kind,
            persistent = summary.persistent_aggregates().len(),
            non_persistent = summary.non_persistent_aggregates().len(),
            "Completed aggregation period."
        );

        summary
    }

    fn passes_filter(&self, filter: Option<&dyn SeriesFilter>, aggregator: &SeriesAggregator) -> bool {
        match (filter, aggregator.series()) {
            (Some(filter), Some(series)) => consult_series_filter(filter, &series, &self.telemetry).is_accept(),
            _ => true,
        }
    }

    fn recycle(&self, kind: CycleKind, aggregators: Vec<Arc<SeriesAggregator>>) {
        for aggregator in aggregators {
            // Anything still holding the aggregator could track values into it after it was reset.
            if Arc::strong_count(&aggregator) != 1 {
                continue;
            }

            let Some(series) = aggregator.series() else {
                continue;
            };

            if aggregator.try_recycle() && series.offer_spare(kind, aggregator) {
                self.telemetry.aggregators_recycled().increment(1);
            }
        }
    }
}

fn ensure_controllable(kind: CycleKind) -> Result<(), CycleError> {
    if kind.is_controllable() {
        Ok(())
    } else {
        NotControllable { kind }.fail()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use chrono::TimeZone as _;
    use metrics::with_local_recorder;
    use metrics_util::debugging::DebuggingRecorder;

    use super::*;
    use crate::{aggregate::MetricAggregate, telemetry::get_counter_value};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn manager() -> Arc<AggregationManager> {
        Arc::new(AggregationManager::new(&AggregationConfiguration::with_defaults().with_buffer_capacity(8)))
    }

    fn series(manager: &Arc<AggregationManager>, metric_id: &str, config: SeriesConfiguration) -> MetricSeries {
        manager.create_series("test", metric_id, IndexMap::new(), config)
    }

    fn metric_ids(aggregates: &[MetricAggregate]) -> Vec<&str> {
        aggregates.iter().map(MetricAggregate::metric_id).collect()
    }

    fn only(metric_id: &'static str) -> Arc<dyn SeriesFilter> {
        Arc::new(move |series: &MetricSeries| {
            if series.identity().metric_id() == metric_id {
                SeriesFilterDecision::accept_all()
            } else {
                SeriesFilterDecision::Reject
            }
        })
    }

    #[test]
    fn default_cycle_is_not_controllable() {
        let manager = manager();
        assert!(manager.is_cycle_active(CycleKind::Default));

        assert!(matches!(
            manager.start_aggregators(CycleKind::Default, at(0), None),
            Err(CycleError::NotControllable {
                kind: CycleKind::Default
            })
        ));
        assert!(matches!(
            manager.stop_aggregators(CycleKind::Default, at(0)),
            Err(CycleError::NotControllable { .. })
        ));
        assert!(manager.cycle_aggregators(CycleKind::Default, at(1), None).is_ok());
    }

    #[test]
    fn start_is_a_noop_when_running() {
        let manager = manager();
        assert!(!manager.is_cycle_active(CycleKind::Custom));
        assert!(manager.start_aggregators(CycleKind::Custom, at(0), None).unwrap());
        assert!(!manager.start_aggregators(CycleKind::Custom, at(0), None).unwrap());
        assert!(manager.is_cycle_active(CycleKind::Custom));
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = manager();
        let requests = series(&manager, "requests", SeriesConfiguration::measurement());
        manager.start_aggregators(CycleKind::QuickPulse, at(0), None).unwrap();
        requests.track_value(1).unwrap();

        let first = manager.stop_aggregators(CycleKind::QuickPulse, at(1)).unwrap();
        assert_eq!(metric_ids(first.non_persistent_aggregates()), ["requests"]);
        assert!(!manager.is_cycle_active(CycleKind::QuickPulse));

        let second = manager.stop_aggregators(CycleKind::QuickPulse, at(2)).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn cycling_inactive_cycle_is_empty() {
        let manager = manager();
        let summary = manager.cycle_aggregators(CycleKind::Custom, at(1), None).unwrap();
        assert!(summary.is_empty());
        assert!(!manager.is_cycle_active(CycleKind::Custom));
    }

    #[test]
    fn cycles_are_independent() {
        let manager = manager();
        let requests = series(&manager, "requests", SeriesConfiguration::measurement());
        manager.start_aggregators(CycleKind::Custom, at(0), None).unwrap();

        for value in [1, 2, 3] {
            requests.track_value(value).unwrap();
        }

        let default = manager.cycle_aggregators(CycleKind::Default, at(1), None).unwrap();
        requests.track_value(10).unwrap();
        let custom = manager.cycle_aggregators(CycleKind::Custom, at(2), None).unwrap();

        assert_eq!(default.non_persistent_aggregates()[0].data().get("Sum"), Some(6.0));
        assert_eq!(custom.non_persistent_aggregates()[0].data().get("Sum"), Some(16.0));
        assert_eq!(custom.non_persistent_aggregates()[0].period_start(), at(0));
    }

    #[test]
    fn completed_series_starts_fresh_period() {
        let manager = manager();
        let requests = series(&manager, "requests", SeriesConfiguration::measurement());

        requests.track_value(5).unwrap();
        let first = manager.cycle_aggregators(CycleKind::Default, at(1), None).unwrap();
        assert_eq!(first.non_persistent_aggregates()[0].data().get("Count"), Some(1.0));

        requests.track_value(7).unwrap();
        let second = manager.cycle_aggregators(CycleKind::Default, at(2), None).unwrap();
        let aggregate = &second.non_persistent_aggregates()[0];
        assert_eq!(aggregate.data().get("Count"), Some(1.0));
        assert_eq!(aggregate.data().get("Sum"), Some(7.0));
        assert_eq!(aggregate.period_start(), at(1));

        let idle = manager.cycle_aggregators(CycleKind::Default, at(3), None).unwrap();
        assert!(idle.is_empty());
    }

    #[test]
    fn rejected_series_is_not_aggregated() {
        let manager = manager();
        let kept = series(&manager, "kept", SeriesConfiguration::gauge());
        let dropped = series(&manager, "dropped", SeriesConfiguration::gauge());
        manager.start_aggregators(CycleKind::Custom, at(0), Some(only("kept"))).unwrap();

        kept.track_value(1).unwrap();
        dropped.track_value(1).unwrap();
        dropped.track_value(2).unwrap();

        let summary = manager.cycle_aggregators(CycleKind::Custom, at(1), None).unwrap();
        assert_eq!(metric_ids(summary.non_persistent_aggregates()), ["kept"]);

        // The next period has no filter.
        dropped.track_value(3).unwrap();
        let summary = manager.cycle_aggregators(CycleKind::Custom, at(2), None).unwrap();
        assert_eq!(metric_ids(summary.non_persistent_aggregates()), ["dropped"]);
    }

    #[test]
    fn persistent_series_uses_old_filter_on_transition() {
        let manager = manager();
        let lifetime = series(
            &manager,
            "lifetime",
            SeriesConfiguration::measurement().with_persistence(true),
        );
        manager.start_aggregators(CycleKind::Custom, at(0), Some(only("lifetime"))).unwrap();
        lifetime.track_value(1).unwrap();

        // The new filter excludes the series, but the period that just ended still reports it.
        let summary = manager
            .cycle_aggregators(CycleKind::Custom, at(1), Some(only("other")))
            .unwrap();
        assert_eq!(metric_ids(summary.persistent_aggregates()), ["lifetime"]);
        assert!(summary.non_persistent_aggregates().is_empty());

        let summary = manager.cycle_aggregators(CycleKind::Custom, at(2), None).unwrap();
        assert!(summary.persistent_aggregates().is_empty());
    }

    #[test]
    fn persistent_aggregates_cover_lifetime() {
        let manager = manager();
        let lifetime = series(
            &manager,
            "lifetime",
            SeriesConfiguration::measurement().with_persistence(true),
        );

        let mut counts = Vec::new();
        for minute in 1..=3 {
            lifetime.track_value(minute).unwrap();
            let summary = manager.cycle_aggregators(CycleKind::Default, at(minute), None).unwrap();
            assert_eq!(summary.persistent_aggregates().len(), 1);
            counts.push(summary.persistent_aggregates()[0].data().get("Count").unwrap());
        }

        assert_eq!(counts, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn completed_aggregators_are_recycled() {
        let manager = manager();
        let requests = series(&manager, "requests", SeriesConfiguration::measurement());

        requests.track_value(1).unwrap();
        let first = requests.aggregator(CycleKind::Default).unwrap();
        let first_ptr = Arc::as_ptr(&first);
        drop(first);

        manager.cycle_aggregators(CycleKind::Default, at(1), None).unwrap();
        assert!(requests.aggregator(CycleKind::Default).is_none());

        requests.track_value(2).unwrap();
        let second = requests.aggregator(CycleKind::Default).unwrap();
        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert_eq!(second.create_aggregate_unsafe(at(2)).data().get("Count"), Some(1.0));
    }

    #[test]
    fn telemetry_counts_cycles_and_aggregates() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        // Counters are registered when the manager is created, so they stay attached to our local recorder:
        let manager = with_local_recorder(&recorder, manager);

        let requests = series(&manager, "requests", SeriesConfiguration::whole_number_measurement());
        requests.track_value(1).unwrap();
        assert!(requests.track_value(-1).is_err());
        manager.cycle_aggregators(CycleKind::Default, at(1), None).unwrap();

        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(
            get_counter_value(&metrics, "tally_aggregation_cycles_completed_total", Some("default")),
            1
        );
        assert_eq!(get_counter_value(&metrics, "tally_aggregation_aggregates_emitted_total", None), 1);
        assert_eq!(get_counter_value(&metrics, "tally_aggregation_invalid_values_total", None), 1);
    }

    struct Unavailable;

    impl SeriesFilter for Unavailable {
        fn will_consume(&self, _: &MetricSeries) -> Result<SeriesFilterDecision, crate::GenericError> {
            Err(anyhow::anyhow!("filter backend unavailable"))
        }
    }

    fn assert_broken_filter_accepts(filter: Arc<dyn SeriesFilter>) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let manager = with_local_recorder(&recorder, manager);

        let requests = series(&manager, "requests", SeriesConfiguration::measurement());
        let lifetime = series(
            &manager,
            "lifetime",
            SeriesConfiguration::measurement().with_persistence(true),
        );
        manager.start_aggregators(CycleKind::Custom, at(0), Some(filter)).unwrap();

        // Admitting `requests` consults the filter once, and so does completing the period for `lifetime`.
        for value in [2, 3] {
            requests.track_value(value).unwrap();
            lifetime.track_value(value).unwrap();
        }
        let summary = manager.cycle_aggregators(CycleKind::Custom, at(1), None).unwrap();

        assert_eq!(metric_ids(summary.non_persistent_aggregates()), ["requests"]);
        assert_eq!(summary.non_persistent_aggregates()[0].data().get("Sum"), Some(5.0));
        assert_eq!(metric_ids(summary.persistent_aggregates()), ["lifetime"]);

        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(get_counter_value(&metrics, "tally_aggregation_filter_errors_total", None), 2);
    }

    #[test]
    fn failing_series_filter_accepts() {
        assert_broken_filter_accepts(Arc::new(Unavailable));
    }

    #[test]
    fn panicking_series_filter_accepts() {
        assert_broken_filter_accepts(Arc::new(|series: &MetricSeries| -> SeriesFilterDecision {
            panic!("cannot filter {}", series.identity())
        }));
    }
}
