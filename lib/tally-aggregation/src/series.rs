//! Metric series.

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

use crate::{
    aggregate::MetricAggregate,
    aggregator::SeriesAggregator,
    config::SeriesConfiguration,
    error::TrackValueError,
    manager::{Admission, AggregationManager, CycleKind},
    value::TrackedValue,
};

/// Identity of a metric series: namespace, metric identifier, and dimension values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeriesIdentity {
    namespace: String,
    metric_id: String,
    dimensions: IndexMap<String, String>,
}

impl SeriesIdentity {
    /// Creates a new `SeriesIdentity`.
    pub fn new<N, I>(namespace: N, metric_id: I, dimensions: IndexMap<String, String>) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            metric_id: metric_id.into(),
            dimensions,
        }
    }

    /// Returns the metric namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the metric identifier.
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Returns the dimension values, keyed by dimension name, in the order the dimensions were declared.
    pub fn dimensions(&self) -> &IndexMap<String, String> {
        &self.dimensions
    }
}

impl fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.metric_id)?;
        if !self.dimensions.is_empty() {
            f.write_str("{")?;
            for (i, (name, value)) in self.dimensions.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}={}", name, value)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

pub(crate) struct SeriesInner {
    identity: Arc<SeriesIdentity>,
    config: SeriesConfiguration,
    manager: Arc<AggregationManager>,
    persistent: Option<Arc<SeriesAggregator>>,
    slots: [ArcSwapOption<SeriesAggregator>; CycleKind::COUNT],
    spares: [ArcSwapOption<SeriesAggregator>; CycleKind::COUNT],

    // Generation of the last period, per cycle, whose series filter rejected this series.
    rejected: [AtomicU64; CycleKind::COUNT],
}

/// A metric series.
///
/// Values tracked on a series are routed to the aggregator each running cycle has assigned to it. Aggregators are
/// assigned lazily: the first value tracked after a cycle begins a period asks the cycle to admit a new aggregator for
/// the series, which fails if the series filter of the cycle rejects the series. A persistent series instead has a
/// single aggregator, created with the series, which every cycle reports on.
///
/// `MetricSeries` is cheap to clone, and all clones refer to the same series.
#[derive(Clone)]
pub struct MetricSeries {
    inner: Arc<SeriesInner>,
}

impl MetricSeries {
    pub(crate) fn new(
        identity: Arc<SeriesIdentity>, config: SeriesConfiguration, manager: Arc<AggregationManager>,
    ) -> Self {
        let inner = Arc::new_cyclic(|series| {
            let persistent = config
                .is_persistent()
                .then(|| Arc::new(manager.new_aggregator(&config, Arc::clone(&identity), series.clone(), None)));

            SeriesInner {
                identity,
                config,
                manager,
                persistent,
                slots: std::array::from_fn(|_| ArcSwapOption::empty()),
                spares: std::array::from_fn(|_| ArcSwapOption::empty()),
                rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            }
        });

        if let Some(aggregator) = &inner.persistent {
            inner.manager.add_aggregator(aggregator, CycleKind::Default);
        }

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SeriesInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SeriesInner> {
        Arc::downgrade(&self.inner)
    }

    /// Returns the identity of this series.
    pub fn identity(&self) -> &SeriesIdentity {
        &self.inner.identity
    }

    /// Returns the configuration of this series.
    pub fn configuration(&self) -> &SeriesConfiguration {
        &self.inner.config
    }

    /// Tracks a value.
    ///
    /// The value is aggregated by every running cycle that accepts this series, or by the persistent aggregator of a
    /// persistent series. NaN values are ignored.
    ///
    /// # Errors
    ///
    /// If the value cannot be converted into the domain of the series, an error is returned.
    pub fn track_value<V>(&self, value: V) -> Result<(), TrackValueError>
    where
        V: Into<TrackedValue>,
    {
        let value = value.into();
        if let Some(aggregator) = &self.inner.persistent {
            return aggregator.track(&value);
        }

        for kind in CycleKind::ALL {
            if let Some(aggregator) = self.assigned_aggregator(kind) {
                aggregator.track(&value)?;
            }
        }
        Ok(())
    }

    /// Returns the aggregator currently aggregating this series for the given cycle, if any.
    ///
    /// For persistent series, this is always the persistent aggregator.
    pub fn aggregator(&self, kind: CycleKind) -> Option<Arc<SeriesAggregator>> {
        match &self.inner.persistent {
            Some(aggregator) => Some(Arc::clone(aggregator)),
            None => self.inner.slots[kind.index()].load_full(),
        }
    }

    /// Creates an aggregate of the values tracked so far in the current period of the given cycle.
    ///
    /// Returns `None` if no aggregator is currently assigned for the cycle. See
    /// [`SeriesAggregator::create_aggregate_unsafe`] for the consistency caveats.
    pub fn get_current_aggregate_unsafe(&self, kind: CycleKind) -> Option<MetricAggregate> {
        self.aggregator(kind)
            .map(|aggregator| aggregator.create_aggregate_unsafe(self.inner.manager.now()))
    }

    /// Discards everything aggregated so far, and restarts every assigned aggregator at `period_start`.
    ///
    /// Value filters of the current periods are kept.
    pub fn reset_aggregation(&self, period_start: DateTime<Utc>) {
        if let Some(aggregator) = &self.inner.persistent {
            aggregator.restart(period_start);
            return;
        }

        for slot in &self.inner.slots {
            if let Some(aggregator) = slot.load_full() {
                aggregator.restart(period_start);
            }
        }
    }

    fn assigned_aggregator(&self, kind: CycleKind) -> Option<Arc<SeriesAggregator>> {
        let index = kind.index();
        let slot = &self.inner.slots[index];
        if let Some(aggregator) = slot.load_full() {
            return Some(aggregator);
        }

        let generation = self.inner.manager.active_generation(kind)?;
        if self.inner.rejected[index].load(Ordering::Acquire) == generation {
            return None;
        }

        let candidate = self.inner.spares[index].swap(None).unwrap_or_else(|| {
            Arc::new(self.inner.manager.new_aggregator(
                &self.inner.config,
                Arc::clone(&self.inner.identity),
                self.downgrade(),
                Some(kind),
            ))
        });

        let previous = slot.compare_and_swap(&None::<Arc<SeriesAggregator>>, Some(Arc::clone(&candidate)));
        if let Some(assigned) = &*previous {
            // Another producer got there first.
            let assigned = Arc::clone(assigned);
            self.offer_spare(kind, candidate);
            return Some(assigned);
        }

        match self.inner.manager.admit(&candidate, kind) {
            Admission::Added => Some(candidate),
            Admission::Rejected(generation) => {
                self.inner.rejected[index].store(generation, Ordering::Release);
                self.detach_aggregator(kind, &candidate);
                None
            }
            Admission::Inactive => {
                self.detach_aggregator(kind, &candidate);
                None
            }
        }
    }

    pub(crate) fn detach_aggregator(&self, kind: CycleKind, aggregator: &Arc<SeriesAggregator>) {
        self.inner.slots[kind.index()].compare_and_swap(aggregator, None::<Arc<SeriesAggregator>>);
    }

    /// Offers a recycled aggregator for reuse by the next period of the given cycle.
    ///
    /// Returns `false`, dropping the aggregator, if a spare is already held.
    pub(crate) fn offer_spare(&self, kind: CycleKind, aggregator: Arc<SeriesAggregator>) -> bool {
        let spare = &self.inner.spares[kind.index()];
        spare
            .compare_and_swap(&None::<Arc<SeriesAggregator>>, Some(aggregator))
            .is_none()
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn detached(identity: Arc<SeriesIdentity>, config: SeriesConfiguration) -> Self {
        let manager = Arc::new(AggregationManager::new(&Default::default()));
        Self::new(identity, config, manager)
    }
}

impl fmt::Debug for MetricSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSeries")
            .field("identity", &self.inner.identity)
            .field("config", &self.inner.config)
            .finish()
    }
}
