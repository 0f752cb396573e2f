//! Aggregation period scheduling.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, DurationRound as _, TimeDelta, Utc};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AggregationConfiguration,
    manager::{AggregationManager, CycleKind},
    pipeline::MetricAggregateConsumer,
    summary::AggregationPeriodSummary,
    telemetry::Telemetry,
};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Computes when the scheduler should next wake up.
///
/// The target is `offset` past the start of the current minute. If that leaves less than `min_wait` to wait, the
/// target moves out by one more minute, so that a tick never completes a period much shorter than a minute.
pub fn next_wake_time(now: DateTime<Utc>, offset: Duration, min_wait: Duration) -> DateTime<Utc> {
    let minute = TimeDelta::minutes(1);
    let minute_start = now.duration_trunc(minute).unwrap_or(now);
    let offset = TimeDelta::from_std(offset).unwrap_or(minute);
    let min_wait = TimeDelta::from_std(min_wait).unwrap_or(TimeDelta::zero());

    let target = minute_start + offset;
    if target - now < min_wait {
        target + minute
    } else {
        target
    }
}

/// State of an [`AggregationPeriodCycle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerState {
    /// The scheduler has not been started yet.
    NotStarted,

    /// The scheduler is running.
    Running,

    /// The scheduler has been stopped, and cannot be started again.
    Stopped,
}

impl SchedulerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Stopped => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Completes the default aggregation cycle about once a minute, and hands each summary to a consumer.
///
/// Ticks land `cycle_offset` past the start of a minute, unless that is closer than `cycle_min_wait`, in which case the
/// tick moves out by a minute. Each tick completes the default cycle at the time of the tick, which also begins the
/// next period. Non-empty summaries are forwarded to the consumer on a separate task, so a slow consumer never delays
/// the next tick.
pub struct AggregationPeriodCycle {
    manager: Arc<AggregationManager>,
    consumer: Arc<dyn MetricAggregateConsumer>,
    cycle_offset: Duration,
    cycle_min_wait: Duration,
    state: AtomicU8,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationPeriodCycle {
    /// Creates a new `AggregationPeriodCycle`.
    pub fn new(
        manager: Arc<AggregationManager>, consumer: Arc<dyn MetricAggregateConsumer>,
        config: &AggregationConfiguration,
    ) -> Self {
        Self {
            manager,
            consumer,
            cycle_offset: config.cycle_offset(),
            cycle_min_wait: config.cycle_min_wait(),
            state: AtomicU8::new(SchedulerState::NotStarted.as_u8()),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Starts the scheduler on the given runtime.
    ///
    /// Returns `false` if the scheduler was already started, or has been stopped.
    pub fn start(&self, handle: &Handle) -> bool {
        if self
            .state
            .compare_exchange(
                SchedulerState::NotStarted.as_u8(),
                SchedulerState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let worker = Worker {
            manager: Arc::clone(&self.manager),
            consumer: Arc::clone(&self.consumer),
            cycle_offset: self.cycle_offset,
            cycle_min_wait: self.cycle_min_wait,
            shutdown: self.shutdown.clone(),
            handle: handle.clone(),
        };
        let join_handle = handle.spawn(worker.run());
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(join_handle);

        true
    }

    /// Stops the scheduler, waiting for the worker to exit.
    ///
    /// A tick in progress runs to completion. Summaries already handed to the consumer are still being forwarded when
    /// this returns, and observe the cancellation.
    ///
    /// Returns `false` if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let previous = SchedulerState::from_u8(self.state.swap(SchedulerState::Stopped.as_u8(), Ordering::AcqRel));
        self.shutdown.cancel();
        if previous != SchedulerState::Running {
            return false;
        }

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Aggregation period cycle worker failed.");
            }
        }

        true
    }
}

impl Drop for AggregationPeriodCycle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    manager: Arc<AggregationManager>,
    consumer: Arc<dyn MetricAggregateConsumer>,
    cycle_offset: Duration,
    cycle_min_wait: Duration,
    shutdown: CancellationToken,
    handle: Handle,
}

impl Worker {
    async fn run(self) {
        info!(
            offset = ?self.cycle_offset,
            min_wait = ?self.cycle_min_wait,
            "Aggregation period cycle started."
        );

        loop {
            let now = self.manager.now();
            let wake_at = next_wake_time(now, self.cycle_offset, self.cycle_min_wait);
            let wait = (wake_at - now).to_std().unwrap_or_default();
            debug!(%wake_at, "Waiting for next aggregation tick.");

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.tick();
        }

        info!("Aggregation period cycle stopped.");
    }

    fn tick(&self) {
        let tact = self.manager.now();
        match self.manager.cycle_aggregators(CycleKind::Default, tact, None) {
            Ok(summary) if !summary.is_empty() => {
                let consumer = Arc::clone(&self.consumer);
                let telemetry = Arc::clone(self.manager.telemetry());
                let shutdown = self.shutdown.clone();
                self.handle
                    .spawn(async move { forward_summary(consumer, summary, &telemetry, &shutdown).await });
            }
            Ok(_) => debug!(%tact, "No aggregates in completed period."),
            Err(e) => error!(error = %e, "Failed to complete default aggregation cycle."),
        }
    }
}

pub(crate) async fn forward_summary(
    consumer: Arc<dyn MetricAggregateConsumer>, summary: AggregationPeriodSummary, telemetry: &Telemetry,
    shutdown: &CancellationToken,
) {
    for aggregate in summary.into_aggregates() {
        if let Err(e) = consumer.track(aggregate, shutdown).await {
            warn!(error = %e, "Consumer failed to accept aggregate.");
            telemetry.consumer_errors().increment(1);
        }
    }

    if let Err(e) = consumer.flush(shutdown).await {
        warn!(error = %e, "Consumer failed to flush.");
        telemetry.consumer_errors().increment(1);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone as _;
    use indexmap::IndexMap;
    use metrics::with_local_recorder;
    use metrics_util::debugging::DebuggingRecorder;

    use super::*;
    use crate::{
        aggregate::MetricAggregate, config::SeriesConfiguration, error::GenericError, pipeline::MemoryPipeline,
        telemetry::get_counter_value,
    };

    const OFFSET: Duration = Duration::from_secs(61);
    const MIN_WAIT: Duration = Duration::from_secs(20);

    fn time(minute: u32, second: u32, millis: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, second).unwrap() + TimeDelta::milliseconds(millis.into())
    }

    /// Wall clock that follows Tokio's (possibly paused) clock.
    struct RuntimeClock {
        base: DateTime<Utc>,
        origin: tokio::time::Instant,
    }

    impl RuntimeClock {
        fn starting_at(base: DateTime<Utc>) -> Self {
            Self {
                base,
                origin: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for RuntimeClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + TimeDelta::from_std(self.origin.elapsed()).unwrap()
        }
    }

    #[test]
    fn wake_time_is_one_second_past_next_minute() {
        assert_eq!(next_wake_time(time(0, 5, 0), OFFSET, MIN_WAIT), time(1, 1, 0));
        assert_eq!(next_wake_time(time(0, 40, 0), OFFSET, MIN_WAIT), time(1, 1, 0));
        assert_eq!(next_wake_time(time(1, 1, 0), OFFSET, MIN_WAIT), time(2, 1, 0));
    }

    #[test]
    fn wake_time_skips_a_minute_when_too_close() {
        assert_eq!(next_wake_time(time(0, 59, 500), OFFSET, MIN_WAIT), time(2, 1, 0));
        assert_eq!(next_wake_time(time(0, 41, 1), OFFSET, MIN_WAIT), time(2, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_forward_summaries() {
        let clock = Arc::new(RuntimeClock::starting_at(time(0, 5, 0)));
        let config = AggregationConfiguration::with_defaults();
        let manager = Arc::new(AggregationManager::with_clock(&config, clock));
        let pipeline = Arc::new(MemoryPipeline::new(16));
        let cycle = AggregationPeriodCycle::new(Arc::clone(&manager), pipeline.clone(), &config);

        let series = manager.create_series("app", "latency", IndexMap::new(), SeriesConfiguration::measurement());
        series.track_value(3).unwrap();
        series.track_value(5).unwrap();

        assert!(cycle.start(&Handle::current()));
        assert!(!cycle.start(&Handle::current()));
        assert_eq!(cycle.state(), SchedulerState::Running);

        // The first tick lands at 12:01:01, 56 seconds in.
        tokio::time::sleep(Duration::from_secs(57)).await;

        let aggregates = pipeline.drain();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].data().get("Sum"), Some(8.0));
        assert_eq!(aggregates[0].period_start(), time(0, 5, 0));
        assert_eq!(aggregates[0].period_duration(), Duration::from_secs(56));
        assert_eq!(pipeline.flush_count(), 1);

        // Nothing was tracked during the second period, so nothing is forwarded.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.flush_count(), 1);

        series.track_value(1).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let aggregates = pipeline.drain();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].period_start(), time(2, 1, 0));

        assert!(cycle.stop().await);
        assert!(!cycle.stop().await);
        assert_eq!(cycle.state(), SchedulerState::Stopped);
        assert!(!cycle.start(&Handle::current()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick() {
        let clock = Arc::new(RuntimeClock::starting_at(time(0, 5, 0)));
        let config = AggregationConfiguration::with_defaults();
        let manager = Arc::new(AggregationManager::with_clock(&config, clock));
        let pipeline = Arc::new(MemoryPipeline::new(16));
        let cycle = AggregationPeriodCycle::new(Arc::clone(&manager), pipeline.clone(), &config);

        manager
            .create_series("app", "latency", IndexMap::new(), SeriesConfiguration::gauge())
            .track_value(1)
            .unwrap();

        assert!(cycle.start(&Handle::current()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cycle.stop().await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(pipeline.is_empty());
    }

    /// Refuses aggregates of one metric, and keeps everything else.
    struct Refusing {
        metric_id: &'static str,
        inner: MemoryPipeline,
    }

    #[async_trait]
    impl MetricAggregateConsumer for Refusing {
        async fn track(&self, aggregate: MetricAggregate, cancel: &CancellationToken) -> Result<(), GenericError> {
            if aggregate.metric_id() == self.metric_id {
                anyhow::bail!("refusing {}", aggregate.metric_id());
            }
            self.inner.track(aggregate, cancel).await
        }

        async fn flush(&self, cancel: &CancellationToken) -> Result<(), GenericError> {
            self.inner.flush(cancel).await
        }
    }

    #[tokio::test]
    async fn consumer_errors_do_not_stop_forwarding() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let manager = with_local_recorder(&recorder, || {
            Arc::new(AggregationManager::new(&AggregationConfiguration::with_defaults()))
        });

        let series = ["before", "refused", "after"]
            .into_iter()
            .map(|metric_id| manager.create_series("app", metric_id, IndexMap::new(), SeriesConfiguration::gauge()))
            .collect::<Vec<_>>();
        for series in &series {
            series.track_value(1).unwrap();
        }

        let consumer = Arc::new(Refusing {
            metric_id: "refused",
            inner: MemoryPipeline::new(16),
        });
        let summary = manager
            .cycle_aggregators(CycleKind::Default, manager.now(), None)
            .unwrap();
        forward_summary(consumer.clone(), summary, manager.telemetry(), &CancellationToken::new()).await;

        let mut forwarded = consumer
            .inner
            .drain()
            .iter()
            .map(|aggregate| aggregate.metric_id().to_string())
            .collect::<Vec<_>>();
        forwarded.sort();
        assert_eq!(forwarded, ["after", "before"]);
        assert_eq!(consumer.inner.flush_count(), 1);

        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(get_counter_value(&metrics, "tally_aggregation_consumer_errors_total", None), 1);
    }
}
