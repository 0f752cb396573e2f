//! In-process metric aggregation.
//!
//! Application code tracks raw values on [`MetricSeries`], from any number of threads, without taking a lock. Each
//! series feeds one [`SeriesAggregator`] per running aggregation cycle, which buffers values and folds them into running
//! statistics. An [`AggregationManager`] completes aggregation periods on demand, producing an
//! [`AggregationPeriodSummary`] of immutable [`MetricAggregate`] snapshots, while the [`AggregationPeriodCycle`]
//! completes the default cycle about once a minute and hands each summary to a [`MetricAggregateConsumer`].
//!
//! [`MetricManager`] ties these together for applications, and hands out dimensioned [`Metric`] families.
#![deny(missing_docs)]

mod sync;

mod aggregate;
pub use self::aggregate::{AggregateData, AggregationKind, MetricAggregate};

mod aggregator;
pub use self::aggregator::SeriesAggregator;

mod buffer;
pub use self::buffer::{SlotValue, ValuesBuffer, DEFAULT_BUFFER_CAPACITY};

mod collection;

pub mod collections;

mod config;
pub use self::config::{AggregationConfiguration, SeriesConfiguration, SeriesKind};

mod cycle;
pub use self::cycle::{next_wake_time, AggregationPeriodCycle, Clock, SchedulerState, SystemClock};

mod error;
pub use self::error::{CycleError, GenericError, MetricError, PipelineError, SettingsError, TrackValueError};

mod filter;
pub use self::filter::{SeriesFilter, SeriesFilterDecision, ValueFilter};

mod manager;
pub use self::manager::{AggregationManager, CycleKind};

mod metric;
pub use self::metric::Metric;

mod metric_manager;
pub use self::metric_manager::{default_manager, reset_default_manager, set_default_manager, MetricManager};

pub mod pipeline;
pub use self::pipeline::MetricAggregateConsumer;

mod series;
pub use self::series::{MetricSeries, SeriesIdentity};

mod summary;
pub use self::summary::AggregationPeriodSummary;

mod telemetry;

mod value;
pub use self::value::TrackedValue;
