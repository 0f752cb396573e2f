//! Soak test for the aggregation subsystem.
//!
//! Runs a number of producer threads that track values on a handful of metrics as fast as they can, while the
//! scheduler completes the default cycle once a minute and a logging consumer reports on every flush. A quick pulse
//! cycle is cycled every few seconds alongside it.
//!
//! Takes an optional path to a YAML configuration file as its only argument. Settings can also be given through
//! environment variables prefixed with `TALLY_`.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng as _;
use tally_aggregation::{
    reset_default_manager, set_default_manager, AggregationConfiguration, CycleKind, GenericError, Metric,
    MetricManager, SeriesConfiguration,
};
use tally_app::prelude::*;
use tally_config::{ConfigurationLoader, GenericConfiguration};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

mod config;
use self::config::SoakConfiguration;

mod consumer;
use self::consumer::LoggingConsumer;

const QUICK_PULSE_INTERVAL: Duration = Duration::from_secs(5);

struct SoakMetrics {
    latency: Arc<Metric>,
    queue_depth: Arc<Metric>,
    users: Arc<Metric>,
    requests: Arc<Metric>,
}

#[tokio::main]
async fn main() {
    let configuration = load_configuration().unwrap_or_else(|e| fatal_and_exit(format!("{:?}", e)));

    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to read logging configuration: {}", e)));
    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(configuration).await {
        Ok(()) => info!("tally-soak stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration() -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = std::env::args().nth(1) {
        loader = loader.from_yaml(path)?;
    }
    Ok(loader.from_environment("TALLY")?.into_generic())
}

async fn run(configuration: GenericConfiguration) -> Result<(), GenericError> {
    let aggregation_config = AggregationConfiguration::from_configuration(&configuration)?;
    let soak_config = SoakConfiguration::from_configuration(&configuration)?;
    info!(
        producers = soak_config.producers(),
        duration = ?soak_config.duration(),
        buffer_capacity = aggregation_config.buffer_capacity(),
        "tally-soak starting..."
    );

    let consumer = Arc::new(LoggingConsumer::default());
    let manager = MetricManager::new(consumer.clone(), aggregation_config, &Handle::current());
    set_default_manager(Arc::clone(&manager));

    let metrics = Arc::new(SoakMetrics {
        latency: manager.metric(
            "soak",
            "request_latency_ms",
            &["producer", "host"],
            SeriesConfiguration::whole_number_measurement(),
        )?,
        queue_depth: manager.metric("soak", "queue_depth", &["producer"], SeriesConfiguration::gauge())?,
        users: manager.metric("soak", "active_users", &[], SeriesConfiguration::naive_distinct_count(false))?,
        requests: manager.metric(
            "soak",
            "lifetime_requests",
            &[],
            SeriesConfiguration::measurement().with_persistence(true),
        )?,
    });

    let stop = Arc::new(AtomicBool::new(false));
    let producers = (0..soak_config.producers())
        .map(|id| {
            let metrics = Arc::clone(&metrics);
            let stop = Arc::clone(&stop);
            let (hosts, users) = (soak_config.hosts(), soak_config.users());
            tokio::task::spawn_blocking(move || produce(id, &metrics, hosts, users, &stop))
        })
        .collect::<Vec<_>>();

    let started = Instant::now();
    let deadline = tokio::time::sleep(soak_config.duration());
    tokio::pin!(deadline);
    let mut quick_pulse = tokio::time::interval(QUICK_PULSE_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal.");
                }
                info!("Received shutdown signal.");
                break;
            }
            _ = quick_pulse.tick() => {
                let tact = manager.aggregation_manager().now();
                let summary = manager.start_or_cycle_aggregators(CycleKind::QuickPulse, tact, None)?;
                info!(aggregates = summary.len(), "Completed quick pulse period.");
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let mut tracked = 0;
    for producer in producers {
        tracked += producer.await??;
    }
    let elapsed = started.elapsed();

    let tact = manager.aggregation_manager().now();
    manager.stop_aggregators(CycleKind::QuickPulse, tact)?;
    manager.stop().await;
    reset_default_manager();

    info!(
        tracked,
        elapsed = ?elapsed,
        values_per_sec = tracked as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        aggregates = consumer.total(),
        flushes = consumer.flushes(),
        "Soak test complete."
    );

    Ok(())
}

fn produce(
    id: usize, metrics: &SoakMetrics, hosts: usize, users: usize, stop: &AtomicBool,
) -> Result<u64, GenericError> {
    let mut rng = rand::rng();
    let producer = id.to_string();
    let hosts = (0..hosts).map(|host| format!("host-{}", host)).collect::<Vec<_>>();

    let mut tracked = 0u64;
    let mut iterations = 0u64;
    while !stop.load(Ordering::Relaxed) {
        iterations += 1;
        let host = &hosts[rng.random_range(0..hosts.len())];
        let latency = rng.random_range(1..500u32);
        metrics
            .latency
            .track_value(latency, &[producer.as_str(), host.as_str()])?;
        metrics.requests.track_value(latency, &[])?;
        metrics
            .users
            .track_value(format!("user-{}", rng.random_range(0..users)), &[])?;
        tracked += 3;

        if iterations % 1024 == 0 {
            metrics
                .queue_depth
                .track_value(rng.random_range(0..1000u32), &[producer.as_str()])?;
            tracked += 1;
            thread::yield_now();
        }
    }

    Ok(tracked)
}
