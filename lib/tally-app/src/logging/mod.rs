//! Logging.

use snafu::{ResultExt as _, Snafu};
use tally_config::ConfigurationError;
use tracing_subscriber::{
    filter::ParseError,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
    Layer, Registry,
};

mod config;
pub use self::config::LoggingConfiguration;

/// A logging error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum LoggingError {
    /// The logging configuration could not be read.
    #[snafu(display("Failed to read logging configuration."))]
    Configuration {
        /// Error source.
        source: ConfigurationError,
    },

    /// The configured log level was not a valid set of filtering directives.
    #[snafu(display("Invalid log level '{}'.", level))]
    InvalidLogLevel {
        /// The configured level.
        level: String,

        /// Error source.
        source: ParseError,
    },

    /// A global subscriber was already installed.
    #[snafu(display("Logging subsystem was already initialized."))]
    AlreadyInitialized {
        /// Error source.
        source: TryInitError,
    },
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// The filtering directives come from `log_level` (default `info`). When `log_format_json` is set, events are written
/// to standard output as flattened JSON objects; otherwise they are written in a compact, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), LoggingError> {
    let output_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json() {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(true)
            .with_target(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(output_layer.with_filter(config.env_filter()))
        .try_init()
        .context(AlreadyInitialized)
}
