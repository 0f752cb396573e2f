use serde::Deserialize;
use snafu::ResultExt as _;
use tally_config::GenericConfiguration;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use super::{Configuration, InvalidLogLevel, LoggingError};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
///
/// Read from the `log_level` and `log_format_json` keys, which map to `TALLY_LOG_LEVEL` and `TALLY_LOG_FORMAT_JSON`
/// when configuration is loaded from the environment with the `TALLY` prefix.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Log filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    /// Whether to emit logs as JSON.
    ///
    /// Defaults to `false`, which emits compact, human-readable lines.
    #[serde(default = "default_false")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, LoggingError> {
        config.as_typed().context(Configuration)
    }

    /// Creates a `LoggingConfiguration` with the given default level and human-readable output.
    pub fn with_level(level: LevelFilter) -> Self {
        Self {
            log_level: level.into(),
            log_format_json: false,
        }
    }

    pub(super) fn env_filter(&self) -> EnvFilter {
        self.log_level.0.clone()
    }

    pub(super) fn json(&self) -> bool {
        self.log_format_json
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = LoggingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EnvFilter::builder()
            .parse(&value)
            .map(Self)
            .context(InvalidLogLevel { level: value })
    }
}
