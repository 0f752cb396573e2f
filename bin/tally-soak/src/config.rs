use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tally_aggregation::GenericError;
use tally_config::GenericConfiguration;

const fn default_producers() -> usize {
    4
}

const fn default_duration_secs() -> u64 {
    150
}

const fn default_hosts() -> usize {
    16
}

const fn default_users() -> usize {
    5000
}

/// Soak test configuration.
#[derive(Debug, Deserialize)]
pub struct SoakConfiguration {
    /// Number of producer threads.
    #[serde(default = "default_producers")]
    producers: usize,

    /// How long producers run for.
    ///
    /// Defaults to 150 seconds, long enough for at least two scheduled ticks.
    #[serde(default = "default_duration_secs")]
    duration_secs: u64,

    /// Number of distinct hosts each producer reports on.
    #[serde(default = "default_hosts")]
    hosts: usize,

    /// Number of distinct user identifiers tracked.
    #[serde(default = "default_users")]
    users: usize,
}

impl SoakConfiguration {
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let soak_config: Self = config.as_typed().context("Failed to read soak configuration.")?;
        if soak_config.producers == 0 || soak_config.hosts == 0 || soak_config.users == 0 {
            anyhow::bail!("`producers`, `hosts`, and `users` must all be greater than zero.");
        }
        Ok(soak_config)
    }

    pub const fn producers(&self) -> usize {
        self.producers
    }

    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub const fn hosts(&self) -> usize {
        self.hosts
    }

    pub const fn users(&self) -> usize {
        self.users
    }
}
