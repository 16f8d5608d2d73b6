use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};
use thiserror::Error;
use tracing::{debug, error};

/// Optional tunables file, picked up from the working directory. The CLI
/// itself stays a single positional store path.
pub const CONFIG_FILE: &str = "dcsim.yml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the config file")]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize the config file")]
    Deserialize(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // seconds between queue polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    // buffered workload snapshots that trigger a flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

impl RunnerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        if !path.is_file() {
            debug!("No {CONFIG_FILE} in the working directory, using defaults");

            return Ok(Self::default());
        }

        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Returns true when the config contains an error. All errors are
    /// reported at once to make fixing the file easier.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.poll_interval_secs == 0 {
            error!("poll_interval_secs cannot be 0, the runner would spin on the queue");
            contains_error = true;
        }

        if self.flush_threshold == 0 {
            error!("flush_threshold cannot be 0, every tick would force a transaction");
            contains_error = true;
        }

        contains_error
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_flush_threshold() -> usize {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: RunnerConfig = serde_yaml::from_str("poll_interval_secs: 1").unwrap();
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.flush_threshold, 3000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunnerConfig>("pol_interval_secs: 1").is_err());
    }

    #[test]
    fn zero_intervals_fail_preflight() {
        let mut config = RunnerConfig::default();
        assert!(!config.preflight_checks());

        config.poll_interval_secs = 0;
        assert!(config.preflight_checks());
    }
}
