//! Station configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. compiled-in defaults
//! 2. `eol_station.toml` (or an explicit path)
//! 3. environment variables prefixed with `EOL_STATION_`, using `__` between sections
//!    (`EOL_STATION_RUNNER__SETTLE_MS=80`)
//!
//! # Example
//! ```no_run
//! use eol_station::config::StationConfig;
//!
//! let config = StationConfig::load()?;
//! config.validate()?;
//! println!("Station: {}", config.application.name);
//! # Ok::<(), eol_station::error::EolError>(())
//! ```

use crate::error::{EolError, EolResult};
use crate::procedures::RunnerTiming;
use crate::sequencer::SequencerConfig;
use crate::transport::ScopeConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "eol_station.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "EOL_STATION_";

/// Top-level station configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// CAN bus settings
    pub can: CanConfig,
    /// Fixed waits used by every procedure
    pub runner: RunnerTiming,
    /// Sequencer settings
    pub sequencer: SequencerConfig,
    /// Oscilloscope settings applied when a sequence starts
    pub instrument: Option<ScopeConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Station name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "EOL Station".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// CAN bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Capacity of the inbound frame queue; the oldest frames are dropped when full
    pub queue_capacity: usize,
    /// Message database (TOML) describing the DUT's messages and signals
    pub database: Option<PathBuf>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            database: None,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl StationConfig {
    /// Load from `eol_station.toml` in the working directory and the environment.
    pub fn load() -> EolResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EolResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(EolError::from)
    }

    /// Layered provider, exposed for callers that merge further sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(StationConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EolResult<()> {
        let invalid = |msg: String| Err(EolError::InvalidInput(msg));

        if !VALID_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            ));
        }
        if self.can.queue_capacity == 0 {
            return invalid("can.queue_capacity must be at least 1".into());
        }
        if self.runner.sample_interval_ms == 0 {
            return invalid("runner.sample_interval_ms must be at least 1".into());
        }
        if self.runner.poll_interval_ms == 0 {
            return invalid("runner.poll_interval_ms must be at least 1".into());
        }
        if let Some(scope) = &self.instrument {
            if let Err(errors) = scope.validate() {
                let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
                return invalid(format!("instrument: {}", reasons.join("; ")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScopeChannelConfig, SignalRef};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = StationConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "EOL Station");
        assert_eq!(config.can.queue_capacity, 1024);
        assert_eq!(config.runner, RunnerTiming::default());
        assert!(config.instrument.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Line 3"
log_level = "debug"
log_format = "json"

[can]
queue_capacity = 64

[runner]
settle_ms = 80

[sequencer.mode_signal]
message_id = 0x30
signal = "TestMode"

[instrument]
timebase_s_per_div = 0.001

[[instrument.channels]]
channel = 1
label = "Phase V"
volts_per_div = 0.5
"#
        )
        .unwrap();

        let config = StationConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Line 3");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.can.queue_capacity, 64);
        assert_eq!(config.runner.settle_ms, 80);
        // Unset keys keep their defaults.
        assert_eq!(config.runner.poll_interval_ms, 50);
        assert_eq!(
            config.sequencer.mode_signal,
            Some(SignalRef::new(0x30, "TestMode"))
        );
        let scope = config.instrument.as_ref().unwrap();
        assert_eq!(scope.channels[0].channel, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = StationConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = StationConfig::default();
        config.can.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = StationConfig::default();
        config.instrument = Some(ScopeConfig {
            timebase_s_per_div: 0.001,
            channels: vec![ScopeChannelConfig {
                channel: 12,
                label: "bad".into(),
                enabled: true,
                volts_per_div: 1.0,
                probe_attenuation: 10.0,
                offset_v: 0.0,
            }],
        });
        assert!(config.validate().is_err());
    }
}
