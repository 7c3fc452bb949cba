//! Station configuration.
//!
//! A [`StationConfig`] is read from a JSON file (every field is optional
//! and falls back to its default), overridden from the command line or the
//! environment by the binary, and then validated once before the pipeline
//! starts. A config that fails [`StationConfig::validate`] never reaches the
//! pipeline.
//!
//! Durations are written as seconds, e.g. `"request_timeout": 0.1`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelRegistry;
use crate::dispatch::{RetryPolicy, StationIdentity};
use crate::error::{ConfigError, Result};
use crate::sampler::SweepTiming;

/// Serial line settings. Framing is always 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path.
    pub port: String,
    /// Line speed.
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud_rate: 4800,
        }
    }
}

/// Everything a station needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station name, sent as the payload `id`. Required.
    pub station_name: String,
    /// Shared secret for the collector. Required.
    pub station_key: String,
    /// Collector URL. `None` (or blank) disables dispatch.
    pub server: Option<String>,
    /// Samples per report, i.e. the window capacity.
    pub record_frequency: usize,
    /// Rows kept in the latest file. `None` keeps everything.
    pub storage_size: Option<usize>,
    /// Storage root for the CSV files.
    pub data_path: PathBuf,
    /// Time between sampling ticks.
    #[serde(with = "duration_serde")]
    pub sample_period: Duration,
    /// Serial line settings.
    pub serial: SerialSettings,
    /// Maximum wait for each sensor reply.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Pause between consecutive sensor requests.
    #[serde(with = "duration_serde")]
    pub turnaround: Duration,
    /// Delivery attempts per report.
    pub dispatch_attempts: u32,
    /// Wait after the collector answers "rate limited".
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
    /// Total time allowed for all delivery attempts of one report.
    #[serde(with = "duration_serde")]
    pub dispatch_budget: Duration,
    /// Channel registry file. `None` uses the built-in SN3003 registry.
    pub registry: Option<PathBuf>,
}

impl Default for StationConfig {
    fn default() -> Self {
        let timing = SweepTiming::default();
        let policy = RetryPolicy::default();

        Self {
            station_name: String::new(),
            station_key: String::new(),
            server: None,
            record_frequency: 30,
            storage_size: Some(2880),
            data_path: PathBuf::from("./data"),
            sample_period: Duration::from_secs(1),
            serial: SerialSettings::default(),
            request_timeout: timing.request_timeout,
            turnaround: timing.turnaround,
            dispatch_attempts: policy.max_attempts,
            cooldown: policy.cooldown,
            dispatch_budget: policy.budget,
            registry: None,
        }
    }
}

impl StationConfig {
    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] or [`ConfigError::Parse`] if the file
    /// cannot be read or parsed. The result is not validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(config)
    }

    /// Writes the config as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] or [`ConfigError::Save`] on failure.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize { source: e })?;

        fs::write(path, content).map_err(|e| ConfigError::Save {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }

    /// Checks the settings the pipeline cannot run without.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: a blank station name or key,
    /// a zero window capacity, or a zero period, timeout, budget or
    /// retention.
    pub fn validate(&self) -> Result<()> {
        if self.station_name.trim().is_empty() {
            return Err(ConfigError::MissingStationName.into());
        }
        if self.station_key.trim().is_empty() {
            return Err(ConfigError::MissingStationKey.into());
        }
        if self.record_frequency == 0 {
            return Err(ConfigError::InvalidWindow {
                capacity: self.record_frequency,
            }
            .into());
        }

        let non_zero = [
            ("sample_period", self.sample_period),
            ("request_timeout", self.request_timeout),
            ("dispatch_budget", self.dispatch_budget),
        ];
        for (field, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                }
                .into());
            }
        }

        if self.dispatch_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatch_attempts",
                reason: "at least one attempt is required".to_string(),
            }
            .into());
        }
        if self.storage_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "storage_size",
                reason: "use null to keep every row".to_string(),
            }
            .into());
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "serial.baud_rate",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// The collector URL, if dispatch is enabled.
    pub fn endpoint(&self) -> Option<&str> {
        self.server.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// The station identity sent with every report.
    pub fn identity(&self) -> StationIdentity {
        StationIdentity::new(self.station_name.clone(), self.station_key.clone())
    }

    /// Bus timing for the sampler.
    pub fn sweep_timing(&self) -> SweepTiming {
        SweepTiming {
            request_timeout: self.request_timeout,
            turnaround: self.turnaround,
        }
    }

    /// Retry policy for the dispatcher.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch_attempts,
            cooldown: self.cooldown,
            budget: self.dispatch_budget,
        }
    }

    /// Time between reporting ticks: one window's worth of sampling ticks.
    pub fn report_period(&self) -> Duration {
        self.sample_period
            .saturating_mul(u32::try_from(self.record_frequency).unwrap_or(u32::MAX))
    }

    /// Builds the channel registry: the configured file, or SN3003.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ChannelError`] if the registry file cannot be
    /// loaded or is invalid.
    pub fn load_registry(&self) -> Result<ChannelRegistry> {
        match &self.registry {
            Some(path) => ChannelRegistry::from_path(path),
            None => Ok(ChannelRegistry::sn3003()),
        }
    }
}

/// Durations as seconds (f64) in JSON.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeteoError;

    fn valid() -> StationConfig {
        StationConfig {
            station_name: "station-1".to_string(),
            station_key: "secret".to_string(),
            ..StationConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = StationConfig::default();

        assert_eq!(config.record_frequency, 30);
        assert_eq!(config.storage_size, Some(2880));
        assert_eq!(config.data_path, PathBuf::from("./data"));
        assert_eq!(config.serial.port, "/dev/ttyS0");
        assert_eq!(config.serial.baud_rate, 4800);
        assert_eq!(config.request_timeout, Duration::from_millis(100));
        assert_eq!(config.turnaround, Duration::from_millis(10));
        assert_eq!(config.dispatch_attempts, 3);
        assert_eq!(config.cooldown, Duration::from_secs(5));
        assert_eq!(config.report_period(), Duration::from_secs(30));
        assert!(config.endpoint().is_none());
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let err = StationConfig::default().validate().unwrap_err();
        assert!(matches!(
            err,
            MeteoError::Config(ConfigError::MissingStationName)
        ));

        let config = StationConfig {
            station_name: "station-1".to_string(),
            station_key: "   ".to_string(),
            ..StationConfig::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            MeteoError::Config(ConfigError::MissingStationKey)
        ));

        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = StationConfig {
            record_frequency: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            MeteoError::Config(ConfigError::InvalidWindow { capacity: 0 })
        ));

        let config = StationConfig {
            sample_period: Duration::ZERO,
            ..valid()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            MeteoError::Config(ConfigError::InvalidValue {
                field: "sample_period",
                ..
            })
        ));

        let config = StationConfig {
            storage_size: Some(0),
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = StationConfig {
            storage_size: None,
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.json");
        fs::write(
            &path,
            r#"{"station_name": "roof", "station_key": "k", "server": "http://collector/api", "turnaround": 0.02}"#,
        )
        .unwrap();

        let config = StationConfig::load(&path).unwrap();

        assert_eq!(config.station_name, "roof");
        assert_eq!(config.endpoint(), Some("http://collector/api"));
        assert_eq!(config.turnaround, Duration::from_millis(20));
        assert_eq!(config.record_frequency, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.json");
        let config = StationConfig {
            server: Some("http://collector/api".to_string()),
            storage_size: None,
            ..valid()
        };

        config.save(&path).unwrap();
        let loaded = StationConfig::load(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();

        let err = StationConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, MeteoError::Config(ConfigError::Load { .. })));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = StationConfig::load(&path).unwrap_err();
        assert!(matches!(err, MeteoError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_blank_server_disables_dispatch() {
        let config = StationConfig {
            server: Some("  ".to_string()),
            ..valid()
        };
        assert!(config.endpoint().is_none());
    }

    #[test]
    fn test_derived_settings() {
        let config = valid();

        assert_eq!(config.identity(), StationIdentity::new("station-1", "secret"));
        assert_eq!(config.sweep_timing(), SweepTiming::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.load_registry().unwrap().len(), 9);
    }
}
