//! TOML configuration
//!
//! Every section and field is optional; anything left out takes its default.
//!
//! ```toml
//! [bus]
//! analysis_addr = "127.0.0.1:5556"
//! monitor_addr = "127.0.0.1:5557"
//!
//! [scoring]
//! buffer_capacity = 10
//! ear_threshold = 0.25
//!
//! [aggregator]
//! bucket_minutes = 5
//! db_path = "concentration.db"
//!
//! [web]
//! bind_addr = "127.0.0.1:8080"
//! evolution_threshold = 5000.0
//! ```

use crate::error::ConfigError;
use crate::scoring::ScoringConfig;
use crate::store::DEFAULT_EVOLUTION_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusSettings,
    pub scoring: ScoringSettings,
    pub aggregator: AggregatorSettings,
    pub web: WebSettings,
}

/// Addresses and topics of the two bus hops the core takes part in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Where the analyzer publishes analysis results
    pub analysis_addr: String,
    pub analysis_topic: String,
    /// Where the scorer publishes monitor messages
    pub monitor_addr: String,
    pub monitor_topic: String,
    pub poll_interval_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            analysis_addr: "127.0.0.1:5556".to_string(),
            analysis_topic: "analysis".to_string(),
            monitor_addr: "127.0.0.1:5557".to_string(),
            monitor_topic: "monitor".to_string(),
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub tick_interval_ms: u64,
    #[serde(flatten)]
    pub engine: ScoringConfig,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 33,
            engine: ScoringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub bucket_minutes: u64,
    pub db_path: PathBuf,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            bucket_minutes: 5,
            db_path: PathBuf::from("concentration.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind_addr: String,
    pub evolution_threshold: f64,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            evolution_threshold: DEFAULT_EVOLUTION_THRESHOLD,
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// * `ConfigError::ReadError` - the file cannot be read
    /// * `ConfigError::TomlError` - the file is not valid TOML for this schema
    /// * `ConfigError::ValidationError` - a value is out of range
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bus = &self.bus;
        for (name, value) in [
            ("bus.analysis_addr", &bus.analysis_addr),
            ("bus.analysis_topic", &bus.analysis_topic),
            ("bus.monitor_addr", &bus.monitor_addr),
            ("bus.monitor_topic", &bus.monitor_topic),
            ("web.bind_addr", &self.web.bind_addr),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must not be empty", name)));
            }
        }
        if bus.poll_interval_ms == 0 {
            return Err(invalid("bus.poll_interval_ms must be positive"));
        }

        let scoring = &self.scoring;
        if scoring.tick_interval_ms == 0 {
            return Err(invalid("scoring.tick_interval_ms must be positive"));
        }
        if scoring.engine.buffer_capacity == 0 {
            return Err(invalid("scoring.buffer_capacity must be positive"));
        }
        if scoring.engine.stale_after_ms == 0 {
            return Err(invalid("scoring.stale_after_ms must be positive"));
        }
        if !(scoring.engine.ear_threshold > 0.0 && scoring.engine.ear_threshold < 1.0) {
            return Err(invalid(format!(
                "scoring.ear_threshold must be in (0, 1), got {}",
                scoring.engine.ear_threshold
            )));
        }
        for (name, value) in [
            ("scoring.looking_away_angle", scoring.engine.looking_away_angle),
            ("scoring.looking_away_penalty", scoring.engine.looking_away_penalty),
            (
                "scoring.head_direction_std_weight",
                scoring.engine.head_direction_std_weight,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if self.aggregator.bucket_minutes == 0 || 60 % self.aggregator.bucket_minutes != 0 {
            return Err(invalid(format!(
                "aggregator.bucket_minutes must divide 60, got {}",
                self.aggregator.bucket_minutes
            )));
        }

        if !self.web.evolution_threshold.is_finite() || self.web.evolution_threshold <= 0.0 {
            return Err(invalid("web.evolution_threshold must be positive"));
        }
        Ok(())
    }
}

impl BusSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ScoringSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl AggregatorSettings {
    pub fn bucket_width(&self) -> Duration {
        Duration::from_secs(self.bucket_minutes * 60)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
