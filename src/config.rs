//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/daq_log.toml` by default)
//! 2. environment variables prefixed with `DAQ_LOG_`, nested keys separated
//!    by `__` (e.g. `DAQ_LOG_STORAGE__OUTPUT_DIR=/data`)
//!
//! # Example
//! ```no_run
//! use daq_log::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Recording {} channels", settings.channels.len());
//! # Ok::<(), daq_log::error::DaqError>(())
//! ```

use chrono::{DateTime, TimeZone};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::registry::{ChannelConfig, InMemoryScaleStore, ScaleDefinition};
use crate::error::{AppResult, DaqError};
use crate::logging::LogFormat;
use crate::pipeline::PipelineSettings;
use crate::storage::{FlushPolicy, WriterOptions};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_log.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DAQ_LOG_";

/// Log file extension
pub const LOG_EXTENSION: &str = "dqlog";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Channels to record, in acquisition order
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Named calibration scales referenced by `channels`
    #[serde(default)]
    pub scales: HashMap<String, ScaleDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Acquisition hardware and buffering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Device driver; only `simulated` is built in
    #[serde(default = "default_device")]
    pub device: String,
    /// Physical analog inputs of the simulated card
    #[serde(default = "default_simulated_channels")]
    pub simulated_channels: usize,
    /// Per-channel sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_samples_per_block")]
    pub samples_per_block: usize,
    /// Acquisition ring capacity in blocks
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: usize,
    /// Writer sleep while no block is available
    #[serde(default = "default_idle_backoff", with = "humantime_serde")]
    pub idle_backoff: Duration,
}

/// Log file output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File names are `<file_prefix>_YYYYmmdd_HHMMSS.dqlog`
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Commit at least this often while data arrives
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Option<Duration>,
    /// Commit after this many blocks
    #[serde(default)]
    pub flush_every_blocks: Option<u32>,
    /// Roll over to a new segment at this data size in bytes
    #[serde(default = "default_segment_size_threshold")]
    pub segment_size_threshold: Option<u64>,
    /// Roll over to a new segment after this much acquisition time
    #[serde(default, with = "humantime_serde")]
    pub segment_duration: Option<Duration>,
}

// Default value functions
fn default_name() -> String {
    "daq_log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device() -> String {
    "simulated".to_string()
}

fn default_simulated_channels() -> usize {
    8
}

fn default_sample_rate() -> f64 {
    1000.0
}

fn default_samples_per_block() -> usize {
    100
}

fn default_buffer_depth() -> usize {
    64
}

fn default_idle_backoff() -> Duration {
    Duration::from_millis(2)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_prefix() -> String {
    "session".to_string()
}

fn default_flush_interval() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_segment_size_threshold() -> Option<u64> {
    Some(256 * 1024 * 1024)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            simulated_channels: default_simulated_channels(),
            sample_rate: default_sample_rate(),
            samples_per_block: default_samples_per_block(),
            buffer_depth: default_buffer_depth(),
            idle_backoff: default_idle_backoff(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            flush_interval: default_flush_interval(),
            flush_every_blocks: None,
            segment_size_threshold: default_segment_size_threshold(),
            segment_duration: None,
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `DAQ_LOG_ACQUISITION__SAMPLE_RATE=2000`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Render as TOML, e.g. to show the effective configuration.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading.
    ///
    /// Channel-level checks (known physical channels, unique display names,
    /// resolvable scales) happen in
    /// [`ChannelRegistry::resolve`](crate::channel::ChannelRegistry::resolve).
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;

        let acquisition = &self.acquisition;
        if acquisition.device != "simulated" {
            return Err(DaqError::Configuration(format!(
                "Unsupported device '{}'. Must be: simulated",
                acquisition.device
            )));
        }
        if !(acquisition.sample_rate.is_finite() && acquisition.sample_rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid sample_rate {}. Must be positive",
                acquisition.sample_rate
            )));
        }
        if acquisition.samples_per_block == 0 {
            return Err(DaqError::Configuration(
                "samples_per_block must be at least 1".into(),
            ));
        }
        if acquisition.buffer_depth == 0 {
            return Err(DaqError::Configuration(
                "buffer_depth must be at least 1".into(),
            ));
        }

        if self.storage.file_prefix.trim().is_empty() {
            return Err(DaqError::Configuration("file_prefix must not be empty".into()));
        }
        if self.storage.flush_every_blocks == Some(0) {
            return Err(DaqError::Configuration(
                "flush_every_blocks must be at least 1 when set".into(),
            ));
        }

        for (name, scale) in &self.scales {
            scale
                .transform
                .validate()
                .map_err(|reason| DaqError::Configuration(format!("Scale '{name}': {reason}")))?;
        }

        let mut physical = HashSet::new();
        for channel in &self.channels {
            if !physical.insert(channel.physical_channel_id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Physical channel '{}' configured more than once",
                    channel.physical_channel_id
                )));
            }
        }

        Ok(())
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            every_blocks: self.storage.flush_every_blocks,
            interval: self.storage.flush_interval,
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            flush: self.flush_policy(),
            segment_size_threshold: self.storage.segment_size_threshold,
            segment_duration: self.storage.segment_duration,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            buffer_depth: self.acquisition.buffer_depth,
            idle_backoff: self.acquisition.idle_backoff,
        }
    }

    /// Scale store built from the `[scales]` table
    pub fn scale_store(&self) -> InMemoryScaleStore {
        InMemoryScaleStore::from(self.scales.clone())
    }

    /// Path of a new log file started at `at`.
    pub fn log_file_path<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> PathBuf
    where
        Tz::Offset: std::fmt::Display,
    {
        self.storage.output_dir.join(format!(
            "{}_{}.{LOG_EXTENSION}",
            self.storage.file_prefix,
            at.format("%Y%m%d_%H%M%S")
        ))
    }
}
