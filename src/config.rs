//! Layered configuration: defaults, optional TOML file, `VIGILO__` environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureFormat;
use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "VIGILO";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub capture: CaptureConfig,
    pub snapshot: SnapshotConfig,
    pub notify: NotifyConfig,
    pub sources: Vec<SourceConfig>,
}

/// Knobs read by every session at the start of each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Per-pixel intensity cutoff; a cell changes when its diff is strictly above it
    pub diff_threshold: u8,
    /// Fraction of changed cells above which a sample is motion, in (0, 1)
    pub motion_pixel_ratio: f64,
    pub sample_interval_ms: u64,
    pub debounce_interval_ms: u64,
    /// How long a session reports motion as active after the last motion sample
    pub motion_active_ms: u64,
    /// Hand the threshold mask back with each sample (overlay rendering)
    pub keep_mask: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub format: CaptureFormat,
    pub buffer_count: u32,
    /// Longest wait for one device buffer before the tick counts as failed
    pub frame_timeout_ms: u64,
    /// Stop a session after this many failed ticks in a row; 0 retries forever
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub channel_capacity: usize,
    pub caption_prefix: String,
    /// Where the daemon drops snapshot files; nothing is written when unset
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 25,
            motion_pixel_ratio: 0.01,
            sample_interval_ms: 200,
            debounce_interval_ms: 5000,
            motion_active_ms: 10_000,
            keep_mask: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: CaptureFormat::Mjpeg,
            buffer_count: 4,
            frame_timeout_ms: 2000,
            max_consecutive_failures: 0,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { jpeg_quality: 80 }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            caption_prefix: "Movement detected at".into(),
            output_dir: None,
        }
    }
}

impl DetectionConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn motion_active(&self) -> Duration {
        Duration::from_millis(self.motion_active_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.motion_pixel_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.motion_pixel_ratio must be in (0, 1), got {ratio}"
            )));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "detection.sample_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Config {
    /// Load defaults, then `path` if given, then `VIGILO__SECTION__KEY` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection.validate()?;

        if !(1..=100).contains(&self.snapshot.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "snapshot.jpeg_quality must be in 1..=100, got {}",
                self.snapshot.jpeg_quality
            )));
        }
        if self.capture.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture.frame_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.notify.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notify.channel_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::Invalid("source id must not be empty".into()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source {} is listed twice",
                    source.id
                )));
            }
        }
        Ok(())
    }
}

/// Shared, hot-swappable detection settings.
///
/// Readers take a whole snapshot with [`ConfigHandle::load`], so a concurrent
/// update is seen on the next read and never half-applied.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<DetectionConfig>>,
}

impl ConfigHandle {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<DetectionConfig> {
        self.inner.load_full()
    }

    /// Publish new settings; rejected settings leave the current ones in place.
    pub fn store(&self, config: DetectionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}
