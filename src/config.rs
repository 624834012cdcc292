use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::delivery::DeliveryConfig;
use crate::detector::DetectorConfig;

/// Same bound the detector applies to remote calibration.
const MAX_MIN_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub service_url: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_outbox_path")]
    pub outbox_path: PathBuf,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

fn default_outbox_path() -> PathBuf {
    PathBuf::from("outbox.json")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    #[default]
    Mpu6050,
    Replay,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub i2c_bus: PathBuf,
    pub address: u16,
    /// Raw reads per sample; the magnitude is their spread.
    pub burst_reads: usize,
    pub burst_interval_ms: u64,
    pub replay_path: Option<PathBuf>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Mpu6050,
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            // AD0 pulled high
            address: 0x69,
            burst_reads: 50,
            burst_interval_ms: 2,
            replay_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectorSection {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub debounce_on_ms: u64,
    pub debounce_off_ms: u64,
    pub min_valid_duration_secs: f64,
    pub max_magnitude: f64,
}

impl Default for DetectorSection {
    fn default() -> Self {
        let d = DetectorConfig::default();
        Self {
            high_threshold: d.high_threshold,
            low_threshold: d.low_threshold,
            debounce_on_ms: d.debounce_on.as_millis() as u64,
            debounce_off_ms: d.debounce_off.as_millis() as u64,
            min_valid_duration_secs: d.min_valid_duration.as_secs_f64(),
            max_magnitude: d.max_magnitude,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { interval_ms: 200 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutboxConfig {
    pub capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliverySection {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub jitter: f64,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            base_backoff_secs: 5,
            max_backoff_secs: 30 * 60,
            jitter: 0.2,
            request_timeout_secs: 15,
            heartbeat_interval_secs: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub status_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.service_url.starts_with("http://") || self.service_url.starts_with("https://")) {
            return invalid(format!("service_url must be http(s): {:?}", self.service_url));
        }
        self.tz()?;

        let d = &self.detector;
        if !(d.low_threshold > 0.0 && d.high_threshold > d.low_threshold) {
            return invalid(format!(
                "detector thresholds need 0 < low < high (low={}, high={})",
                d.low_threshold, d.high_threshold
            ));
        }
        if d.debounce_on_ms == 0 || d.debounce_off_ms == 0 {
            return invalid("detector debounce must be non-zero".into());
        }
        if !(d.min_valid_duration_secs >= 0.0 && d.min_valid_duration_secs < MAX_MIN_DURATION_SECS) {
            return invalid(format!(
                "detector.min_valid_duration_secs must be in [0, {MAX_MIN_DURATION_SECS}): {}",
                d.min_valid_duration_secs
            ));
        }
        if d.max_magnitude <= d.high_threshold {
            return invalid("detector.max_magnitude must exceed high_threshold".into());
        }
        if self.sampling.interval_ms == 0 {
            return invalid("sampling.interval_ms must be non-zero".into());
        }
        // Samples further apart than a debounce window restart the crossing.
        if self.sampling.interval_ms > d.debounce_on_ms.min(d.debounce_off_ms) {
            return invalid(format!(
                "sampling.interval_ms ({}) must not exceed the detector debounce",
                self.sampling.interval_ms
            ));
        }
        if self.outbox.capacity == 0 {
            return invalid("outbox.capacity must be non-zero".into());
        }
        let dl = &self.delivery;
        if dl.base_backoff_secs == 0 || dl.base_backoff_secs > dl.max_backoff_secs {
            return invalid("delivery backoff needs 0 < base <= max".into());
        }
        if !(0.0..1.0).contains(&dl.jitter) {
            return invalid(format!("delivery.jitter must be in [0, 1): {}", dl.jitter));
        }
        if self.sensor.kind == SensorKind::Replay && self.sensor.replay_path.is_none() {
            return invalid("sensor.replay_path is required for the replay sensor".into());
        }
        if self.sensor.burst_reads < 2 {
            return invalid("sensor.burst_reads must be at least 2".into());
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {:?}", self.timezone)))
    }

    pub fn detector_config(&self) -> DetectorConfig {
        let d = &self.detector;
        DetectorConfig {
            high_threshold: d.high_threshold,
            low_threshold: d.low_threshold,
            debounce_on: Duration::from_millis(d.debounce_on_ms),
            debounce_off: Duration::from_millis(d.debounce_off_ms),
            min_valid_duration: Duration::from_secs_f64(d.min_valid_duration_secs),
            max_magnitude: d.max_magnitude,
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        let d = &self.delivery;
        DeliveryConfig {
            backoff: BackoffPolicy {
                base: Duration::from_secs(d.base_backoff_secs),
                max: Duration::from_secs(d.max_backoff_secs),
                jitter: d.jitter,
            },
            heartbeat_interval: Duration::from_secs(d.heartbeat_interval_secs),
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.request_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.status_interval_secs)
    }

    /// Configured id, else the machine id, else the hostname.
    pub fn resolve_device_id(&self) -> String {
        if let Some(id) = self.device_id.as_deref().filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        ["/etc/machine-id", "/etc/hostname"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
