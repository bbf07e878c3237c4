//! Configuration management for pathsteer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::processor::WeightBounds;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Latency probing.
    #[serde(default)]
    pub probing: ProbingConfig,

    /// Penalty notification sending and receiving.
    #[serde(default)]
    pub penalties: PenaltyConfig,

    /// Call quality monitoring.
    #[serde(default)]
    pub quality: QualityConfig,

    /// Connection level path handling.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.probing.burst_size == 0 {
            return Err(Error::InvalidConfig("Probe burst size must be positive".into()));
        }

        if self.probing.timeout.is_zero() {
            return Err(Error::InvalidConfig("Probe timeout must be positive".into()));
        }

        let bounds = self.penalties.bounds();
        if !(bounds.min <= 0.0 && 0.0 <= bounds.max) {
            return Err(Error::InvalidConfig(format!(
                "Penalty bounds [{}, {}] must contain zero",
                bounds.min, bounds.max
            )));
        }

        if self.penalties.max_repeats == 0 {
            return Err(Error::InvalidConfig("Maximum penalty repeats must be positive".into()));
        }

        if self.quality.stats_interval.is_zero() {
            return Err(Error::InvalidConfig("Statistics interval must be positive".into()));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "pathsteer", "pathsteer").map_or_else(
            || PathBuf::from("pathsteer.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            probing: ProbingConfig {
                start_paused: false,
                ..Default::default()
            },
            penalties: PenaltyConfig {
                apply_locally: true,
                ..Default::default()
            },
            quality: QualityConfig {
                record_snapshots: true,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Latency probing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbingConfig {
    /// Probes sent per path and round.
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,

    /// Spacing between two probe sends.
    #[serde(default = "default_inter_probe_interval", with = "humantime_serde")]
    pub inter_probe_interval: Duration,

    /// Wait after the last send before outstanding probes count as lost.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Delay between the end of one round and the next.
    #[serde(default = "default_reprobe_interval", with = "humantime_serde")]
    pub reprobe_interval: Duration,

    /// During the first round, re-rank after this many samples.
    #[serde(default = "default_first_round_emit_every")]
    pub first_round_emit_every: usize,

    /// Start with latency probing paused.
    #[serde(default)]
    pub start_paused: bool,
}

fn default_burst_size() -> usize {
    15
}
fn default_inter_probe_interval() -> Duration {
    Duration::from_millis(20)
}
fn default_probe_timeout() -> Duration {
    Duration::from_millis(1000)
}
fn default_reprobe_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_first_round_emit_every() -> usize {
    20
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            burst_size: default_burst_size(),
            inter_probe_interval: default_inter_probe_interval(),
            timeout: default_probe_timeout(),
            reprobe_interval: default_reprobe_interval(),
            first_round_emit_every: default_first_round_emit_every(),
            start_paused: false,
        }
    }
}

/// Penalty notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Lowest weight a path can reach through rewards.
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    /// Highest weight a path can reach through penalties.
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Spacing of redundant resends.
    #[serde(default = "default_resend_interval", with = "humantime_serde")]
    pub resend_interval: Duration,

    /// Penalties closer together than this on unchanged paths are repeats.
    #[serde(default = "default_repeat_window", with = "humantime_serde")]
    pub repeat_window: Duration,

    /// Repeats after which sending stops.
    #[serde(default = "default_max_repeats")]
    pub max_repeats: u32,

    /// Buffering window of the receiver before batches are applied.
    #[serde(default = "default_receive_window", with = "humantime_serde")]
    pub receive_window: Duration,

    /// Also penalize the current paths in the local penalizer.
    #[serde(default = "default_apply_locally")]
    pub apply_locally: bool,

    /// Start with penalty sending enabled.
    #[serde(default = "default_sending_enabled")]
    pub sending_enabled: bool,
}

fn default_min_weight() -> f64 {
    crate::MIN_PENALTY_WEIGHT
}
fn default_max_weight() -> f64 {
    crate::MAX_PENALTY_WEIGHT
}
fn default_resend_interval() -> Duration {
    Duration::from_millis(50)
}
fn default_repeat_window() -> Duration {
    Duration::from_secs(5)
}
fn default_max_repeats() -> u32 {
    5
}
fn default_receive_window() -> Duration {
    Duration::from_millis(500)
}
fn default_apply_locally() -> bool {
    true
}
fn default_sending_enabled() -> bool {
    true
}

impl PenaltyConfig {
    pub fn bounds(&self) -> WeightBounds {
        WeightBounds {
            min: self.min_weight,
            max: self.max_weight,
        }
    }
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            resend_interval: default_resend_interval(),
            repeat_window: default_repeat_window(),
            max_repeats: default_max_repeats(),
            receive_window: default_receive_window(),
            apply_locally: default_apply_locally(),
            sending_enabled: default_sending_enabled(),
        }
    }
}

/// Call quality monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Statistics polling cadence.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Non-critical penalties are ignored this long after an audio penalty.
    #[serde(default = "default_audio_grace", with = "humantime_serde")]
    pub audio_grace: Duration,

    /// Non-critical penalties are ignored this long after a video penalty.
    #[serde(default = "default_video_grace", with = "humantime_serde")]
    pub video_grace: Duration,

    /// Second purge of the metric windows after a path switch.
    #[serde(default = "default_switch_purge_delay", with = "humantime_serde")]
    pub switch_purge_delay: Duration,

    /// Critical penalty applied on a reported stall.
    #[serde(default = "default_stall_penalty")]
    pub stall_penalty: f64,

    /// Stalls closer together than this are ignored.
    #[serde(default = "default_stall_cooldown", with = "humantime_serde")]
    pub stall_cooldown: Duration,

    /// Record video quality snapshots for later export.
    #[serde(default)]
    pub record_snapshots: bool,
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_audio_grace() -> Duration {
    Duration::from_secs(15)
}
fn default_video_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_switch_purge_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_stall_penalty() -> f64 {
    0.5
}
fn default_stall_cooldown() -> Duration {
    Duration::from_secs(3)
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
            audio_grace: default_audio_grace(),
            video_grace: default_video_grace(),
            switch_purge_delay: default_switch_purge_delay(),
            stall_penalty: default_stall_penalty(),
            stall_cooldown: default_stall_cooldown(),
            record_snapshots: false,
        }
    }
}

/// Connection level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Repeated path-down signals for one path are ignored this long.
    #[serde(default = "default_path_down_suppression", with = "humantime_serde")]
    pub path_down_suppression: Duration,

    /// Path-down signals are collected this long before penalizing.
    #[serde(default = "default_path_down_batch", with = "humantime_serde")]
    pub path_down_batch: Duration,

    /// Weight added per path-down signal.
    #[serde(default = "default_path_down_weight")]
    pub path_down_weight: f64,
}

fn default_path_down_suppression() -> Duration {
    Duration::from_secs(20)
}
fn default_path_down_batch() -> Duration {
    Duration::from_millis(100)
}
fn default_path_down_weight() -> f64 {
    1.0
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            path_down_suppression: default_path_down_suppression(),
            path_down_batch: default_path_down_batch(),
            path_down_weight: default_path_down_weight(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
