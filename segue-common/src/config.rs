//! Configuration loading and tuning constants
//!
//! Implements a small bootstrap configuration:
//! 1. **TOML file**: Engine tuning, crossfade settings, logging
//! 2. **Built-in defaults**: Every field has a compiled default
//!
//! # Config File Resolution
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`SEGUE_CONFIG`)
//! 3. User config directory (`<config_dir>/segue/config.toml`)
//! 4. Built-in defaults (no file)
//!
//! A missing or unreadable file is never fatal: the loader logs a warning
//! and continues with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SEGUE_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Numeric thresholds used by the engine
    #[serde(default)]
    pub engine: EngineTuning,

    /// User-facing crossfade settings
    #[serde(default)]
    pub crossfade: CrossfadeSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// User crossfade settings as supplied by the settings store
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrossfadeSettings {
    /// Raw crossfade duration in seconds
    #[serde(default = "default_crossfade_secs")]
    pub duration_secs: f64,

    /// Visualizer requests extra buffering delay on audible chains
    #[serde(default)]
    pub visualizer_buffering: bool,
}

impl Default for CrossfadeSettings {
    fn default() -> Self {
        Self {
            duration_secs: default_crossfade_secs(),
            visualizer_buffering: false,
        }
    }
}

fn default_crossfade_secs() -> f64 {
    3.0
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Product-tuning constants for the engine
///
/// Every threshold the engine compares against lives here so it can be
/// overridden from the config file instead of being re-derived in code.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineTuning {
    // === Crossfade mode boundaries ===
    /// Durations below this disable crossfading
    pub disabled_below_secs: f64,
    /// Durations up to this use short (linear) mode
    pub short_mode_max_secs: f64,
    /// Trigger when remaining time ≤ fade_out × factor
    pub trigger_window_factor: f64,

    // === Crossfade timers ===
    /// Subtracted from sustain when scheduling the sustain timer
    pub sustain_drift_compensation_secs: f64,
    /// Delay between the fadeout timer and disconnecting the outgoing element
    pub disconnect_delay_ms: u64,
    /// Lower bound for the safety timer
    pub safety_min_ms: u64,
    /// Added to fade_out + sustain for the safety timer
    pub safety_margin_ms: u64,
    /// Buffered lookahead required before a transition starts
    pub min_lookahead_secs: f64,
    /// Delay before the single buffer-wait retry
    pub buffer_wait_retry_ms: u64,
    /// Length of the final gain-to-zero ramp on the outgoing element
    pub final_ramp_secs: f64,

    // === Graph ===
    /// Time constant for smoothed volume changes
    pub volume_time_constant_secs: f64,
    /// Delay applied on audible chains while the visualizer buffers
    pub visualizer_buffer_delay_secs: f64,

    // === Preload ===
    /// Internal network-stall timeout
    pub network_timeout_ms: u64,
    /// Timeout cap for streaming (metadata-only) preloads
    pub streaming_timeout_cap_ms: u64,

    // === Sync ===
    /// Drift at or below this is ignored
    pub drift_tolerance_secs: f64,
    /// Drift above this is corrected by seeking
    pub drift_seek_threshold_secs: f64,
    /// Buffered lookahead required before a corrective seek
    pub min_buffer_ahead_secs: f64,
    /// Playback-rate deviation used for small corrections
    pub rate_nudge: f64,
    /// Delay before a nudged playback rate reverts to 1.0
    pub rate_revert_ms: u64,
    /// Poll interval while at least one element is playing
    pub sync_active_interval_ms: u64,
    /// Poll interval while all tracked elements are idle
    pub sync_idle_interval_ms: u64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            disabled_below_secs: 0.01,
            short_mode_max_secs: 0.5,
            trigger_window_factor: 1.5,
            sustain_drift_compensation_secs: 0.05,
            disconnect_delay_ms: 1000,
            safety_min_ms: 5000,
            safety_margin_ms: 2000,
            min_lookahead_secs: 1.0,
            buffer_wait_retry_ms: 1000,
            final_ramp_secs: 0.05,
            volume_time_constant_secs: 0.03,
            visualizer_buffer_delay_secs: 0.5,
            network_timeout_ms: 15_000,
            streaming_timeout_cap_ms: 5_000,
            drift_tolerance_secs: 0.1,
            drift_seek_threshold_secs: 0.5,
            min_buffer_ahead_secs: 2.0,
            rate_nudge: 0.01,
            rate_revert_ms: 500,
            sync_active_interval_ms: 100,
            sync_idle_interval_ms: 1000,
        }
    }
}

impl EngineTuning {
    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        let secs = [
            ("disabled_below_secs", self.disabled_below_secs),
            ("short_mode_max_secs", self.short_mode_max_secs),
            ("trigger_window_factor", self.trigger_window_factor),
            ("sustain_drift_compensation_secs", self.sustain_drift_compensation_secs),
            ("min_lookahead_secs", self.min_lookahead_secs),
            ("final_ramp_secs", self.final_ramp_secs),
            ("volume_time_constant_secs", self.volume_time_constant_secs),
            ("visualizer_buffer_delay_secs", self.visualizer_buffer_delay_secs),
            ("drift_tolerance_secs", self.drift_tolerance_secs),
            ("drift_seek_threshold_secs", self.drift_seek_threshold_secs),
            ("min_buffer_ahead_secs", self.min_buffer_ahead_secs),
            ("rate_nudge", self.rate_nudge),
        ];

        for (name, value) in secs {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "{} must be a non-negative finite number, got {}",
                    name, value
                )));
            }
        }

        if self.short_mode_max_secs < self.disabled_below_secs {
            return Err(Error::Config(format!(
                "short_mode_max_secs ({}) must not be below disabled_below_secs ({})",
                self.short_mode_max_secs, self.disabled_below_secs
            )));
        }

        if self.drift_seek_threshold_secs < self.drift_tolerance_secs {
            return Err(Error::Config(format!(
                "drift_seek_threshold_secs ({}) must not be below drift_tolerance_secs ({})",
                self.drift_seek_threshold_secs, self.drift_tolerance_secs
            )));
        }

        if self.rate_nudge >= 1.0 {
            return Err(Error::Config(format!(
                "rate_nudge must be below 1.0, got {}",
                self.rate_nudge
            )));
        }

        if self.sync_active_interval_ms == 0 || self.sync_idle_interval_ms == 0 {
            return Err(Error::Config("sync intervals must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn streaming_timeout_cap(&self) -> Duration {
        Duration::from_millis(self.streaming_timeout_cap_ms)
    }

    pub fn rate_revert(&self) -> Duration {
        Duration::from_millis(self.rate_revert_ms)
    }

    pub fn buffer_wait_retry(&self) -> Duration {
        Duration::from_millis(self.buffer_wait_retry_ms)
    }

    pub fn sync_active_interval(&self) -> Duration {
        Duration::from_millis(self.sync_active_interval_ms)
    }

    pub fn sync_idle_interval(&self) -> Duration {
        Duration::from_millis(self.sync_idle_interval_ms)
    }

    /// Safety timer delay: max(safety_min, fade_out + sustain + margin)
    pub fn safety_delay(&self, fade_out_secs: f64, sustain_secs: f64) -> Duration {
        let derived = Duration::from_secs_f64((fade_out_secs + sustain_secs).max(0.0))
            + Duration::from_millis(self.safety_margin_ms);
        derived.max(Duration::from_millis(self.safety_min_ms))
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration, degrading to defaults on any failure
    ///
    /// Resolution follows the module-level priority order. Invalid files are
    /// reported and ignored rather than aborting startup.
    pub fn load_or_default(cli_path: Option<&Path>) -> Self {
        match resolve_config_path(cli_path) {
            Some(path) => match Self::load(&path) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to load configuration from {}: {}; using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            None => {
                info!("No configuration file found, using built-in defaults");
                Self::default()
            }
        }
    }
}

/// Resolve which config file to read, if any
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    default_config_path().filter(|p| p.exists())
}

/// Platform config file location (`<config_dir>/segue/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("segue").join("config.toml"))
}
