// Engine configuration and persistence
// Handed to the engine at construction; nothing in the core reads global state
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Which decoder strategy the engine uses for `load_audio_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Full-featured symphonia pipeline (all bundled containers and codecs).
    Symphonia,
    /// Degraded path: plain WAV only, duration estimated from file properties.
    Fallback,
}

impl Default for DecoderKind {
    fn default() -> Self {
        DecoderKind::Symphonia
    }
}

/// Which audio sink the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Default hardware output device through cpal.
    Cpal,
    /// Headless sink that consumes samples on its own clock.
    Null,
}

impl Default for OutputKind {
    fn default() -> Self {
        OutputKind::Cpal
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub version: i32, // Settings schema version for future migrations
    pub decoder: DecoderKind,
    pub output: OutputKind,
    /// Canonical channel count of the decoded PCM (1 or 2).
    pub output_channels: u16,
    /// `None` keeps the source sample rate; a value forces rate conversion.
    pub output_sample_rate: Option<u32>,
    /// Rate reported by `sample_rate()` before anything is loaded.
    pub default_sample_rate: u32,
    /// Fixed hardware buffer size in frames, `None` for the device default.
    pub buffer_frames: Option<u32>,
    pub position_update_interval_ms: u64,
    pub lock_retry_delay_ms: u64,
    pub lock_retry_limit: u32,
    pub device_start_timeout_ms: u64,
    pub initial_volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            decoder: DecoderKind::default(),
            output: OutputKind::default(),
            output_channels: 2,
            output_sample_rate: None,
            default_sample_rate: 44100,
            buffer_frames: None,
            position_update_interval_ms: 16, // 60fps updates
            lock_retry_delay_ms: 10,
            lock_retry_limit: 50,
            device_start_timeout_ms: 2000,
            initial_volume: 1.0,
        }
    }
}

impl EngineConfig {
    /// Get the config file path
    pub fn get_config_path(config_dir: &Path) -> PathBuf {
        config_dir.join("engine.json")
    }

    /// Load config from file, or return defaults if file doesn't exist
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::get_config_path(config_dir);

        if !path.exists() {
            debug!(path = %path.display(), "No engine config found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;

        info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        fs::create_dir_all(config_dir)?;

        let path = Self::get_config_path(config_dir);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;

        info!(path = %path.display(), "Saved engine config");
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2).contains(&self.output_channels) {
            return Err(ConfigError::Validation(format!(
                "output_channels must be 1 or 2, got {}",
                self.output_channels
            )));
        }
        if self.output_sample_rate == Some(0) || self.default_sample_rate == 0 {
            return Err(ConfigError::Validation("Sample rates must be non-zero".to_string()));
        }
        if self.buffer_frames == Some(0) {
            return Err(ConfigError::Validation("buffer_frames must be non-zero".to_string()));
        }
        if self.position_update_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "position_update_interval_ms must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.initial_volume) {
            return Err(ConfigError::Validation(format!(
                "initial_volume must be within [0, 1], got {}",
                self.initial_volume
            )));
        }
        Ok(())
    }

    pub fn position_update_interval(&self) -> Duration {
        Duration::from_millis(self.position_update_interval_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn device_start_timeout(&self) -> Duration {
        Duration::from_millis(self.device_start_timeout_ms)
    }
}
