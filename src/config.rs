// Configuration management for the recorder

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoding::AudioSettings;

const MB: u64 = 1024 * 1024;

/// Error type for configuration validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("offload_percentage must be in (0, 1], got {0}")]
    OffloadOutOfRange(f64),

    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Recorder configuration. Validated at session start and snapshotted into the
/// session, so edits only affect the next session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Root folder for session folders and clips
    pub storage_path: PathBuf,

    /// Segment rotation period
    pub segment_duration_minutes: u32,

    /// Hard ceiling; the session stops itself when it is reached
    pub max_recording_duration_minutes: u32,

    /// Buffer occupancy at which memory-pressure offload kicks in
    pub memory_threshold_bytes: u64,

    /// Share of buffered bytes dropped on memory pressure, in (0, 1]
    pub offload_percentage: f64,

    /// Circular buffer capacity in MiB
    pub circular_buffer_size_mb: u32,

    /// When false, audio frames are refused at ingest
    pub enable_audio_recording: bool,
    pub audio_sample_rate: u32,
    pub audio_bitrate: u32,

    /// How long stop waits for the writer to flush
    pub drain_timeout_secs: u32,

    /// Frames queued for the writer before new ones are not persisted
    pub writer_queue_capacity: usize,

    /// Attempts per frame before a write counts as failed
    pub write_retry_attempts: u32,

    /// Failed writes in a row tolerated before the session is stopped
    pub max_consecutive_write_failures: u32,

    /// Upper bound on clip encoding in `save_last_minutes`
    pub extract_timeout_secs: u32,

    /// Supervisor tick (max-duration check, CPU sampling)
    pub heartbeat_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            segment_duration_minutes: 5,
            max_recording_duration_minutes: 240,
            memory_threshold_bytes: 384 * MB,
            offload_percentage: 0.25,
            circular_buffer_size_mb: 512,
            enable_audio_recording: true,
            audio_sample_rate: 48000,
            audio_bitrate: 128000,
            drain_timeout_secs: 5,
            writer_queue_capacity: 1024,
            write_retry_attempts: 3,
            max_consecutive_write_failures: 5,
            extract_timeout_secs: 120,
            heartbeat_interval_ms: 500,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(value: u64, field: &'static str) -> Result<(), ConfigError> {
            if value == 0 {
                Err(ConfigError::NotPositive { field })
            } else {
                Ok(())
            }
        }

        positive(self.segment_duration_minutes as u64, "segment_duration_minutes")?;
        positive(
            self.max_recording_duration_minutes as u64,
            "max_recording_duration_minutes",
        )?;
        positive(self.memory_threshold_bytes, "memory_threshold_bytes")?;
        positive(self.circular_buffer_size_mb as u64, "circular_buffer_size_mb")?;
        positive(self.drain_timeout_secs as u64, "drain_timeout_secs")?;
        positive(self.writer_queue_capacity as u64, "writer_queue_capacity")?;
        positive(self.write_retry_attempts as u64, "write_retry_attempts")?;
        positive(
            self.max_consecutive_write_failures as u64,
            "max_consecutive_write_failures",
        )?;
        positive(self.extract_timeout_secs as u64, "extract_timeout_secs")?;
        positive(self.heartbeat_interval_ms, "heartbeat_interval_ms")?;

        if !(self.offload_percentage > 0.0 && self.offload_percentage <= 1.0) {
            return Err(ConfigError::OffloadOutOfRange(self.offload_percentage));
        }

        if self.enable_audio_recording {
            positive(self.audio_sample_rate as u64, "audio_sample_rate")?;
            positive(self.audio_bitrate as u64, "audio_bitrate")?;
        }

        if self.memory_threshold_bytes >= self.buffer_capacity_bytes() as u64 {
            log::warn!(
                "[Config] memory_threshold_bytes ({}) is not below the buffer capacity ({}); \
                 capacity eviction will act before memory pressure does",
                self.memory_threshold_bytes,
                self.buffer_capacity_bytes()
            );
        }

        Ok(())
    }

    pub fn buffer_capacity_bytes(&self) -> usize {
        (self.circular_buffer_size_mb as u64 * MB) as usize
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_minutes as u64 * 60)
    }

    pub fn max_recording_duration(&self) -> Duration {
        Duration::from_secs(self.max_recording_duration_minutes as u64 * 60)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs as u64)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            enabled: self.enable_audio_recording,
            sample_rate: self.audio_sample_rate,
            bitrate: self.audio_bitrate,
        }
    }

    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("[Config] {}, using defaults", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk (write to a temp file, then rename over the target)
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }
}

/// Get the default storage path for recordings
fn get_default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Rewind")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rewind")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.segment_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_zero_capacity_and_bad_offload() {
        let config = RecorderConfig {
            circular_buffer_size_mb: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "circular_buffer_size_mb"
            })
        );

        for bad in [0.0, -0.5, 1.5] {
            let config = RecorderConfig {
                offload_percentage: bad,
                ..Default::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::OffloadOutOfRange(bad)));
        }

        let full = RecorderConfig {
            offload_percentage: 1.0,
            ..Default::default()
        };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_audio_fields_only_checked_when_enabled() {
        let mut config = RecorderConfig {
            audio_sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.enable_audio_recording = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = RecorderConfig {
            segment_duration_minutes: 1,
            storage_path: tmp.path().to_path_buf(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RecorderConfig::load(&path).unwrap(), config);

        // Missing keys fall back to defaults
        std::fs::write(&path, "segment_duration_minutes = 7\n").unwrap();
        let loaded = RecorderConfig::load_or_default(&path);
        assert_eq!(loaded.segment_duration_minutes, 7);
        assert_eq!(loaded.circular_buffer_size_mb, 512);
    }

    #[test]
    fn test_unparseable_file_falls_back_to_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "segment_duration_minutes = \"soon\"").unwrap();
        assert!(matches!(
            RecorderConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(
            RecorderConfig::load_or_default(&path),
            RecorderConfig::default()
        );
    }
}
