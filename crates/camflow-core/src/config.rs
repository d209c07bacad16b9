// crates/camflow-core/src/config.rs
//
// Runtime configuration for a pipeline instance. Defaults mirror the
// operational limits the control surface documents; a JSON file can override
// any subset of fields.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pacing::Thresholds;
use crate::state::{default_pool_capacity, DEFAULT_QUEUE_CAPACITY, MAX_CAMERAS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for the process-wide log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
    /// Optional on-disk sink. `None` keeps console-only output.
    pub file: Option<PathBuf>,
    /// Rotate the file sink once it reaches this many megabytes. 0 disables
    /// rotation.
    pub max_file_size_mb: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level:            "info".into(),
            file:             None,
            max_file_size_mb: 0,
        }
    }
}

/// Process-wide pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_cameras:    usize,
    /// Frame carriers shared by all cameras. 0 is rejected at initialize.
    pub pool_capacity:  usize,
    /// Decoded frames buffered per camera between decode and delivery.
    pub queue_capacity: usize,
    pub thresholds:     Thresholds,
    pub log:            LogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cameras:    MAX_CAMERAS,
            pool_capacity:  default_pool_capacity(MAX_CAMERAS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thresholds:     Thresholds::default(),
            log:            LogConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// The control surface accepts any integer for the target rate; zero and
/// negative values are coerced to 1 FPS.
pub fn coerce_target_fps(requested: i32) -> u32 {
    if requested <= 0 {
        1
    } else {
        requested as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_fps_coercion() {
        assert_eq!(coerce_target_fps(-5), 1);
        assert_eq!(coerce_target_fps(0), 1);
        assert_eq!(coerce_target_fps(1), 1);
        assert_eq!(coerce_target_fps(25), 25);
    }

    #[test]
    fn defaults_match_contract() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_cameras, 128);
        assert_eq!(cfg.pool_capacity, 512);
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(cfg.thresholds.stall_timeout_sec, 30.0);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{ "queue_capacity": 8, "log": { "level": "debug" } }"#)
                .expect("parse");
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.max_cameras, 128);
    }
}
