//! Configuration management for the video analysis workspace.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Repetition analysis settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Background job runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Event log storage settings
    #[serde(default)]
    pub event_log: EventLogConfig,

    /// External pose estimation settings
    #[serde(default)]
    pub pose: PoseConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Repetition analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Joint whose angle is tracked (knee, elbow, hip)
    pub joint: String,

    /// Angle at or below which a repetition starts
    pub down_threshold: f64,

    /// Angle at or above which a repetition closes
    pub up_threshold: f64,

    /// Minimum completed repetitions for a successful execution
    pub min_reps: usize,
}

/// Job runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of analysis workers
    pub workers: usize,

    /// Maximum number of jobs waiting for a worker
    pub queue_capacity: usize,

    /// Per-job timeout in seconds (None = no timeout)
    pub job_timeout_seconds: Option<u64>,

    /// Minimum percentage jump that forces a progress record
    pub progress_min_step: u32,

    /// Minimum time between progress records for smaller jumps
    pub progress_min_interval_ms: u64,
}

/// Event log backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLogBackend {
    Jsonl,
    Sqlite,
}

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Storage backend
    pub backend: EventLogBackend,

    /// Log file path (relative to data directory or absolute)
    pub path: String,
}

/// External pose estimation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseConfig {
    /// Pose estimation program (None = inference unavailable)
    pub command: Option<String>,

    /// Program arguments; `{video}` is replaced with the video path
    pub args: Vec<String>,

    /// Model name passed to the program through `{model}`
    pub model: String,

    /// Model weights file that must exist before inference can run
    pub model_path: Option<String>,

    /// Minimum keypoint confidence for a landmark to be used
    pub min_confidence: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            joint: "knee".to_string(),
            down_threshold: 90.0,
            up_threshold: 160.0,
            min_reps: 2,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 64,
            job_timeout_seconds: Some(600),
            progress_min_step: 5,
            progress_min_interval_ms: 1500,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            backend: EventLogBackend::Jsonl,
            path: "uploads/analysis_logs.jsonl".to_string(),
        }
    }
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec![
                "--model".to_string(),
                "{model}".to_string(),
                "{video}".to_string(),
            ],
            model: "yolov8n-pose".to_string(),
            model_path: None,
            min_confidence: 0.3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            analysis: AnalysisConfig::default(),
            runtime: RuntimeConfig::default(),
            event_log: EventLogConfig::default(),
            pose: PoseConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Get the data directory as configured (may be relative)
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
    }

    /// Get the absolute path for the event log store
    pub fn event_log_path(&self) -> PathBuf {
        self.resolve(&self.event_log.path)
    }

    /// Get the model weights path, if one is configured
    pub fn model_path(&self) -> Option<PathBuf> {
        self.pose.model_path.as_deref().map(|p| self.resolve(p))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}
