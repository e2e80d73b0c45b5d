//! Profiler configuration
//!
//! Loaded from TOML or built from defaults. The authorization predicate is
//! not part of this struct: it is code, injected into
//! [`Profiler`](crate::profiler::Profiler) directly.
//!
//! ```toml
//! base_url_path = "/mini-profiler-resources"
//! auto_inject = true
//! retention_secs = 86400
//! eviction_interval_secs = 3600
//! trivial_threshold_ms = 2.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde_millis;
use crate::store::{DEFAULT_EVICTION_INTERVAL, DEFAULT_RETENTION};

pub const DEFAULT_BASE_URL_PATH: &str = "/mini-profiler-resources/";

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Horizontal placement of the client widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Left,
    Right,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Left => "left",
            Position::Right => "right",
        }
    }
}

/// Configuration for the profiler and its endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Prefix of every profiler endpoint; always ends with `/`
    pub base_url_path: String,

    /// Append the client bootstrap tag to HTML page responses
    pub auto_inject: bool,

    /// How long stored profiles are kept
    pub retention_secs: u64,

    /// How often the eviction pass runs
    pub eviction_interval_secs: u64,

    /// Timings at or under this many milliseconds are trivial
    pub trivial_threshold_ms: f64,

    pub position: Position,
    pub show_trivial: bool,
    pub show_children: bool,
    pub show_controls: bool,
    pub max_traces_to_show: u32,
    pub start_hidden: bool,
    pub collapse_results: bool,
    pub toggle_shortcut: Option<String>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            base_url_path: DEFAULT_BASE_URL_PATH.to_string(),
            auto_inject: true,
            retention_secs: DEFAULT_RETENTION.as_secs(),
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL.as_secs(),
            trivial_threshold_ms: 2.0,
            position: Position::Left,
            show_trivial: true,
            show_children: true,
            show_controls: true,
            max_traces_to_show: 15,
            start_hidden: false,
            collapse_results: false,
            toggle_shortcut: None,
        }
    }
}

impl ProfilerConfig {
    /// Parse TOML; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(s)?;
        config.normalize();
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Builder-style override of the base path (normalized)
    pub fn with_base_url_path(mut self, path: impl Into<String>) -> Self {
        self.base_url_path = path.into();
        self.normalize();
        self
    }

    /// Ensure `base_url_path` starts and ends with `/`
    pub fn normalize(&mut self) {
        if !self.base_url_path.starts_with('/') {
            self.base_url_path.insert(0, '/');
        }
        if !self.base_url_path.ends_with('/') {
            self.base_url_path.push('/');
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.retention_secs == 0 {
            return Err("retention_secs must be > 0".to_string());
        }

        if self.eviction_interval_secs == 0 {
            return Err("eviction_interval_secs must be > 0".to_string());
        }

        if !self.trivial_threshold_ms.is_finite() || self.trivial_threshold_ms < 0.0 {
            return Err(format!(
                "trivial_threshold_ms must be non-negative, got {}",
                self.trivial_threshold_ms
            ));
        }

        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn trivial_threshold(&self) -> Duration {
        serde_millis::from_millis(self.trivial_threshold_ms)
    }
}
