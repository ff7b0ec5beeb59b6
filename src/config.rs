//! Project configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `TSPROCESS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! TSPROCESS_PROJECT__NAME=la_habra
//! TSPROCESS_CACHE__CAPACITY=5000
//! TSPROCESS_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ts_process::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("tsprocess.toml")?;
//!     println!("Store: {}", settings.store_path().display());
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, TsError};
use crate::store::DEFAULT_WINDOW_CAPACITY;
use crate::tracker::DEFAULT_BUFFER_CAPACITY;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Project identity and location
    pub project: ProjectConfig,
    /// In-memory recency window in front of the durable store
    #[serde(default)]
    pub cache: CacheConfig,
    /// Incident index buffering
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    /// Project name; also names the store file and the tracker container
    pub name: String,
    /// Directory holding the store file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Recency window configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of serialized records kept in memory
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
}

/// Incident tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    /// Number of incidents whose pending fingerprints are buffered before flushing
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON formatted log lines
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_cache_capacity() -> u64 {
    DEFAULT_WINDOW_CAPACITY
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                name: "project".to_string(),
                data_dir: default_data_dir(),
            },
            cache: CacheConfig::default(),
            tracker: TrackerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Settings for a named project stored under `data_dir`, all else default.
    pub fn for_project(name: &str, data_dir: impl Into<PathBuf>) -> Self {
        let mut settings = Self::default();
        settings.project.name = name.to_string();
        settings.project.data_dir = data_dir.into();
        settings
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`TSPROCESS_` prefix)
    /// 2. The TOML file
    /// 3. Built-in defaults
    ///
    /// # Errors
    ///
    /// Returns `TsError::Config` if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TSPROCESS_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.project.name.trim().is_empty() {
            return Err(TsError::Config("project name cannot be empty".to_string()));
        }

        if self.cache.capacity == 0 {
            return Err(TsError::Config(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }

        if self.tracker.buffer_capacity == 0 {
            return Err(TsError::Config(
                "tracker.buffer_capacity must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(TsError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Path of the SQLite file backing the result store.
    pub fn store_path(&self) -> PathBuf {
        self.project
            .data_dir
            .join(format!("{}_db.sqlite", self.project.name))
    }

    /// Name of the nested container holding the incident index.
    pub fn tracker_name(&self) -> String {
        format!("{}_dbtracker", self.project.name)
    }
}
