//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - fusor.toml (default configuration)
//! - fusor.local.toml (git-ignored local overrides)
//! - Environment variables (FUSOR_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # fusor.toml
//! [device]
//! warp_size = 32
//! multiprocessor_count = 80
//!
//! [cache]
//! enabled = true
//! debug_dump_dir = "/tmp/fusor-kernels"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! FUSOR_DEVICE__WARP_SIZE=64
//! FUSOR_LOGGING__LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Physical properties of the target device used by the scheduler cost model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of lanes in a warp
    #[serde(default = "default_warp_size")]
    pub warp_size: u32,

    /// Number of streaming multiprocessors
    #[serde(default = "default_mp_count")]
    pub multiprocessor_count: u32,

    /// Maximum resident threads per multiprocessor
    #[serde(default = "default_threads_per_mp")]
    pub max_threads_per_multiprocessor: u32,

    /// Maximum threads per block
    #[serde(default = "default_threads_per_block")]
    pub max_threads_per_block: u32,
}

/// Execution cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the two-level execution cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory to dump emitted kernel source to, one file per compiled
    /// kernel id (None = no dump)
    #[serde(default)]
    pub debug_dump_dir: Option<PathBuf>,

    /// Expose the fallback hook: callers may run the original graph directly
    /// when compilation fails (the core does not implement the fallback)
    #[serde(default)]
    pub enable_fallback: bool,
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Unroll factor for pointwise kernels
    #[serde(default = "default_unroll_factor")]
    pub unroll_factor: u32,

    /// Threads per block for pointwise kernels
    #[serde(default = "default_pointwise_block")]
    pub pointwise_block_size: u32,

    /// Force-disable unrolling regardless of fusion contents
    #[serde(default)]
    pub disable_unroll: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_warp_size() -> u32 {
    32
}
fn default_mp_count() -> u32 {
    80
}
fn default_threads_per_mp() -> u32 {
    2048
}
fn default_threads_per_block() -> u32 {
    1024
}
fn default_unroll_factor() -> u32 {
    4
}
fn default_pointwise_block() -> u32 {
    128
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. fusor.toml (base configuration)
    /// 2. fusor.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (FUSOR_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("fusor.toml"))
            .merge(Toml::file("fusor.local.toml"))
            .merge(Env::prefixed("FUSOR_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FUSOR_").split("__"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            warp_size: default_warp_size(),
            multiprocessor_count: default_mp_count(),
            max_threads_per_multiprocessor: default_threads_per_mp(),
            max_threads_per_block: default_threads_per_block(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            debug_dump_dir: None,
            enable_fallback: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            unroll_factor: default_unroll_factor(),
            pointwise_block_size: default_pointwise_block(),
            disable_unroll: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Install a global tracing subscriber according to the logging section.
///
/// Intended for binaries and test harnesses; returns quietly if a subscriber
/// is already installed.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber installed by the embedding application wins.
    drop(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.warp_size, 32);
        assert_eq!(config.scheduler.pointwise_block_size, 128);
        assert_eq!(config.scheduler.unroll_factor, 4);
        assert!(config.cache.enabled);
        assert!(config.cache.debug_dump_dir.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).expect("serialize config");

        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[scheduler]"));
        assert!(toml_str.contains("warp_size"));
    }

    #[test]
    fn test_config_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[device]\nwarp_size = 64\n").expect("write");
        let config =
            Config::from_file(file.path().to_str().expect("utf8 path")).expect("load config");
        assert_eq!(config.device.warp_size, 64);
        // Untouched sections fall back to defaults
        assert_eq!(config.scheduler.unroll_factor, 4);
    }
}
