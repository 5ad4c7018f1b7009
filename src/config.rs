use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the profiler runtime.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared aggregation store configuration.
    #[serde(default)]
    pub shared: SharedConfig,

    /// How often sessions fold local data into the shared store.
    /// Zero disables automatic collection. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub collect_interval: Duration,

    /// Start with the global activation switch on. Default: false.
    #[serde(default)]
    pub enabled_global: bool,

    /// Initial value of the local switch for new sessions. Default: false.
    #[serde(default)]
    pub enabled_local: bool,
}

/// Shared store sizing. All structures are allocated once at startup and
/// never grow, so these caps bound the profiler's memory deterministically.
#[derive(Debug, Clone, Deserialize)]
pub struct SharedConfig {
    /// Enable the shared store. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum functions tracked in the shared store. Default: 2000.
    #[serde(default = "default_max_functions")]
    pub max_functions: usize,

    /// Maximum distinct call paths tracked in the shared store.
    /// Default: 20000.
    #[serde(default = "default_max_call_paths")]
    pub max_call_paths: usize,

    /// Size of the shared per-line counter arena. Default: 200000.
    #[serde(default = "default_max_line_slots")]
    pub max_line_slots: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_functions() -> usize {
    2_000
}

fn default_max_call_paths() -> usize {
    20_000
}

fn default_max_line_slots() -> usize {
    200_000
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shared: SharedConfig::default(),
            collect_interval: Duration::ZERO,
            enabled_global: false,
            enabled_local: false,
        }
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_functions: default_max_functions(),
            max_call_paths: default_max_call_paths(),
            max_line_slots: default_max_line_slots(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.shared.enabled {
            if self.shared.max_functions == 0 {
                bail!("shared.max_functions must be positive");
            }
            if self.shared.max_call_paths == 0 {
                bail!("shared.max_call_paths must be positive");
            }
            if self.shared.max_line_slots == 0 {
                bail!("shared.max_line_slots must be positive");
            }
        } else if !self.collect_interval.is_zero() {
            bail!("collect_interval requires shared.enabled");
        }

        Ok(())
    }
}
