//! TOML configuration for the harness.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::HandleLifetime;
use crate::orchestrator::OrchestratorSettings;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "BENCHHOST_CONFIG";
/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "benchhost.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded harness configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scale = self.engine.time_scale;
        ensure!(
            scale.is_finite() && scale >= 0.0,
            "engine.time_scale must be a finite, non-negative number, got {}",
            scale
        );
        Ok(())
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (an error here is returned, not skipped).
    /// 2. The file named by `BENCHHOST_CONFIG`.
    /// 3. `./benchhost.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BENCHHOST_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay before the first progress poll, in milliseconds.
    pub warm_up_ms: u64,
    /// Interval between progress polls, in milliseconds.
    pub poll_interval_ms: u64,
    pub handle_lifetime: HandleLifetime,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            warm_up_ms: 300,
            poll_interval_ms: 300,
            handle_lifetime: HandleLifetime::Shared,
        }
    }
}

impl OrchestratorConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            warm_up: Duration::from_millis(self.warm_up_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            handle_lifetime: self.handle_lifetime,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Multiplier on simulated test durations. `0.0` completes runs instantly.
    pub time_scale: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { time_scale: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
