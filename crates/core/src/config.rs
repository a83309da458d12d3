//! TOML-based configuration for the merge engine.
//!
//! Sensitive values are referenced through `_env` fields naming an
//! environment variable; the value itself is resolved at runtime via
//! [`EngineConfig::resolve_env_vars`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::resolver::ResolutionStrategy;
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Process and scheduling settings.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Automatic conflict resolution settings.
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Telemetry forwarding settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Which process is loading the configuration.
///
/// Hosts that evaluate configuration in several processes pass the role
/// explicitly; one-time plugin setup only runs in `Main`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    #[default]
    Main,
    Worker,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Engine / scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Role of the current process.
    #[serde(default)]
    pub role: ProcessRole,

    /// Tracing filter level for `init_logging`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upper bound on files merged concurrently (default 8).
    #[serde(default = "default_max_parallel_files")]
    pub max_parallel_files: usize,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_max_parallel_files() -> usize {
    8
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            role: ProcessRole::default(),
            log_level: default_log_level(),
            max_parallel_files: default_max_parallel_files(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Fallback conflict resolution used when the owning plugin declines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Strategy applied to every plugin without an override.
    #[serde(default)]
    pub strategy: ResolutionStrategy,

    /// Per-plugin strategy overrides, keyed by plugin key.
    #[serde(default)]
    pub overrides: BTreeMap<String, ResolutionStrategy>,
}

impl ResolutionConfig {
    /// The strategy for files owned by `plugin_key` (`None` for opaque files).
    pub fn strategy_for(&self, plugin_key: Option<&str>) -> ResolutionStrategy {
        plugin_key
            .and_then(|key| self.overrides.get(key).copied())
            .unwrap_or(self.strategy)
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Telemetry forwarding configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Forward engine events when a token is available.
    #[serde(default)]
    pub enabled: bool,

    /// Environment variable holding the telemetry project token.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Token read from `token_env` at resolve time.
    #[serde(skip)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl EngineConfig {
    /// Read and parse an engine config file. Env-var references stay
    /// unresolved until [`resolve_env_vars`](Self::resolve_env_vars).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "reading engine config");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        debug!(role = %config.engine.role, "engine config parsed");
        Ok(config)
    }

    /// Resolve `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning and leaves the resolved field empty.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.telemetry.token_env {
            self.telemetry.token = resolve_optional_env(env_name, "telemetry.token_env");
        }
        Ok(())
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_parallel_files == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_parallel_files".into(),
                detail: "must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.engine.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "engine.log_level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.telemetry.enabled && self.telemetry.token_env.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.token_env".into(),
                detail: "telemetry is enabled but no token variable is named".into(),
            });
        }
        Ok(())
    }

    /// Load, resolve env references, and validate.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Value of `env_name`, or `None` with a warning when unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "env reference resolved");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env reference is empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env reference is unset");
            None
        }
    }
}
