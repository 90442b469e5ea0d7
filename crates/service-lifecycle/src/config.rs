//! Lifecycle configuration
//!
//! Timeouts are expressed in whole seconds.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How a runner participates in overall completion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    /// `true` for main runners (completion waits on them), `false` for
    /// best-effort secondary runners
    pub wait: bool,
}

impl RunConfig {
    /// Main runner configuration
    pub const MAIN: RunConfig = RunConfig { wait: true };

    /// Secondary runner configuration
    pub const SECONDARY: RunConfig = RunConfig { wait: false };
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::MAIN
    }
}

/// Runner supervisor configuration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Applied to runners registered without an explicit [`RunConfig`]
    #[serde(default)]
    pub default_run: RunConfig,
}

/// Phase timeouts and supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Per-service init timeout in seconds
    #[serde(default = "default_init_timeout")]
    pub init_timeout: u64,

    /// Per-service health check timeout in seconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// Per-service shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Runner supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_init_timeout() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: default_init_timeout(),
            health_check_timeout: default_health_check_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LifecycleConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Reject zero timeouts
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("init_timeout", self.init_timeout),
            ("health_check_timeout", self.health_check_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Init timeout as a duration
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout)
    }

    /// Health check timeout as a duration
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    /// Shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}
