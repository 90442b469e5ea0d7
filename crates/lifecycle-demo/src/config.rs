//! Demo configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use service_lifecycle::LifecycleConfig;
use std::path::Path;
use std::time::Duration;

/// Top-level demo configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoConfig {
    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Phase timeouts and supervisor settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Demo service knobs
    #[serde(default)]
    pub workload: Workload,
}

/// Knobs for the demo services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    /// Ticks the main runner performs before finishing
    #[serde(default = "default_ticks")]
    pub ticks: u32,

    /// Delay between ticks in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Delay between heartbeats in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Phase in which a demo service fails on purpose
    #[serde(default)]
    pub fail: Option<FailurePoint>,
}

/// Where to inject a failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePoint {
    /// Metrics init fails
    Init,
    /// Metrics reports unhealthy
    HealthCheck,
    /// Ticker fails halfway through
    Run,
    /// Metrics shutdown fails
    Shutdown,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ticks() -> u32 {
    5
}

fn default_tick_interval() -> u64 {
    200
}

fn default_heartbeat_interval() -> u64 {
    300
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            ticks: default_ticks(),
            tick_interval_ms: default_tick_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            fail: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            lifecycle: LifecycleConfig::default(),
            workload: Workload::default(),
        }
    }
}

impl Workload {
    /// Tick interval as a duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl DemoConfig {
    /// Load the configuration, falling back to defaults without a path
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse and validate a YAML document
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: DemoConfig = serde_yaml::from_str(yaml).map_err(service_lifecycle::Error::from)?;
        config.lifecycle.validate()?;
        if config.workload.ticks == 0 {
            return Err(service_lifecycle::Error::config("workload.ticks must be greater than zero").into());
        }
        Ok(config)
    }
}
