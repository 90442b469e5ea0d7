//! Per-singleton lifecycle state tracking

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;

/// Lifecycle state of a singleton service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered, not yet constructed
    Uninitialized,
    /// Construction or init in progress
    Initializing,
    /// Initialized and serving
    Ready,
    /// Shutdown in progress
    ShuttingDown,
    /// Shut down cleanly
    Terminated,
    /// Init or shutdown failed
    Failed,
}

impl ServiceState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::{Failed, Initializing, Ready, ShuttingDown, Terminated, Uninitialized};
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Terminated)
                | (ShuttingDown, Failed)
        )
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Initializing => "initializing",
            ServiceState::Ready => "ready",
            ServiceState::ShuttingDown => "shutting down",
            ServiceState::Terminated => "terminated",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current state of a singleton plus when it last changed
#[derive(Debug, Clone)]
pub(crate) struct StateRecord {
    state: ServiceState,
    last_state_change: DateTime<Utc>,
    error: Option<String>,
}

impl StateRecord {
    pub(crate) fn new() -> Self {
        Self {
            state: ServiceState::Uninitialized,
            last_state_change: Utc::now(),
            error: None,
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.state
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub(crate) fn transition(&mut self, service: &str, next: ServiceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "service '{}' cannot go from {} to {}",
                service, self.state, next
            )));
        }
        self.state = next;
        self.last_state_change = Utc::now();
        Ok(())
    }

    /// Move to [`ServiceState::Failed`], remembering why
    pub(crate) fn fail(&mut self, service: &str, error: &Error) -> Result<()> {
        self.transition(service, ServiceState::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn snapshot(&self, name: &str) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            state: self.state,
            last_state_change: self.last_state_change,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a singleton's state
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Service id
    pub name: String,
    /// Current state
    pub state: ServiceState,
    /// When the state last changed
    pub last_state_change: DateTime<Utc>,
    /// Failure message, if the service failed
    pub error: Option<String>,
}

/// Health of a single service as reported by a health sweep
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Health check passed
    Healthy,
    /// Health check failed
    Unhealthy(String),
    /// Service is not ready, so it was not checked
    Unknown,
}
