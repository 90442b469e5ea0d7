//! Error types for lifecycle operations

use std::fmt;
use thiserror::Error;

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Descriptor self-checks
    Validate,
    /// Construction and initialization
    Init,
    /// Health checking
    HealthCheck,
    /// Background runner execution
    Run,
    /// Teardown
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Validate => "validate",
            Phase::Init => "init",
            Phase::HealthCheck => "health-check",
            Phase::Run => "run",
            Phase::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Error types for lifecycle operations
#[derive(Error, Debug)]
pub enum Error {
    /// Requested service is not part of the dependency graph
    #[error("Service not found: {name} (known services: {})", .available.join(", "))]
    ServiceNotFound {
        /// Requested service id
        name: String,
        /// Ids known to the orchestrator
        available: Vec<String>,
    },

    /// A service with the same id is already registered
    #[error("Service already exists: {0}")]
    ServiceExists(String),

    /// Service could not be constructed or initialized
    #[error("Service '{service}' failed to initialize")]
    ServiceInitFailed {
        /// Offending service id
        service: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Descriptor failed its self-check
    #[error("Service '{service}' is invalid: {reason}")]
    ServiceInvalid {
        /// Offending service id
        service: String,
        /// What is wrong with it
        reason: String,
    },

    /// Service reported itself unhealthy
    #[error("Service '{service}' failed its health check")]
    HealthCheckFailed {
        /// Offending service id
        service: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A hook or service method returned an error
    #[error("Service '{service}' {phase} failed: {source}")]
    Lifecycle {
        /// Offending service id
        service: String,
        /// Phase that was running
        phase: Phase,
        /// Error returned by the hook or method
        #[source]
        source: anyhow::Error,
    },

    /// Adding the edge would introduce a dependency cycle
    #[error("Circular dependency detected: {from} -> {to}")]
    CycleDetected {
        /// Dependent end of the rejected edge
        from: String,
        /// Dependency end of the rejected edge
        to: String,
    },

    /// Edge endpoint is not a vertex of the graph
    #[error("Vertex not found: {0}")]
    VertexNotFound(String),

    /// Edge is already present in the graph
    #[error("Edge already exists: {from} -> {to}")]
    EdgeAlreadyExists {
        /// Dependent end
        from: String,
        /// Dependency end
        to: String,
    },

    /// Runner set contains no main runner
    #[error("No main runners: at least one runner must be configured with wait = true")]
    NoMainRunners,

    /// Factory argument has the wrong type
    #[error(
        "Invalid argument type for '{service}' at position {index}: expected {expected}, got {found}"
    )]
    InvalidArgumentType {
        /// Factory service id
        service: String,
        /// Zero-based argument position
        index: usize,
        /// Declared parameter type
        expected: &'static str,
        /// Type actually supplied
        found: &'static str,
    },

    /// Factory received the wrong number of arguments
    #[error("Invalid argument count for '{service}': expected {expected}, got {found}")]
    InvalidArgumentCount {
        /// Factory service id
        service: String,
        /// Declared arity
        expected: usize,
        /// Number of arguments supplied
        found: usize,
    },

    /// Operation is not allowed in the orchestrator's or service's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Context was canceled
    #[error("context canceled")]
    Canceled,

    /// Context deadline elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Several errors collected by an aggregating phase
    #[error(transparent)]
    Multiple(#[from] AggregateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to parse YAML configuration
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a service-invalid error
    pub fn invalid(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceInvalid {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Attribute a hook or method failure to a service and phase
    pub fn lifecycle(service: impl Into<String>, phase: Phase, source: anyhow::Error) -> Self {
        Self::Lifecycle {
            service: service.into(),
            phase,
            source,
        }
    }

    /// Whether this is exactly the cooperative-cancellation error
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Canceled => 130,
            Error::ServiceInvalid { .. }
            | Error::CycleDetected { .. }
            | Error::VertexNotFound(_)
            | Error::EdgeAlreadyExists { .. }
            | Error::NoMainRunners
            | Error::ServiceExists(_)
            | Error::Config(_)
            | Error::Yaml(_) => 2,
            Error::Multiple(aggregate) => aggregate
                .errors()
                .iter()
                .map(|(_, e)| e.exit_code())
                .max()
                .unwrap_or(1),
            _ => 1,
        }
    }
}

/// Whether an error returned by a hook or runner is exactly [`Error::Canceled`]
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>().is_some_and(Error::is_canceled)
}

/// Stable-order collection of per-service errors
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<(String, Error)>,
}

impl AggregateError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error for a service
    pub fn push(&mut self, service: impl Into<String>, error: Error) {
        self.errors.push((service.into(), error));
    }

    /// Collected `(service id, error)` pairs, in the order they occurred
    pub fn errors(&self) -> &[(String, Error)] {
        &self.errors
    }

    /// Consume the aggregate into its pairs
    pub fn into_errors(self) -> Vec<(String, Error)> {
        self.errors
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ids of the services that failed
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(service, _)| service.as_str())
    }

    /// `Ok(())` when empty, otherwise the aggregate as an [`Error`]
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Multiple(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} service error(s)", self.errors.len())?;
        for (service, error) in &self.errors {
            write!(f, "\n  {service}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|(_, e)| e as &(dyn std::error::Error + 'static))
    }
}
