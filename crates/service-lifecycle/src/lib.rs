//! Dependency-ordered service lifecycle orchestration
//!
//! Services are registered as [`ServiceDescriptor`]s that declare what they
//! require. The [`LifecycleOrchestrator`] resolves those requirements into a
//! [`DependencyGraph`] and drives every service through its lifecycle:
//!
//! - **validate**: descriptor self-checks, all problems reported together
//! - **init**: dependencies first, fail fast with rollback
//! - **health check**: dependencies first, fail fast
//! - **run**: background runners under a [`RunnerSupervisor`]
//! - **shutdown**: dependents first, every error collected
//!
//! Every phase takes a [`Context`] carrying cancellation and deadlines.
//!
//! # Example
//!
//! ```no_run
//! use service_lifecycle::{Context, LifecycleOrchestrator, Service, ServiceDescriptor};
//!
//! struct Database;
//! impl Service for Database {}
//!
//! struct Api;
//! impl Service for Api {}
//!
//! # async fn example() -> service_lifecycle::Result<()> {
//! let mut orchestrator = LifecycleOrchestrator::default();
//! orchestrator.register(ServiceDescriptor::singleton(|_| Ok(Database)).build())?;
//! orchestrator.register(
//!     ServiceDescriptor::singleton(|deps| {
//!         let _db = deps.get::<Database>()?;
//!         Ok(Api)
//!     })
//!     .requires::<Database>()
//!     .build(),
//! )?;
//!
//! let ctx = Context::background();
//! orchestrator.validate(&ctx).await?;
//! orchestrator.init(&ctx).await?;
//! orchestrator.health_check(&ctx).await?;
//! orchestrator.shutdown(&ctx).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod resolver;
pub mod state;
pub mod supervisor;

pub use config::{LifecycleConfig, RunConfig, SupervisorConfig};
pub use context::Context;
pub use descriptor::{
    Arg, ArgSpec, Args, ContextHook, Dependencies, DescriptorBuilder, Instance, InstanceHook,
    RunnerSettings, Service, ServiceDescriptor, ServiceKind, service_id,
};
pub use error::{AggregateError, Error, Phase, Result, is_cancellation};
pub use graph::{DependencyGraph, TopologicalOrder};
pub use orchestrator::LifecycleOrchestrator;
pub use resolver::DependencyResolver;
pub use state::{HealthStatus, ServiceState, ServiceStatus};
pub use supervisor::{RunFn, Runner, RunnerSupervisor};

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        Args, Context, Dependencies, Error, LifecycleConfig, LifecycleOrchestrator, Result,
        RunConfig, Service, ServiceDescriptor, ServiceState,
    };
}
