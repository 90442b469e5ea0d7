//! Dependency-driven lifecycle orchestration
//!
//! The orchestrator owns the registered descriptors, builds the dependency
//! graph on [`LifecycleOrchestrator::init`] and drives every phase over it:
//!
//! | Phase          | Order              | Failure policy          |
//! |----------------|--------------------|-------------------------|
//! | validate       | registration       | collect every error     |
//! | init           | dependencies first | stop at first, roll back|
//! | health check   | dependencies first | stop at first           |
//! | run            | concurrent         | see [`RunnerSupervisor`]|
//! | shutdown       | dependents first   | collect every error     |

use crate::descriptor::{ServiceMap, service_id};
use crate::state::{HealthStatus, ServiceStatus};
use crate::{
    AggregateError, Args, Context, DependencyGraph, DependencyResolver, Error, Instance,
    LifecycleConfig, Phase, Result, Runner, RunnerSupervisor, ServiceDescriptor, ServiceState,
};
use futures::future::FutureExt;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Drives validate, init, health check, run and shutdown over registered services
pub struct LifecycleOrchestrator {
    config: LifecycleConfig,
    services: ServiceMap,
    graph: OnceLock<DependencyGraph<Arc<ServiceDescriptor>>>,
    supervisor: RunnerSupervisor,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator with no services
    pub fn new(config: LifecycleConfig) -> Self {
        let supervisor = RunnerSupervisor::new(config.supervisor);
        Self {
            config,
            services: ServiceMap::new(),
            graph: OnceLock::new(),
            supervisor,
        }
    }

    /// Register a service; only allowed before init
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        if self.graph.get().is_some() {
            return Err(Error::invalid_state(format!(
                "cannot register '{}' after init",
                descriptor.id()
            )));
        }
        if self.services.contains_key(descriptor.id()) {
            return Err(Error::ServiceExists(descriptor.id().to_string()));
        }
        debug!("Registered service '{}'", descriptor.id());
        self.services
            .insert(descriptor.id().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Registered descriptors, in registration order
    pub fn services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.services.values().cloned().collect()
    }

    /// Dependency graph, once init has built it
    pub fn graph(&self) -> Option<&DependencyGraph<Arc<ServiceDescriptor>>> {
        self.graph.get()
    }

    /// Runner supervisor used by [`LifecycleOrchestrator::run_services`]
    pub fn supervisor(&self) -> &RunnerSupervisor {
        &self.supervisor
    }

    /// State of every singleton, in registration order
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services
            .values()
            .filter(|descriptor| descriptor.is_singleton())
            .map(|descriptor| descriptor.status())
            .collect()
    }

    fn initialized_graph(&self) -> Result<&DependencyGraph<Arc<ServiceDescriptor>>> {
        self.graph
            .get()
            .ok_or_else(|| Error::invalid_state("services are not initialized"))
    }

    /// Run every descriptor's self-check and report all problems at once
    pub async fn validate(&self, ctx: &Context) -> Result<()> {
        async {
            let mut aggregate = AggregateError::new();
            for (id, descriptor) in &self.services {
                if let Err(e) = descriptor.validate(ctx).await {
                    warn!("Validation failed for '{}': {}", id, e);
                    aggregate.push(id.clone(), e);
                }
            }
            info!(
                "Validated {} services, {} invalid",
                self.services.len(),
                aggregate.len()
            );
            aggregate.into_result()
        }
        .instrument(info_span!("validate"))
        .await
    }

    /// Resolve dependencies and initialize singletons, dependencies first
    ///
    /// Stops at the first failing service. Everything already initialized is
    /// shut down again, in reverse order, before the failure is returned.
    pub async fn init(&self, ctx: &Context) -> Result<()> {
        async {
            if self.graph.get().is_some() {
                return Err(Error::invalid_state("services are already initialized"));
            }
            let graph = DependencyResolver::new(&self.services).build()?;
            self.graph
                .set(graph)
                .map_err(|_| Error::invalid_state("services are already initialized"))?;
            let graph = self.initialized_graph()?;
            info!(
                "Initializing {} services: {:?}",
                graph.len(),
                graph.topological_order().collect::<Vec<_>>()
            );

            let mut started: Vec<&Arc<ServiceDescriptor>> = Vec::new();
            for id in graph.topological_order() {
                let Some(descriptor) = graph.get(id) else {
                    continue;
                };
                if !descriptor.is_singleton() {
                    debug!("Skipping factory '{}'", id);
                    continue;
                }

                if let Err(e) = self.init_service(ctx, descriptor).await {
                    warn!("Failed to initialize '{}': {}", id, e);
                    descriptor.fail(&e);
                    self.rollback(&started).await;
                    return Err(Error::ServiceInitFailed {
                        service: id.to_string(),
                        source: Box::new(e),
                    });
                }
                started.push(descriptor);
            }

            info!("All services initialized");
            Ok(())
        }
        .instrument(info_span!("init"))
        .await
    }

    async fn init_service(&self, ctx: &Context, descriptor: &ServiceDescriptor) -> Result<()> {
        let id = descriptor.id();
        descriptor.transition(ServiceState::Initializing)?;
        let phase_ctx = ctx.with_timeout(self.config.init_timeout());

        phase_ctx
            .run(descriptor.before_init(&phase_ctx))
            .await?
            .map_err(|e| Error::lifecycle(id, Phase::Init, e))?;

        let instance = descriptor.construct(&self.services, &Args::new())?;

        phase_ctx
            .run(descriptor.call(Phase::Init, &phase_ctx, &instance))
            .await?
            .map_err(|e| Error::lifecycle(id, Phase::Init, e))?;

        descriptor.store(instance)?;
        descriptor.transition(ServiceState::Ready)?;
        info!("Service '{}' is ready", id);
        Ok(())
    }

    async fn rollback(&self, started: &[&Arc<ServiceDescriptor>]) {
        if started.is_empty() {
            return;
        }
        warn!("Rolling back {} initialized services", started.len());
        // The caller's context may be the reason init failed.
        let ctx = Context::background();
        for descriptor in started.iter().rev() {
            if let Err(e) = self.shutdown_service(&ctx, descriptor).await {
                error!("Rollback of '{}' failed: {}", descriptor.id(), e);
            }
        }
    }

    /// Check ready singletons in dependency order, stopping at the first failure
    pub async fn health_check(&self, ctx: &Context) -> Result<()> {
        async {
            let graph = self.initialized_graph()?;
            for id in graph.topological_order() {
                let Some((descriptor, instance)) = ready_singleton(graph, id) else {
                    continue;
                };
                if let Err(e) = self.check_service(ctx, descriptor, instance).await {
                    warn!("Health check failed for '{}': {}", id, e);
                    return Err(Error::HealthCheckFailed {
                        service: id.to_string(),
                        source: Box::new(e),
                    });
                }
            }
            debug!("All services healthy");
            Ok(())
        }
        .instrument(info_span!("health_check"))
        .await
    }

    /// Check every singleton and report each one's health
    ///
    /// Unlike [`LifecycleOrchestrator::health_check`] this never stops early.
    /// Singletons that are not ready are reported as
    /// [`HealthStatus::Unknown`].
    pub async fn health_report(&self, ctx: &Context) -> Vec<(String, HealthStatus)> {
        let Some(graph) = self.graph.get() else {
            return Vec::new();
        };
        let mut report = Vec::new();
        for id in graph.topological_order() {
            let Some(descriptor) = graph.get(id) else {
                continue;
            };
            if !descriptor.is_singleton() {
                continue;
            }
            let status = match ready_singleton(graph, id) {
                None => HealthStatus::Unknown,
                Some((descriptor, instance)) => {
                    match self.check_service(ctx, descriptor, instance).await {
                        Ok(()) => HealthStatus::Healthy,
                        Err(e) => HealthStatus::Unhealthy(e.to_string()),
                    }
                }
            };
            report.push((id.to_string(), status));
        }
        report
    }

    async fn check_service(
        &self,
        ctx: &Context,
        descriptor: &ServiceDescriptor,
        instance: &Instance,
    ) -> Result<()> {
        let phase_ctx = ctx.with_timeout(self.config.health_check_timeout());
        phase_ctx
            .run(descriptor.call(Phase::HealthCheck, &phase_ctx, instance))
            .await?
            .map_err(|e| Error::lifecycle(descriptor.id(), Phase::HealthCheck, e))
    }

    /// Shut down ready singletons, dependents first, collecting every error
    ///
    /// Stops the runner supervisor first. Before a non-runner service goes
    /// down, every still-running runner task is awaited, so background work
    /// never outlives what it depends on.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        async {
            let Some(graph) = self.graph.get() else {
                debug!("Nothing to shut down");
                return Ok(());
            };
            if self.supervisor.stop("shutdown requested") {
                info!("Stopping runners for shutdown");
            }

            let mut aggregate = AggregateError::new();
            for id in graph.reverse_topological_order() {
                let Some(descriptor) = graph.get(id) else {
                    continue;
                };
                if !descriptor.is_singleton() || descriptor.state() != ServiceState::Ready {
                    continue;
                }
                if let Err(e) = self.shutdown_service(ctx, descriptor).await {
                    warn!("Failed to shut down '{}': {}", id, e);
                    aggregate.push(id, e);
                }
            }

            if aggregate.is_empty() {
                info!("All services shut down");
            }
            aggregate.into_result()
        }
        .instrument(info_span!("shutdown"))
        .await
    }

    async fn shutdown_service(&self, ctx: &Context, descriptor: &ServiceDescriptor) -> Result<()> {
        let id = descriptor.id();
        let Some(instance) = descriptor.stored() else {
            return Ok(());
        };
        descriptor.transition(ServiceState::ShuttingDown)?;
        let phase_ctx = ctx.with_timeout(self.config.shutdown_timeout());

        let outcome = async {
            if !descriptor.is_runner() && self.supervisor.active_tasks() > 0 {
                debug!(
                    "Waiting for {} runner tasks before shutting down '{}'",
                    self.supervisor.active_tasks(),
                    id
                );
                phase_ctx.run(self.supervisor.wait_idle()).await?;
            }
            phase_ctx
                .run(descriptor.call(Phase::Shutdown, &phase_ctx, instance))
                .await?
                .map_err(|e| Error::lifecycle(id, Phase::Shutdown, e))
        }
        .await;

        match outcome {
            Ok(()) => {
                descriptor.transition(ServiceState::Terminated)?;
                info!("Service '{}' shut down", id);
                Ok(())
            }
            Err(e) => {
                descriptor.fail(&e);
                Err(e)
            }
        }
    }

    /// Get an instance by id: the shared singleton, or a new factory instance
    /// built from `args` and initialized under `ctx`
    ///
    /// Argument errors are returned as they are; any other failure is
    /// reported as [`Error::ServiceInitFailed`].
    pub async fn invoke(&self, ctx: &Context, id: &str, args: Args) -> Result<Instance> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let descriptor = self
            .graph
            .get()
            .and_then(|graph| graph.get(id))
            .ok_or_else(|| Error::ServiceNotFound {
                name: id.to_string(),
                available: self.known_ids(),
            })?;

        let result = async {
            let instance = descriptor.instance(&self.services, args)?;
            if !descriptor.is_singleton() {
                ctx.run(descriptor.call(Phase::Init, ctx, &instance))
                    .await?
                    .map_err(|e| Error::lifecycle(id, Phase::Init, e))?;
            }
            Ok::<_, Error>(instance)
        }
        .await;

        result.map_err(|e| match e {
            Error::InvalidArgumentCount { .. } | Error::InvalidArgumentType { .. } => e,
            other => Error::ServiceInitFailed {
                service: id.to_string(),
                source: Box::new(other),
            },
        })
    }

    /// Typed [`LifecycleOrchestrator::invoke`] for the service providing `T`
    pub async fn invoke_as<T: Any + Send + Sync>(
        &self,
        ctx: &Context,
        args: Args,
    ) -> Result<Arc<T>> {
        let id = service_id::<T>();
        let instance = self.invoke(ctx, &id, args).await?;
        instance
            .downcast::<T>()
            .ok_or_else(|| Error::invalid(id, format!("instance is {}", instance.type_name())))
    }

    fn known_ids(&self) -> Vec<String> {
        match self.graph.get() {
            Some(graph) => graph.ids().map(str::to_string).collect(),
            None => self.services.keys().cloned().collect(),
        }
    }

    /// Run every ready runner service under the supervisor
    pub async fn run_services(&self, ctx: &Context) -> Result<()> {
        let graph = self.initialized_graph()?;
        let runners: Vec<Runner> = graph
            .topological_order()
            .filter_map(|id| graph.get(id))
            .filter(|descriptor| descriptor.is_runner())
            .filter_map(|descriptor| {
                let (descriptor, instance) = ready_singleton(graph, descriptor.id())?;
                Some(service_runner(descriptor, instance.clone()))
            })
            .collect();
        self.supervisor
            .run(ctx, runners)
            .instrument(info_span!("run_services"))
            .await
    }

    /// Validate, initialize, health check and run everything, then shut down
    ///
    /// Shutdown always follows a successful init and runs on a fresh context
    /// so cancelling `ctx` (e.g. on a signal) still gets a full teardown.
    /// The first failure is returned; a shutdown error only surfaces when
    /// nothing failed before it.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        self.validate(ctx).await?;
        self.init(ctx).await?;

        let result = async {
            self.health_check(ctx).await?;
            self.run_services(ctx).await
        }
        .await;

        let shutdown = self.shutdown(&Context::background()).await;
        match (result, shutdown) {
            (Ok(()), shutdown) => shutdown,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_err)) => {
                error!("Shutdown after failure also failed: {}", shutdown_err);
                Err(e)
            }
        }
    }
}

impl Default for LifecycleOrchestrator {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

fn ready_singleton<'a>(
    graph: &'a DependencyGraph<Arc<ServiceDescriptor>>,
    id: &str,
) -> Option<(&'a Arc<ServiceDescriptor>, &'a Instance)> {
    let descriptor = graph.get(id)?;
    if !descriptor.is_singleton() || descriptor.state() != ServiceState::Ready {
        return None;
    }
    Some((descriptor, descriptor.stored()?))
}

fn service_runner(descriptor: &Arc<ServiceDescriptor>, instance: Instance) -> Runner {
    let config = descriptor.run_config();
    let id = descriptor.id().to_string();
    let descriptor = Arc::clone(descriptor);
    Runner::from_fn(
        id,
        config,
        Arc::new(move |ctx: Context| {
            let descriptor = Arc::clone(&descriptor);
            let instance = instance.clone();
            async move { descriptor.call(Phase::Run, &ctx, &instance).await }.boxed()
        }),
    )
}
