//! Service descriptors: identity, requirements, runner settings and hooks
//!
//! A [`ServiceDescriptor`] is the declarative record the orchestrator works
//! from. It is produced by the typed [`DescriptorBuilder`], which erases the
//! concrete service type behind [`Instance`] while keeping hooks and
//! constructors strongly typed at the registration site.

use crate::state::{ServiceStatus, StateRecord};
use crate::{Context, Error, Phase, Result, RunConfig, ServiceState};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::any::{Any, TypeId, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Lifecycle behaviour a service instance can provide
///
/// Every method defaults to a no-op. A hook registered on the descriptor for
/// the same phase replaces the method entirely.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Bring the service up after its dependencies are ready
    async fn init(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Report whether the service is healthy
    async fn health_check(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources; dependents are already down
    async fn shutdown(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Background work for runner services
    ///
    /// Implementations should return once `ctx` is cancelled, ideally with
    /// [`Error::Canceled`].
    async fn run(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Identity of the service providing `T`
pub fn service_id<T: ?Sized>() -> String {
    type_name::<T>().to_string()
}

/// Type-erased handle to a produced service value
#[derive(Clone)]
pub struct Instance {
    service: Arc<dyn Service>,
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Instance {
    /// Wrap a service value
    pub fn new<T: Service>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared service value
    pub fn from_arc<T: Service>(value: Arc<T>) -> Self {
        Self {
            service: value.clone(),
            value,
            type_name: type_name::<T>(),
        }
    }

    /// Recover the concrete value
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Lifecycle methods of the value
    pub fn service(&self) -> &dyn Service {
        self.service.as_ref()
    }

    /// Name of the concrete type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// One runtime-checked factory argument
pub struct Arg {
    value: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Arg {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Name of the wrapped type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Argument vector passed to parameterized factories
#[derive(Default)]
pub struct Args(Vec<Arg>);

impl Args {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument, builder style
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    /// Append an argument
    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.0.push(Arg::new(value));
    }

    /// Argument at `index`, if present and of type `T`
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.0.get(index)?.value.downcast_ref::<T>()
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(Arg::type_name))
            .finish()
    }
}

/// Declared type of one factory parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    type_id: TypeId,
    type_name: &'static str,
}

impl ArgSpec {
    /// Parameter of type `T`
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Name of the declared type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Whether a descriptor produces one shared instance or one per invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// One shared, lifecycle-managed instance
    Singleton,
    /// New caller-owned instance per invocation
    Factory {
        /// Parameter types; the arity is `params.len()`
        params: Vec<ArgSpec>,
    },
}

/// Runner participation of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Explicit run configuration; `None` takes the supervisor default
    pub config: Option<RunConfig>,
}

type Constructor = Arc<dyn Fn(&Dependencies<'_>, &Args) -> anyhow::Result<Instance> + Send + Sync>;

/// Hook receiving the phase context and the service instance
pub type InstanceHook =
    Arc<dyn Fn(Context, Instance) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook receiving only the phase context
pub type ContextHook = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Hooks {
    before_init: Option<ContextHook>,
    init: Option<InstanceHook>,
    health_check: Option<InstanceHook>,
    shutdown: Option<InstanceHook>,
    run: Option<InstanceHook>,
    validate: Option<ContextHook>,
}

/// Registered service and everything the orchestrator needs to manage it
pub struct ServiceDescriptor {
    id: String,
    kind: ServiceKind,
    requires: Vec<String>,
    runner: Option<RunnerSettings>,
    constructor: Constructor,
    hooks: Hooks,
    slot: OnceLock<Instance>,
    state: Mutex<StateRecord>,
}

/// Registered descriptors keyed by id
pub(crate) type ServiceMap = IndexMap<String, Arc<ServiceDescriptor>>;

impl ServiceDescriptor {
    /// Describe a singleton service providing `T`
    pub fn singleton<T, F>(constructor: F) -> DescriptorBuilder<T>
    where
        T: Service,
        F: Fn(&Dependencies<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |deps: &Dependencies<'_>, _args: &Args| constructor(deps).map(Instance::new));
        DescriptorBuilder::new(ServiceKind::Singleton, constructor)
    }

    /// Describe a factory service producing a new `T` per invocation
    ///
    /// Declare the factory's parameters with [`DescriptorBuilder::param`];
    /// invocations are checked against them before `constructor` runs.
    pub fn factory<T, F>(constructor: F) -> DescriptorBuilder<T>
    where
        T: Service,
        F: Fn(&Dependencies<'_>, &Args) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |deps: &Dependencies<'_>, args: &Args| constructor(deps, args).map(Instance::new));
        DescriptorBuilder::new(ServiceKind::Factory { params: Vec::new() }, constructor)
    }

    /// Service id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Singleton or factory
    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    /// Ids this service requires
    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// Whether one shared instance is managed
    pub fn is_singleton(&self) -> bool {
        matches!(self.kind, ServiceKind::Singleton)
    }

    /// Whether this service has background work
    pub fn is_runner(&self) -> bool {
        self.runner.is_some()
    }

    /// Explicit run configuration, if any
    pub fn run_config(&self) -> Option<RunConfig> {
        self.runner.and_then(|runner| runner.config)
    }

    /// Declared factory parameters (empty for singletons)
    pub fn params(&self) -> &[ArgSpec] {
        match &self.kind {
            ServiceKind::Singleton => &[],
            ServiceKind::Factory { params } => params,
        }
    }

    /// Current lifecycle state (always `Uninitialized` for factories)
    pub fn state(&self) -> ServiceState {
        self.record().state()
    }

    /// Snapshot of the lifecycle state
    pub fn status(&self) -> ServiceStatus {
        self.record().snapshot(&self.id)
    }

    fn record(&self) -> MutexGuard<'_, StateRecord> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, next: ServiceState) -> Result<()> {
        self.record().transition(&self.id, next)
    }

    pub(crate) fn fail(&self, error: &Error) {
        if let Err(e) = self.record().fail(&self.id, error) {
            tracing::debug!("{}", e);
        }
    }

    /// Self-check run by the validate phase
    pub async fn validate(&self, ctx: &Context) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid(&self.id, "service id is empty"));
        }
        if self.is_runner() && !self.is_singleton() {
            return Err(Error::invalid(&self.id, "factories cannot be runners"));
        }
        if self.requires.iter().any(|id| id == &self.id) {
            return Err(Error::invalid(&self.id, "service requires itself"));
        }
        if let Some(hook) = &self.hooks.validate {
            ctx.run(hook(ctx.clone()))
                .await?
                .map_err(|e| Error::invalid(&self.id, format!("{e:#}")))?;
        }
        Ok(())
    }

    /// Run the before-init hook, if any
    pub(crate) async fn before_init(&self, ctx: &Context) -> anyhow::Result<()> {
        match &self.hooks.before_init {
            Some(hook) => hook(ctx.clone()).await,
            None => Ok(()),
        }
    }

    /// Build a fresh value from already-ready dependencies
    pub(crate) fn construct(&self, services: &ServiceMap, args: &Args) -> Result<Instance> {
        let deps = Dependencies {
            service: &self.id,
            requires: &self.requires,
            services,
        };
        (self.constructor)(&deps, args).map_err(|e| Error::lifecycle(&self.id, Phase::Init, e))
    }

    /// Dispatch a lifecycle phase: hook if present, else the instance method
    pub(crate) async fn call(
        &self,
        phase: Phase,
        ctx: &Context,
        instance: &Instance,
    ) -> anyhow::Result<()> {
        let hook = match phase {
            Phase::Init => &self.hooks.init,
            Phase::HealthCheck => &self.hooks.health_check,
            Phase::Shutdown => &self.hooks.shutdown,
            Phase::Run => &self.hooks.run,
            Phase::Validate => return Ok(()),
        };
        if let Some(hook) = hook {
            return hook(ctx.clone(), instance.clone()).await;
        }
        let service = instance.service();
        match phase {
            Phase::Init => service.init(ctx).await,
            Phase::HealthCheck => service.health_check(ctx).await,
            Phase::Shutdown => service.shutdown(ctx).await,
            Phase::Run => service.run(ctx).await,
            Phase::Validate => Ok(()),
        }
    }

    /// Store the initialized singleton
    pub(crate) fn store(&self, instance: Instance) -> Result<()> {
        self.slot
            .set(instance)
            .map_err(|_| Error::invalid_state(format!("service '{}' already initialized", self.id)))
    }

    /// The initialized singleton, regardless of its current state
    pub(crate) fn stored(&self) -> Option<&Instance> {
        self.slot.get()
    }

    /// Cached singleton, or a new factory instance built from `args`
    pub(crate) fn instance(&self, services: &ServiceMap, args: Args) -> Result<Instance> {
        self.check_args(&args)?;
        match self.kind {
            ServiceKind::Singleton => {
                let state = self.state();
                match (state, self.slot.get()) {
                    (ServiceState::Ready, Some(instance)) => Ok(instance.clone()),
                    _ => Err(Error::invalid_state(format!(
                        "service '{}' is {}",
                        self.id, state
                    ))),
                }
            }
            ServiceKind::Factory { .. } => self.construct(services, &args),
        }
    }

    fn check_args(&self, args: &Args) -> Result<()> {
        let params = self.params();
        if params.len() != args.len() {
            return Err(Error::InvalidArgumentCount {
                service: self.id.clone(),
                expected: params.len(),
                found: args.len(),
            });
        }
        for (index, (param, arg)) in params.iter().zip(&args.0).enumerate() {
            if param.type_id != arg.type_id {
                return Err(Error::InvalidArgumentType {
                    service: self.id.clone(),
                    index,
                    expected: param.type_name,
                    found: arg.type_name,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .field("runner", &self.runner)
            .field("state", &self.state())
            .finish()
    }
}

/// Typed builder for [`ServiceDescriptor`]
pub struct DescriptorBuilder<T> {
    id: String,
    kind: ServiceKind,
    requires: Vec<String>,
    runner: Option<RunnerSettings>,
    constructor: Constructor,
    hooks: Hooks,
    _service: PhantomData<fn() -> T>,
}

impl<T: Service> DescriptorBuilder<T> {
    fn new(kind: ServiceKind, constructor: Constructor) -> Self {
        Self {
            id: service_id::<T>(),
            kind,
            requires: Vec::new(),
            runner: None,
            constructor,
            hooks: Hooks::default(),
            _service: PhantomData,
        }
    }

    /// Override the type-derived id
    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Require the service providing `U`
    pub fn requires<U: ?Sized>(self) -> Self {
        self.requires_id(service_id::<U>())
    }

    /// Require a service by id
    pub fn requires_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.requires.contains(&id) {
            self.requires.push(id);
        }
        self
    }

    /// Declare the next factory parameter
    ///
    /// Has no effect on singletons, which never take arguments.
    pub fn param<A: Any>(mut self) -> Self {
        if let ServiceKind::Factory { params } = &mut self.kind {
            params.push(ArgSpec::of::<A>());
        }
        self
    }

    /// Mark as a runner; `None` defers to the supervisor default
    pub fn runner(mut self, config: Option<RunConfig>) -> Self {
        self.runner = Some(RunnerSettings { config });
        self
    }

    /// Mark as a main runner
    pub fn main_runner(self) -> Self {
        self.runner(Some(RunConfig::MAIN))
    }

    /// Mark as a secondary runner
    pub fn secondary_runner(self) -> Self {
        self.runner(Some(RunConfig::SECONDARY))
    }

    /// Run before the instance is constructed
    pub fn before_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.before_init = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Extra self-check for the validate phase
    pub fn on_validate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.validate = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Replace [`Service::init`]
    pub fn on_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.init = Some(typed_hook(hook));
        self
    }

    /// Replace [`Service::health_check`]
    pub fn on_health_check<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.health_check = Some(typed_hook(hook));
        self
    }

    /// Replace [`Service::shutdown`]
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.shutdown = Some(typed_hook(hook));
        self
    }

    /// Replace [`Service::run`]
    pub fn on_run<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.run = Some(typed_hook(hook));
        self
    }

    /// Finish the descriptor
    pub fn build(self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: self.id,
            kind: self.kind,
            requires: self.requires,
            runner: self.runner,
            constructor: self.constructor,
            hooks: self.hooks,
            slot: OnceLock::new(),
            state: Mutex::new(StateRecord::new()),
        }
    }
}

fn typed_hook<T, F, Fut>(hook: F) -> InstanceHook
where
    T: Service,
    F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, instance: Instance| match instance.downcast::<T>() {
        Some(value) => hook(ctx, value).boxed(),
        None => future::ready(Err(anyhow::anyhow!(
            "hook expects {} but instance is {}",
            type_name::<T>(),
            instance.type_name()
        )))
        .boxed(),
    })
}

/// Dependency lookup handed to constructors
///
/// Only services listed in the descriptor's requirements are reachable, so
/// everything a constructor touches was ordered before it.
pub struct Dependencies<'a> {
    service: &'a str,
    requires: &'a [String],
    services: &'a ServiceMap,
}

impl Dependencies<'_> {
    /// Instance of the service providing `U`
    pub fn get<U: Any + Send + Sync>(&self) -> Result<Arc<U>> {
        self.get_named(&service_id::<U>())
    }

    /// Instance of the service registered as `id`
    pub fn get_named<U: Any + Send + Sync>(&self, id: &str) -> Result<Arc<U>> {
        self.build_named(id, Args::new())
    }

    /// New instance of the factory providing `U`
    pub fn build<U: Any + Send + Sync>(&self, args: Args) -> Result<Arc<U>> {
        self.build_named(&service_id::<U>(), args)
    }

    /// New instance of the factory registered as `id`
    pub fn build_named<U: Any + Send + Sync>(&self, id: &str, args: Args) -> Result<Arc<U>> {
        if !self.requires.iter().any(|required| required == id) {
            return Err(Error::invalid(
                self.service,
                format!("'{id}' is used but not declared as a requirement"),
            ));
        }
        let descriptor = self.services.get(id).ok_or_else(|| Error::ServiceNotFound {
            name: id.to_string(),
            available: self.services.keys().cloned().collect(),
        })?;
        let instance = descriptor.instance(self.services, args)?;
        instance.downcast::<U>().ok_or_else(|| {
            Error::invalid(
                id,
                format!(
                    "instance is {}, requested {}",
                    instance.type_name(),
                    type_name::<U>()
                ),
            )
        })
    }
}
