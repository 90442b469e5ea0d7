//! End-to-end lifecycle tests: registration through shutdown

use async_trait::async_trait;
use service_lifecycle::{
    Args, Context, Dependencies, Error, HealthStatus, LifecycleConfig, LifecycleOrchestrator,
    Phase, Service, ServiceDescriptor, ServiceState, service_id,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

struct Store {
    log: Log,
}

#[async_trait]
impl Service for Store {
    async fn init(&self, _ctx: &Context) -> anyhow::Result<()> {
        push(&self.log, "store:init");
        Ok(())
    }

    async fn shutdown(&self, _ctx: &Context) -> anyhow::Result<()> {
        push(&self.log, "store:shutdown");
        Ok(())
    }
}

struct Session {
    user: String,
    store: Arc<Store>,
    opened: AtomicBool,
}

#[async_trait]
impl Service for Session {
    async fn init(&self, _ctx: &Context) -> anyhow::Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Main runner that finishes after a fixed number of ticks
struct Ticker {
    ticks: usize,
    count: AtomicUsize,
    store: Arc<Store>,
}

#[async_trait]
impl Service for Ticker {
    async fn run(&self, ctx: &Context) -> anyhow::Result<()> {
        while self.count.load(Ordering::SeqCst) < self.ticks {
            if ctx.is_done() {
                return Err(Error::Canceled.into());
            }
            smol::Timer::after(Duration::from_millis(2)).await;
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        push(&self.store.log, "ticker:done");
        Ok(())
    }
}

/// Secondary runner that works until cancelled
struct Heartbeat {
    store: Arc<Store>,
}

#[async_trait]
impl Service for Heartbeat {
    async fn run(&self, ctx: &Context) -> anyhow::Result<()> {
        ctx.cancelled().await;
        push(&self.store.log, "heartbeat:stopped");
        Err(Error::Canceled.into())
    }

    async fn shutdown(&self, _ctx: &Context) -> anyhow::Result<()> {
        push(&self.store.log, "heartbeat:shutdown");
        Ok(())
    }
}

fn store(log: &Log) -> ServiceDescriptor {
    let log = log.clone();
    ServiceDescriptor::singleton(move |_| Ok(Store { log: log.clone() })).build()
}

fn session() -> ServiceDescriptor {
    ServiceDescriptor::factory(|deps: &Dependencies<'_>, args: &Args| {
        let user = args
            .get::<String>(0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing user"))?;
        if user.is_empty() {
            anyhow::bail!("user must not be empty");
        }
        Ok(Session {
            user,
            store: deps.get::<Store>()?,
            opened: AtomicBool::new(false),
        })
    })
    .requires::<Store>()
    .param::<String>()
    .build()
}

fn ticker(ticks: usize) -> ServiceDescriptor {
    ServiceDescriptor::singleton(move |deps| {
        Ok(Ticker {
            ticks,
            count: AtomicUsize::new(0),
            store: deps.get::<Store>()?,
        })
    })
    .requires::<Store>()
    .main_runner()
    .build()
}

fn heartbeat() -> ServiceDescriptor {
    ServiceDescriptor::singleton(|deps| {
        Ok(Heartbeat {
            store: deps.get::<Store>()?,
        })
    })
    .requires::<Store>()
    .secondary_runner()
    .build()
}

fn orchestrator(descriptors: Vec<ServiceDescriptor>) -> LifecycleOrchestrator {
    let mut orchestrator = LifecycleOrchestrator::new(LifecycleConfig::default());
    for descriptor in descriptors {
        orchestrator.register(descriptor).unwrap();
    }
    orchestrator
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[smol_potat::test]
async fn test_full_lifecycle_runs_to_completion() {
    let log = Log::default();
    let orchestrator = orchestrator(vec![heartbeat(), ticker(3), session(), store(&log)]);

    orchestrator.run(&Context::background()).await.unwrap();

    let entries = entries(&log);
    assert_eq!(entries.first().map(String::as_str), Some("store:init"));
    assert_eq!(entries.last().map(String::as_str), Some("store:shutdown"));
    let position = |entry: &str| entries.iter().position(|e| e == entry).unwrap();
    assert!(position("ticker:done") < position("heartbeat:stopped"));
    assert!(position("heartbeat:stopped") < position("heartbeat:shutdown"));
    assert!(position("heartbeat:shutdown") < position("store:shutdown"));

    assert!(
        orchestrator
            .status()
            .iter()
            .all(|status| status.state == ServiceState::Terminated)
    );
    assert!(!orchestrator.supervisor().is_running());
}

#[smol_potat::test]
async fn test_topological_order_over_registered_services() {
    let log = Log::default();
    let orchestrator = orchestrator(vec![heartbeat(), ticker(1), session(), store(&log)]);
    orchestrator.init(&Context::background()).await.unwrap();

    let graph = orchestrator.graph().unwrap();
    let order: Vec<&str> = graph.topological_order().collect();
    assert_eq!(order.len(), graph.len());
    for (index, id) in order.iter().enumerate() {
        for dependency in graph.dependencies_of(id) {
            let before = order.iter().position(|other| *other == dependency).unwrap();
            assert!(before < index, "{dependency} must come before {id}");
        }
    }
    assert_eq!(order[0], service_id::<Store>());
}

#[smol_potat::test]
async fn test_invoke_singletons_and_factories() {
    let log = Log::default();
    let orchestrator = orchestrator(vec![store(&log), session()]);
    let ctx = Context::background();

    // Nothing is resolved before init.
    assert!(matches!(
        orchestrator
            .invoke(&ctx, &service_id::<Store>(), Args::new())
            .await,
        Err(Error::ServiceNotFound { .. })
    ));

    orchestrator.init(&ctx).await.unwrap();

    let first = orchestrator.invoke_as::<Store>(&ctx, Args::new()).await.unwrap();
    let second = orchestrator.invoke_as::<Store>(&ctx, Args::new()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let ada = orchestrator
        .invoke_as::<Session>(&ctx, Args::new().with("ada".to_string()))
        .await
        .unwrap();
    let grace = orchestrator
        .invoke_as::<Session>(&ctx, Args::new().with("grace".to_string()))
        .await
        .unwrap();
    assert_eq!(ada.user, "ada");
    assert_eq!(grace.user, "grace");
    assert!(Arc::ptr_eq(&ada.store, &first));
    assert!(!Arc::ptr_eq(&ada, &grace));
    // Factory instances are initialized on every invocation.
    assert!(ada.opened.load(Ordering::SeqCst));

    let err = orchestrator
        .invoke(&ctx, &service_id::<Session>(), Args::new().with(42u32))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgumentType { index: 0, .. }));

    let err = orchestrator
        .invoke(&ctx, &service_id::<Session>(), Args::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount {
            expected: 1,
            found: 0,
            ..
        }
    ));

    let err = orchestrator
        .invoke(&ctx, &service_id::<Session>(), Args::new().with(String::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceInitFailed { .. }));

    let err = orchestrator
        .invoke(&ctx, "mailer", Args::new())
        .await
        .unwrap_err();
    let Error::ServiceNotFound { name, available } = err else {
        panic!("expected service not found");
    };
    assert_eq!(name, "mailer");
    assert_eq!(available.len(), 2);

    let cancelled = ctx.child();
    cancelled.cancel();
    assert!(matches!(
        orchestrator
            .invoke(&cancelled, &service_id::<Store>(), Args::new())
            .await,
        Err(Error::Canceled)
    ));
}

#[smol_potat::test]
async fn test_outer_cancellation_shuts_down_cleanly() {
    let log = Log::default();
    let mut orchestrator = orchestrator(vec![store(&log), heartbeat()]);
    orchestrator
        .register(
            ServiceDescriptor::singleton(|_| Ok(Blocker))
                .named("server")
                .main_runner()
                .build(),
        )
        .unwrap();

    let ctx = Context::background();
    let canceller = ctx.clone();
    let timer = smol::spawn(async move {
        smol::Timer::after(Duration::from_millis(30)).await;
        canceller.cancel_with_cause("interrupt");
    });

    orchestrator.run(&ctx).await.unwrap();
    timer.await;
    assert_eq!(entries(&log).last().map(String::as_str), Some("store:shutdown"));
    assert!(
        orchestrator
            .status()
            .iter()
            .all(|status| status.state == ServiceState::Terminated)
    );
}

struct Blocker;

#[async_trait]
impl Service for Blocker {
    async fn run(&self, ctx: &Context) -> anyhow::Result<()> {
        ctx.cancelled().await;
        Err(Error::Canceled.into())
    }
}

#[smol_potat::test]
async fn test_runner_failure_is_reported_after_shutdown() {
    let log = Log::default();
    let mut orchestrator = orchestrator(vec![store(&log), heartbeat()]);
    orchestrator
        .register(
            ServiceDescriptor::singleton(|_| Ok(Blocker))
                .named("server")
                .main_runner()
                .on_run(|_ctx, _server| async { anyhow::bail!("port already in use") })
                .build(),
        )
        .unwrap();

    let err = orchestrator.run(&Context::background()).await.unwrap_err();
    let Error::Multiple(aggregate) = err else {
        panic!("expected aggregate error, got {err:?}");
    };
    assert_eq!(aggregate.services().collect::<Vec<_>>(), vec!["server"]);
    assert!(matches!(
        aggregate.errors()[0].1,
        Error::Lifecycle {
            phase: Phase::Run,
            ..
        }
    ));
    assert_eq!(entries(&log).last().map(String::as_str), Some("store:shutdown"));
}

#[smol_potat::test]
async fn test_run_without_main_runner_fails_after_cleanup() {
    let log = Log::default();
    let orchestrator = orchestrator(vec![store(&log), heartbeat()]);

    let err = orchestrator.run(&Context::background()).await.unwrap_err();
    assert!(matches!(err, Error::NoMainRunners));
    assert_eq!(entries(&log), vec!["store:init", "heartbeat:shutdown", "store:shutdown"]);
}

#[smol_potat::test]
async fn test_health_report_before_and_after_init() {
    let log = Log::default();
    let orchestrator = orchestrator(vec![store(&log), session()]);
    let ctx = Context::background();
    assert!(orchestrator.health_report(&ctx).await.is_empty());

    orchestrator.init(&ctx).await.unwrap();
    orchestrator.health_check(&ctx).await.unwrap();
    // Factories are not lifecycle-managed, so only the store is reported.
    assert_eq!(
        orchestrator.health_report(&ctx).await,
        vec![(service_id::<Store>(), HealthStatus::Healthy)]
    );
}
