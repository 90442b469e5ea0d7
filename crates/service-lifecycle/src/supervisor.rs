//! Runner supervision
//!
//! Runs background services concurrently in two groups:
//!
//! ```text
//!                 ctx (caller)
//!                  │
//!                 root ◄──────────── stop(cause)
//!            ┌─────┴──────┐
//!        main group   secondary group
//!         │  │  │        │  │
//!       task task ...   task ...
//! ```
//!
//! - **main** runners (`wait = true`) define completion: once all of them have
//!   returned, the main group is cancelled.
//! - **secondary** runners (`wait = false`) are best effort and are torn down
//!   with everything else.
//!
//! A genuine error from any runner cancels its group. A housekeeping task per
//! group forwards group cancellation to the root, which in turn reaches every
//! runner. `run` returns once the root is done and every task has returned,
//! reporting all errors except plain [`Error::Canceled`] responses.

use crate::error::is_cancellation;
use crate::{AggregateError, Context, Error, Phase, Result, RunConfig, SupervisorConfig};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Body of a runner
pub type RunFn = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A unit of background work handed to the supervisor
#[derive(Clone)]
pub struct Runner {
    id: String,
    config: Option<RunConfig>,
    body: RunFn,
}

impl Runner {
    /// Runner with an explicit or defaulted run configuration
    pub fn new<F, Fut>(id: impl Into<String>, config: Option<RunConfig>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_fn(id, config, Arc::new(move |ctx| body(ctx).boxed()))
    }

    /// Runner from an already boxed body
    pub fn from_fn(id: impl Into<String>, config: Option<RunConfig>, body: RunFn) -> Self {
        Self {
            id: id.into(),
            config,
            body,
        }
    }

    /// Main runner
    pub fn main<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(id, Some(RunConfig::MAIN), body)
    }

    /// Secondary runner
    pub fn secondary<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(id, Some(RunConfig::SECONDARY), body)
    }

    /// Runner id
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

/// In-flight execution of a runner
struct RunnerTask {
    id: String,
    wait: bool,
    ctx: Context,
    finished: CancellationToken,
}

impl RunnerTask {
    fn complete(&self) {
        self.finished.cancel();
    }

    fn is_done(&self) -> bool {
        self.finished.is_cancelled()
    }
}

/// Shared state of one runner group
struct Group {
    name: &'static str,
    ctx: Context,
    remaining: AtomicUsize,
    cancel_when_drained: bool,
    errors: Mutex<Vec<(String, Error)>>,
}

impl Group {
    fn new(name: &'static str, ctx: Context, size: usize, cancel_when_drained: bool) -> Self {
        Self {
            name,
            ctx,
            remaining: AtomicUsize::new(size),
            cancel_when_drained,
            errors: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, task: &RunnerTask, result: anyhow::Result<()>) {
        match result {
            Ok(()) => debug!("Runner '{}' finished", task.id),
            Err(e) if is_cancellation(&e) => debug!("Runner '{}' stopped on cancellation", task.id),
            Err(e) => {
                warn!("Runner '{}' failed: {:#}", task.id, e);
                let cause = format!("runner '{}' failed: {:#}", task.id, e);
                lock(&self.errors).push((task.id.clone(), Error::lifecycle(&task.id, Phase::Run, e)));
                self.ctx.cancel_with_cause(cause);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 && self.cancel_when_drained {
            info!("All {} runners completed", self.name);
            self.ctx
                .cancel_with_cause(format!("all {} runners completed", self.name));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Launches runners and coordinates their cancellation
pub struct RunnerSupervisor {
    config: SupervisorConfig,
    root: Mutex<Option<Context>>,
    tasks: Mutex<Vec<Arc<RunnerTask>>>,
}

impl RunnerSupervisor {
    /// Supervisor applying `config` to runners without their own settings
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            root: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Supervisor configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run all runners until main work completes, a runner fails, or `ctx`
    /// is cancelled
    ///
    /// Cancellation is cooperative: a runner that never observes its context
    /// keeps this call from returning.
    pub async fn run(&self, ctx: &Context, runners: Vec<Runner>) -> Result<()> {
        let (main, secondary): (Vec<Runner>, Vec<Runner>) = runners
            .into_iter()
            .partition(|runner| runner.config.unwrap_or(self.config.default_run).wait);
        if main.is_empty() {
            return Err(Error::NoMainRunners);
        }

        let root = ctx.child();
        {
            let mut active = lock(&self.root);
            if active.as_ref().is_some_and(|root| !root.is_done()) {
                return Err(Error::invalid_state("runners are already running"));
            }
            *active = Some(root.clone());
        }
        lock(&self.tasks).retain(|task| !task.is_done());
        info!(
            "Starting {} main and {} secondary runners",
            main.len(),
            secondary.len()
        );

        let main_group = Arc::new(Group::new("main", root.child(), main.len(), true));
        let secondary_group = Arc::new(Group::new(
            "secondary",
            root.child(),
            secondary.len(),
            false,
        ));

        let mut handles = Vec::with_capacity(main.len() + secondary.len());
        for runner in main {
            handles.push(self.launch(runner, true, &main_group));
        }
        for runner in secondary {
            handles.push(self.launch(runner, false, &secondary_group));
        }

        let housekeeping: Vec<smol::Task<()>> = [&main_group, &secondary_group]
            .into_iter()
            .map(|group| {
                let group = Arc::clone(group);
                let root = root.clone();
                smol::spawn(async move {
                    group.ctx.cancelled().await;
                    let cause = group
                        .ctx
                        .cause()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{} group done", group.name));
                    if root.cancel_with_cause(cause.clone()) {
                        debug!("Runner root cancelled by {} group: {}", group.name, cause);
                    }
                })
            })
            .collect();

        root.cancelled().await;
        info!(
            "Stopping runners: {}",
            root.cause().unwrap_or("context finished")
        );
        futures::future::join_all(handles).await;
        futures::future::join_all(housekeeping).await;
        {
            let mut active = lock(&self.root);
            if active.as_ref().is_some_and(|active| active.same(&root)) {
                active.take();
            }
        }

        let mut aggregate = AggregateError::new();
        for group in [main_group, secondary_group] {
            for (service, error) in std::mem::take(&mut *lock(&group.errors)) {
                aggregate.push(service, error);
            }
        }
        aggregate.into_result()
    }

    fn launch(&self, runner: Runner, wait: bool, group: &Arc<Group>) -> smol::Task<()> {
        let task = Arc::new(RunnerTask {
            id: runner.id.clone(),
            wait,
            ctx: group.ctx.child(),
            finished: CancellationToken::new(),
        });
        lock(&self.tasks).push(task.clone());

        let group = Arc::clone(group);
        let span = info_span!("runner", service = %task.id, wait = task.wait);
        smol::spawn(
            async move {
                debug!("Runner started");
                let body = (runner.body)(task.ctx.clone());
                let result = match AssertUnwindSafe(body).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("runner panicked")),
                };
                group.record(&task, result);
                task.complete();
            }
            .instrument(span),
        )
    }

    /// Cancel the active run, if any
    ///
    /// Safe to call concurrently and repeatedly; returns `true` only for the
    /// call that actually cancelled the run.
    pub fn stop(&self, cause: impl Into<String>) -> bool {
        let root = lock(&self.root).clone();
        match root {
            Some(root) => root.cancel_with_cause(cause),
            None => false,
        }
    }

    /// Whether a run is in progress and not yet cancelled
    pub fn is_running(&self) -> bool {
        lock(&self.root).as_ref().is_some_and(|root| !root.is_done())
    }

    /// Number of runner tasks that have not returned yet
    pub fn active_tasks(&self) -> usize {
        lock(&self.tasks)
            .iter()
            .filter(|task| !task.is_done())
            .count()
    }

    /// Resolve once every launched runner task has returned
    pub async fn wait_idle(&self) {
        let pending: Vec<Arc<RunnerTask>> = {
            let mut tasks = lock(&self.tasks);
            tasks.retain(|task| !task.is_done());
            tasks.clone()
        };
        for task in pending {
            task.finished.cancelled().await;
        }
    }
}

impl Default for RunnerSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[smol_potat::test]
    async fn test_main_completion_stops_secondary() {
        let supervisor = RunnerSupervisor::default();
        let runners = vec![
            Runner::main("job", |_ctx| async {
                smol::Timer::after(Duration::from_millis(20)).await;
                Ok(())
            }),
            Runner::secondary("heartbeat", |ctx: Context| async move {
                ctx.cancelled().await;
                Err(Error::Canceled.into())
            }),
        ];
        supervisor
            .run(&Context::background(), runners)
            .await
            .unwrap();
        assert_eq!(supervisor.active_tasks(), 0);
        assert!(!supervisor.is_running());
    }

    #[smol_potat::test]
    async fn test_default_run_config_applies() {
        let supervisor = RunnerSupervisor::new(SupervisorConfig {
            default_run: RunConfig::SECONDARY,
        });
        let runners = vec![Runner::new("worker", None, |_ctx| async { Ok(()) })];
        let err = supervisor
            .run(&Context::background(), runners)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoMainRunners));
    }

    #[smol_potat::test]
    async fn test_outer_cancellation_stops_everything() {
        let supervisor = Arc::new(RunnerSupervisor::default());
        let ctx = Context::background();
        let runners = vec![
            Runner::main("server", |ctx: Context| async move {
                ctx.cancelled().await;
                Err(Error::Canceled.into())
            }),
            Runner::secondary("sweeper", |ctx: Context| async move {
                ctx.cancelled().await;
                Ok(())
            }),
        ];

        let canceller = ctx.clone();
        let timer = smol::spawn(async move {
            smol::Timer::after(Duration::from_millis(20)).await;
            canceller.cancel_with_cause("signal");
        });

        let started = Instant::now();
        supervisor.run(&ctx, runners).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        timer.await;
    }

    #[smol_potat::test]
    async fn test_panicking_runner_is_reported() {
        let supervisor = RunnerSupervisor::default();
        let runners = vec![Runner::main("fragile", |_ctx| async {
            if true {
                panic!("boom");
            }
            Ok(())
        })];
        let err = supervisor
            .run(&Context::background(), runners)
            .await
            .unwrap_err();
        let Error::Multiple(aggregate) = err else {
            panic!("expected aggregate error");
        };
        assert_eq!(aggregate.services().collect::<Vec<_>>(), vec!["fragile"]);
    }

    #[smol_potat::test]
    async fn test_next_run_drops_finished_tasks() {
        let supervisor = RunnerSupervisor::default();
        let ctx = Context::background();
        let first = vec![
            Runner::main("a", |_ctx| async { Ok(()) }),
            Runner::main("b", |_ctx| async { Ok(()) }),
        ];
        supervisor.run(&ctx, first).await.unwrap();
        assert_eq!(lock(&supervisor.tasks).len(), 2);

        let second = vec![Runner::main("c", |_ctx| async { Ok(()) })];
        supervisor.run(&ctx, second).await.unwrap();
        let ids: Vec<String> = lock(&supervisor.tasks)
            .iter()
            .map(|task| task.id.clone())
            .collect();
        assert_eq!(ids, vec!["c"]);
        assert_eq!(supervisor.active_tasks(), 0);
    }

    #[smol_potat::test]
    async fn test_draining_run_keeps_newer_run_stoppable() {
        let supervisor = Arc::new(RunnerSupervisor::default());
        let ctx = Context::background();

        let slow = vec![Runner::main("slow", |ctx: Context| async move {
            ctx.cancelled().await;
            smol::Timer::after(Duration::from_millis(50)).await;
            Ok(())
        })];
        let first = smol::spawn({
            let supervisor = Arc::clone(&supervisor);
            let ctx = ctx.clone();
            async move { supervisor.run(&ctx, slow).await }
        });
        while !supervisor.is_running() {
            smol::Timer::after(Duration::from_millis(1)).await;
        }
        assert!(supervisor.stop("first done"));

        let waiting = vec![Runner::main("waiting", |ctx: Context| async move {
            ctx.cancelled().await;
            Ok(())
        })];
        let second = smol::spawn({
            let supervisor = Arc::clone(&supervisor);
            let ctx = ctx.clone();
            async move { supervisor.run(&ctx, waiting).await }
        });
        while !supervisor.is_running() {
            smol::Timer::after(Duration::from_millis(1)).await;
        }

        first.await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.stop("second done"));
        second.await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[smol_potat::test]
    async fn test_stop_without_run_is_noop() {
        let supervisor = RunnerSupervisor::default();
        assert!(!supervisor.stop("nothing running"));
        supervisor.wait_idle().await;
        assert_eq!(supervisor.active_tasks(), 0);
    }
}
