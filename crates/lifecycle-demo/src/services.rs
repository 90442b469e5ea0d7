//! Demo services
//!
//! ```text
//! Ticker (main) ──► Metrics ──► Store
//! Heartbeat (secondary) ──► Metrics
//! Session (factory) ──► Store
//! ```

use crate::config::{FailurePoint, Workload};
use anyhow::{Result, bail};
use async_trait::async_trait;
use service_lifecycle::{
    Args, Context, Dependencies, LifecycleConfig, LifecycleOrchestrator, Service,
    ServiceDescriptor,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// In-memory counter store
#[derive(Default)]
pub struct Store {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Store {
    /// Increment a counter, returning the new value
    pub fn incr(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let value = counters.entry(key.to_string()).or_default();
        *value += 1;
        *value
    }

    /// Current value of a counter
    pub fn get(&self, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(key).copied().unwrap_or_default()
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Service for Store {
    async fn init(&self, _ctx: &Context) -> Result<()> {
        info!("Store opened");
        Ok(())
    }

    async fn shutdown(&self, _ctx: &Context) -> Result<()> {
        info!("Store closed with counters {:?}", self.snapshot());
        Ok(())
    }
}

/// Records named events in the store
pub struct Metrics {
    store: Arc<Store>,
    fail: Option<FailurePoint>,
}

impl Metrics {
    /// Record one occurrence of `event`
    pub fn record(&self, event: &str) -> u64 {
        self.store.incr(event)
    }
}

#[async_trait]
impl Service for Metrics {
    async fn init(&self, _ctx: &Context) -> Result<()> {
        if self.fail == Some(FailurePoint::Init) {
            bail!("metrics exporter could not bind");
        }
        info!("Metrics ready");
        Ok(())
    }

    async fn health_check(&self, _ctx: &Context) -> Result<()> {
        if self.fail == Some(FailurePoint::HealthCheck) {
            bail!("metrics exporter is not responding");
        }
        Ok(())
    }

    async fn shutdown(&self, _ctx: &Context) -> Result<()> {
        if self.fail == Some(FailurePoint::Shutdown) {
            bail!("metrics flush failed");
        }
        info!(
            "Metrics flushed: {} ticks, {} heartbeats",
            self.store.get("ticks"),
            self.store.get("heartbeats")
        );
        Ok(())
    }
}

/// Per-caller session; built by the factory with a user name
pub struct Session {
    /// User the session belongs to
    pub user: String,
    store: Arc<Store>,
}

impl Session {
    /// Count a login and describe the session
    pub fn greet(&self) -> String {
        let logins = self.store.incr(&format!("logins:{}", self.user));
        format!("session for {} (login #{logins})", self.user)
    }
}

impl Service for Session {}

/// Main runner: ticks a fixed number of times, then finishes
pub struct Ticker {
    metrics: Arc<Metrics>,
    ticks: u32,
    interval: std::time::Duration,
    fail: bool,
}

#[async_trait]
impl Service for Ticker {
    async fn run(&self, ctx: &Context) -> Result<()> {
        for tick in 1..=self.ticks {
            ctx.run(smol::Timer::after(self.interval)).await?;
            if self.fail && tick * 2 > self.ticks {
                bail!("tick {tick} failed");
            }
            let total = self.metrics.record("ticks");
            info!("Tick {}/{} (total {})", tick, self.ticks, total);
        }
        Ok(())
    }
}

/// Secondary runner: beats until cancelled
pub struct Heartbeat {
    metrics: Arc<Metrics>,
    interval: std::time::Duration,
}

#[async_trait]
impl Service for Heartbeat {
    async fn run(&self, ctx: &Context) -> Result<()> {
        loop {
            ctx.run(smol::Timer::after(self.interval)).await?;
            let beats = self.metrics.record("heartbeats");
            debug!("Heartbeat #{}", beats);
        }
    }
}

/// Orchestrator with every demo service registered
pub fn build(
    config: LifecycleConfig,
    workload: &Workload,
) -> service_lifecycle::Result<LifecycleOrchestrator> {
    let mut orchestrator = LifecycleOrchestrator::new(config);
    let fail = workload.fail;

    orchestrator.register(
        ServiceDescriptor::singleton(|_| Ok(Store::default()))
            .named("store")
            .build(),
    )?;

    orchestrator.register(
        ServiceDescriptor::singleton(move |deps| {
            Ok(Metrics {
                store: deps.get_named("store")?,
                fail,
            })
        })
        .named("metrics")
        .requires_id("store")
        .build(),
    )?;

    orchestrator.register(
        ServiceDescriptor::factory(|deps: &Dependencies<'_>, args: &Args| {
            let Some(user) = args.get::<String>(0) else {
                bail!("missing user argument");
            };
            Ok(Session {
                user: user.clone(),
                store: deps.get_named("store")?,
            })
        })
        .named("session")
        .requires_id("store")
        .param::<String>()
        .build(),
    )?;

    let (ticks, interval) = (workload.ticks, workload.tick_interval());
    orchestrator.register(
        ServiceDescriptor::singleton(move |deps| {
            Ok(Ticker {
                metrics: deps.get_named("metrics")?,
                ticks,
                interval,
                fail: fail == Some(FailurePoint::Run),
            })
        })
        .named("ticker")
        .requires_id("metrics")
        .main_runner()
        .build(),
    )?;

    let heartbeat_interval = workload.heartbeat_interval();
    orchestrator.register(
        ServiceDescriptor::singleton(move |deps| {
            Ok(Heartbeat {
                metrics: deps.get_named("metrics")?,
                interval: heartbeat_interval,
            })
        })
        .named("heartbeat")
        .requires_id("metrics")
        .secondary_runner()
        .build(),
    )?;

    Ok(orchestrator)
}
