//! Integration tests for runner supervision

use service_lifecycle::{Context, Error, Phase, RunConfig, Runner, RunnerSupervisor, SupervisorConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
#[error("upstream connection reset")]
struct ConnectionReset;

async fn wait_until_running(supervisor: &RunnerSupervisor, tasks: usize) {
    let started = Instant::now();
    while !supervisor.is_running() || supervisor.active_tasks() < tasks {
        assert!(started.elapsed() < Duration::from_secs(5), "supervisor never started");
        smol::Timer::after(Duration::from_millis(1)).await;
    }
}

#[smol_potat::test]
async fn test_no_main_runners_starts_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runners = (0..3)
        .map(|i| {
            let calls = calls.clone();
            Runner::secondary(format!("sidecar-{i}"), move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
        })
        .collect();

    let supervisor = RunnerSupervisor::default();
    let err = supervisor
        .run(&Context::background(), runners)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMainRunners));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(supervisor.active_tasks(), 0);
}

#[smol_potat::test]
async fn test_empty_runner_set_is_rejected() {
    let err = RunnerSupervisor::default()
        .run(&Context::background(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMainRunners));
}

#[smol_potat::test]
async fn test_secondary_failure_stops_blocked_main() {
    let supervisor = RunnerSupervisor::default();
    let runners = vec![
        Runner::main("server", |ctx: Context| async move {
            ctx.cancelled().await;
            Err(Error::Canceled.into())
        }),
        Runner::secondary("sync", |_ctx| async {
            smol::Timer::after(Duration::from_millis(10)).await;
            Err(ConnectionReset.into())
        }),
    ];

    let started = Instant::now();
    let err = supervisor
        .run(&Context::background(), runners)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    let Error::Multiple(aggregate) = err else {
        panic!("expected aggregate error, got {err:?}");
    };
    // The main runner's cancellation response is not reported.
    assert_eq!(aggregate.len(), 1);
    let (service, error) = &aggregate.errors()[0];
    assert_eq!(service, "sync");
    let Error::Lifecycle { phase, source, .. } = error else {
        panic!("expected lifecycle error, got {error:?}");
    };
    assert_eq!(*phase, Phase::Run);
    assert!(source.downcast_ref::<ConnectionReset>().is_some());
}

#[smol_potat::test]
async fn test_main_failure_stops_secondary() {
    let supervisor = RunnerSupervisor::default();
    let runners = vec![
        Runner::main("migrate", |_ctx| async { anyhow::bail!("schema mismatch") }),
        Runner::main("server", |ctx: Context| async move {
            ctx.cancelled().await;
            Err(Error::Canceled.into())
        }),
        Runner::secondary("metrics", |ctx: Context| async move {
            ctx.cancelled().await;
            Ok(())
        }),
    ];
    let err = supervisor
        .run(&Context::background(), runners)
        .await
        .unwrap_err();
    let Error::Multiple(aggregate) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(aggregate.services().collect::<Vec<_>>(), vec!["migrate"]);
}

#[smol_potat::test]
async fn test_all_main_runners_must_finish() {
    let finished = Arc::new(AtomicUsize::new(0));
    let runners = [5u64, 15, 30]
        .into_iter()
        .map(|millis| {
            let finished = finished.clone();
            Runner::main(format!("job-{millis}"), move |_ctx| {
                let finished = finished.clone();
                async move {
                    smol::Timer::after(Duration::from_millis(millis)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        })
        .collect();

    RunnerSupervisor::default()
        .run(&Context::background(), runners)
        .await
        .unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 3);
}

#[smol_potat::test]
async fn test_concurrent_stop_cancels_once() {
    let supervisor = Arc::new(RunnerSupervisor::default());
    let runners = vec![
        Runner::main("server", |ctx: Context| async move {
            ctx.cancelled().await;
            Err(Error::Canceled.into())
        }),
        Runner::new("poller", None, |ctx: Context| async move {
            ctx.cancelled().await;
            Ok(())
        }),
    ];

    let run = {
        let supervisor = supervisor.clone();
        smol::spawn(async move { supervisor.run(&Context::background(), runners).await })
    };
    wait_until_running(&supervisor, 2).await;

    let stops: Vec<_> = (0..8)
        .map(|i| {
            let supervisor = supervisor.clone();
            smol::spawn(async move { supervisor.stop(format!("stop #{i}")) })
        })
        .collect();
    let mut effective = 0;
    for stop in stops {
        if stop.await {
            effective += 1;
        }
    }
    assert_eq!(effective, 1);

    run.await.unwrap();
    assert!(!supervisor.is_running());
    assert!(!supervisor.stop("late"));
}

#[smol_potat::test]
async fn test_supervisor_default_applies_to_unconfigured_runners() {
    let supervisor = RunnerSupervisor::new(SupervisorConfig {
        default_run: RunConfig::SECONDARY,
    });
    let runners = vec![
        Runner::main("job", |_ctx| async { Ok(()) }),
        // Defaults to secondary, so it does not hold up completion.
        Runner::new("watcher", None, |ctx: Context| async move {
            ctx.cancelled().await;
            Ok(())
        }),
    ];
    supervisor
        .run(&Context::background(), runners)
        .await
        .unwrap();
}

#[smol_potat::test]
async fn test_wait_idle_after_stop() {
    let supervisor = Arc::new(RunnerSupervisor::default());
    let runners = vec![Runner::main("server", |ctx: Context| async move {
        ctx.cancelled().await;
        smol::Timer::after(Duration::from_millis(10)).await;
        Ok(())
    })];
    let run = {
        let supervisor = supervisor.clone();
        smol::spawn(async move { supervisor.run(&Context::background(), runners).await })
    };
    wait_until_running(&supervisor, 1).await;

    assert!(supervisor.stop("test"));
    supervisor.wait_idle().await;
    assert_eq!(supervisor.active_tasks(), 0);
    run.await.unwrap();
}
