//! lifecycle-demo: drives a small service set through validate, init,
//! health check, run and shutdown

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use service_lifecycle::{Args, Context, Error, LifecycleOrchestrator};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod services;

use config::DemoConfig;

#[derive(Parser)]
#[command(name = "lifecycle-demo")]
#[command(about = "Service lifecycle orchestration demo")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and every service descriptor
    Validate,

    /// Print the resolved init order and service states
    Order,

    /// Run the full lifecycle until the main runners finish or a signal arrives
    Run,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = smol::block_on(run_cli(cli)) {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Process exit code for a failed command
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>()
        .map(Error::exit_code)
        .unwrap_or(1)
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = DemoConfig::load(cli.config.as_deref())?;
    init_logging(&config.log_level);

    let orchestrator = services::build(config.lifecycle.clone(), &config.workload)?;
    let ctx = Context::background();

    match cli.command {
        Commands::Validate => {
            orchestrator.validate(&ctx).await?;
            println!("✓ Configuration valid");
            println!("  Services: {}", orchestrator.services().len());
            Ok(())
        }
        Commands::Order => print_order(&orchestrator, &ctx).await,
        Commands::Run => {
            watch_signals(ctx.clone())?;
            orchestrator.run(&ctx).await?;
            info!("Lifecycle complete");
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn print_order(orchestrator: &LifecycleOrchestrator, ctx: &Context) -> Result<()> {
    orchestrator.validate(ctx).await?;
    orchestrator.init(ctx).await?;

    let result = async {
        let graph = orchestrator
            .graph()
            .context("dependency graph missing after init")?;
        println!("Init order:");
        for (position, id) in graph.topological_order().enumerate() {
            let dependencies: Vec<&str> = graph.dependencies_of(id).collect();
            if dependencies.is_empty() {
                println!("  {}. {}", position + 1, id);
            } else {
                println!("  {}. {} (requires {})", position + 1, id, dependencies.join(", "));
            }
        }

        let session = orchestrator
            .invoke(ctx, "session", Args::new().with("demo".to_string()))
            .await?
            .downcast::<services::Session>()
            .context("session factory produced an unexpected type")?;
        println!("Factory: {}", session.greet());

        println!("States:");
        for status in orchestrator.status() {
            println!(
                "  {:<10} {:<14} since {}",
                status.name,
                status.state.to_string(),
                status.last_state_change.format("%H:%M:%S%.3f")
            );
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    orchestrator.shutdown(ctx).await?;
    result
}

/// Cancel `ctx` on SIGINT or SIGTERM; a second signal exits immediately
fn watch_signals(ctx: Context) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handler")?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            if ctx.cancel_with_cause(format!("received signal {signal}")) {
                info!("Received signal {}, shutting down", signal);
            } else {
                warn!("Received signal {} again, exiting", signal);
                std::process::exit(Error::Canceled.exit_code());
            }
        }
    });
    Ok(())
}
