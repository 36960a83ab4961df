use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing::info;

use fastlane_core::healer::Healer;
use fastlane_core::store::Store;
use fastlane_core::scheduler::Scheduler;
use fastlane_core::worker::spawn_workers;
use fastlane_core::{Config, Context};

#[derive(Parser)]
#[command(name = "fastlane")]
#[command(about = "Container-backed job execution service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log filter (e.g. info, fastlane_core=debug)")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full service: API, workers, scheduler, healer and pruner
    Server {
        #[arg(short = 'H', long, help = "Bind address")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Port number")]
        port: Option<u16>,

        #[arg(long, help = "Serve the API only, without engine loops")]
        no_workers: bool,
    },

    /// Run engine loops only (workers, scheduler, healer, pruner)
    Worker,

    /// Create or refresh the store schema
    Migrate,

    /// Remove processed containers from every host, once
    Prune,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli.log_level.clone().unwrap_or_else(|| {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Server { host, port, no_workers } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config, !no_workers).await
        }
        Commands::Worker => {
            let ctx = Context::bootstrap(config).await?;
            let shutdown = shutdown_signal();
            run_engine(ctx, shutdown.clone()).await;
            Ok(())
        }
        Commands::Migrate => {
            let ctx = Context::bootstrap(config).await?;
            ctx.store.migrate().await?;
            println!("{}", "schema up to date".green());
            Ok(())
        }
        Commands::Prune => {
            let ctx = Context::bootstrap(config).await?;
            let removed = Healer::new(ctx).prune().await?;
            println!("removed {} containers", removed.to_string().bold());
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display())),
        None => Config::from_env().context("reading configuration from environment"),
    }
}

/// Run API and engine together; both drain on SIGTERM/ctrl-c
async fn serve(config: Config, with_engine: bool) -> anyhow::Result<()> {
    let ctx = Context::bootstrap(config).await?;
    let shutdown = shutdown_signal();

    let engine = if with_engine {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move { run_engine(ctx, shutdown).await }))
    } else {
        None
    };

    fastlane_api::run(ctx, shutdown).await?;
    if let Some(engine) = engine {
        let _ = engine.await;
    }
    println!("{}", "drained, bye".dimmed());
    Ok(())
}

/// Heal once, then run workers, scheduler and pruner until shutdown
async fn run_engine(ctx: std::sync::Arc<Context>, shutdown: watch::Receiver<bool>) {
    let healer = Healer::new(ctx.clone());
    if let Err(e) = healer.heal().await {
        tracing::error!("startup heal failed: {}", e);
    }

    let mut handles = spawn_workers(ctx.clone(), shutdown.clone());
    handles.push(tokio::spawn(Scheduler::new(ctx.clone()).run(shutdown.clone())));
    handles.push(tokio::spawn(Healer::new(ctx).run(shutdown)));

    for handle in handles {
        let _ = handle.await;
    }
    info!("engine drained");
}

/// A watch flag flipped on ctrl-c or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown requested, draining");
        let _ = tx.send(true);
    });
    rx
}
