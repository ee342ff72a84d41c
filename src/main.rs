//! API Cluster - HTTP API bootstrap with a crash-counting worker supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api_cluster::alert;
use api_cluster::config::{AppConfig, ConfigLoader};
use api_cluster::server::{BindMode, WorkerRunner};
use api_cluster::supervisor::{Supervisor, SupervisorSettings};
use api_cluster::worker::CommandLauncher;
use api_cluster::Error;

#[derive(Parser)]
#[command(
    name = "api-cluster",
    about = "HTTP API with an optional multi-process worker supervisor",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Serve the API, under the supervisor when clustering is enabled.
    Serve,
    /// Serve the API in this process (spawned by the supervisor).
    #[command(hide = true)]
    Worker,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Run the payload in this process until a shutdown signal arrives.
async fn serve(config: &AppConfig, bind_mode: BindMode) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    WorkerRunner::from_config(config, bind_mode).run(shutdown).await?;
    Ok(())
}

/// Become the supervisor and keep one worker process per slot alive.
async fn supervise(
    config: &AppConfig,
    verbose: u8,
    config_path: Option<&Path>,
) -> Result<(), Error> {
    let settings = SupervisorSettings::from_config(config)?;

    let mut launcher = CommandLauncher::current_exe()?;
    for _ in 0..verbose {
        launcher = launcher.arg("-v");
    }
    if let Some(path) = config_path {
        launcher = launcher.arg("--config").arg(path.as_os_str());
    }

    let alerts = alert::sink_from_config(&config.alert)?;
    let handle = Supervisor::start(settings, Arc::new(launcher), alerts)?;

    shutdown_signal().await;
    tracing::info!("Shutdown requested");

    let status = handle.shutdown().await?;
    tracing::info!(
        crash_count = status.crash_count,
        alerts_sent = status.alerts_sent,
        "Exiting"
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Error> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;
    tracing::debug!(
        environment = %config.environment,
        clustering = config.clustering,
        port = config.server.port,
        "Loaded configuration"
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve if config.clustering => {
            supervise(&config, cli.verbose, cli.config.as_deref()).await
        }
        Commands::Serve => serve(&config, BindMode::Exclusive).await,
        Commands::Worker => serve(&config, BindMode::Shared).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}
