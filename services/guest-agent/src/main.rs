//! Vega Guest Agent
//!
//! Entry point for both halves of the agent. `vega-agent daemon` is the
//! long-lived root process installed as a service; each round it launches
//! `vega-agent run` from the latest installed agent version and supervises
//! it. The `run` process drives the goal state control loop and exits
//! deliberately once a different version should take over.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vega_guest_agent::client::{GoalStateClient, HttpGoalStateClient};
use vega_guest_agent::config::Config;
use vega_guest_agent::control_loop::{AgentContext, ControlLoop};
use vega_guest_agent::daemon::Daemon;
use vega_guest_agent::handlers::{
    ExtensionHandler, ExtensionPipeline, RemoteAccessHandler, RemoteAccessPipeline,
};
use vega_guest_agent::markers::{FileMarkerStore, MarkerStore};
use vega_guest_agent::supervisor::DAEMON_VERSION_ENV;
use vega_guest_agent::telemetry::TelemetryQueue;
use vega_guest_agent::workers::spawn_telemetry_forwarder;
use vega_version::AgentVersion;

/// How often the daemon ships its own telemetry.
const DAEMON_TELEMETRY_PERIOD: Duration = Duration::from_secs(60);

/// Vega guest agent - keeps the VM converged with the platform goal state.
#[derive(Debug, Parser)]
#[command(name = "vega-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the supervising daemon (the service entry point).
    Daemon,

    /// Run the goal state agent (normally launched by the daemon).
    Run {
        /// Stop after this many control-loop iterations.
        #[arg(long)]
        iterations: Option<u32>,

        /// Stop after one iteration; shorthand for --iterations 1.
        #[arg(long)]
        once: bool,
    },

    /// Print the agent version.
    Version,

    /// Print the effective configuration.
    ShowConfiguration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Version => {
            println!("vega-agent {}", packaged_version());
            Ok(())
        }
        Commands::ShowConfiguration => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::Daemon => {
            init_tracing(&config);
            run_daemon(Arc::new(config)).await
        }
        Commands::Run { iterations, once } => {
            if once {
                config.debug_iterations = Some(1);
            } else if iterations.is_some() {
                config.debug_iterations = iterations;
            }
            init_tracing(&config);
            run_agent(Arc::new(config)).await
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// The version compiled into this binary.
fn packaged_version() -> AgentVersion {
    env!("CARGO_PKG_VERSION")
        .parse()
        .expect("package version is a valid agent version")
}

/// The supervising daemon's version, passed down through the environment.
/// Missing or malformed values fall back to this binary's own version.
fn daemon_version_from_env(fallback: AgentVersion) -> AgentVersion {
    match std::env::var(DAEMON_VERSION_ENV) {
        Ok(raw) => match raw.parse() {
            Ok(version) => version,
            Err(e) => {
                debug!(error = %e, raw, "Ignoring malformed daemon version");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

/// Translates SIGTERM/SIGINT into the shutdown watch channel.
fn spawn_signal_handler(shutdown_tx: Arc<watch::Sender<bool>>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    Ok(())
}

async fn run_daemon(config: Arc<Config>) -> Result<()> {
    let version = packaged_version();
    info!(version = %version, endpoint = %config.endpoint, "Starting the vega guest agent daemon");

    let (telemetry, events) = TelemetryQueue::channel(version);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_handler(shutdown_tx.clone())?;

    let client: Arc<dyn GoalStateClient> = Arc::new(HttpGoalStateClient::new(&config));
    let forwarder =
        spawn_telemetry_forwarder(client, events, DAEMON_TELEMETRY_PERIOD, shutdown_rx.clone());

    let markers: Arc<dyn MarkerStore> = Arc::new(FileMarkerStore::new(&config.lib_dir));
    let mut daemon = Daemon::new(config, markers, telemetry, version, shutdown_rx);
    let outcome = daemon.run().await;

    // Flush whatever the last round queued before judging the outcome.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), forwarder).await;
    outcome?;

    info!("Daemon shutdown complete");
    Ok(())
}

async fn run_agent(config: Arc<Config>) -> Result<()> {
    let current_version = packaged_version();
    let daemon_version = daemon_version_from_env(current_version);
    info!(
        version = %current_version,
        daemon_version = %daemon_version,
        endpoint = %config.endpoint,
        "Starting the vega guest agent"
    );

    let (telemetry, events) = TelemetryQueue::channel(current_version);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_handler(shutdown_tx.clone())?;

    let client: Arc<dyn GoalStateClient> = Arc::new(HttpGoalStateClient::new(&config));
    let markers: Arc<dyn MarkerStore> = Arc::new(FileMarkerStore::new(&config.lib_dir));
    let extensions: Arc<dyn ExtensionHandler> = Arc::new(ExtensionPipeline::new());
    let remote_access: Arc<dyn RemoteAccessHandler> = Arc::new(RemoteAccessPipeline::new());

    let mut control_loop = ControlLoop::new(AgentContext {
        config,
        client,
        extensions,
        remote_access,
        markers,
        telemetry,
        events,
        daemon_version,
        shutdown: shutdown_rx,
    });

    let outcome = control_loop.run().await;

    // Stop the workers and flush queued telemetry before judging the outcome.
    let _ = shutdown_tx.send(true);
    control_loop.stop().await;

    // A signalled exit is still exit code zero: the daemon treats a clean
    // exit as "relaunch the latest installed agent", which is how upgrades
    // and memory-limit restarts land.
    if let Some(fatal) = outcome? {
        debug!(signal = ?fatal, "Exiting on a control loop signal");
    }

    info!("Agent shutdown complete");
    Ok(())
}
