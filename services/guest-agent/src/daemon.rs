//! Daemon outer loop.
//!
//! The daemon is the long-lived root process. It never processes goal states
//! itself; each round it hands control to the supervisor, which launches the
//! latest installed agent and watches it until it exits. An exiting child is
//! the normal way upgrades land, so the loop simply starts the next round.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use vega_version::AgentVersion;

use crate::config::Config;
use crate::markers::{Marker, MarkerStore};
use crate::supervisor::{ProcessSupervisor, SupervisionOutcome};
use crate::telemetry::{TelemetryOperation, TelemetryQueue};

/// Pause between supervision rounds so a child that exits instantly cannot
/// spin the daemon.
const RELAUNCH_PAUSE: Duration = Duration::from_secs(1);

/// Supervises one child agent at a time, relaunching whenever it exits.
pub struct Daemon {
    config: Arc<Config>,
    markers: Arc<dyn MarkerStore>,
    telemetry: TelemetryQueue,
    supervisor: ProcessSupervisor,
    shutdown: watch::Receiver<bool>,
}

impl Daemon {
    pub fn new(
        config: Arc<Config>,
        markers: Arc<dyn MarkerStore>,
        telemetry: TelemetryQueue,
        daemon_version: AgentVersion,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(
            config.clone(),
            markers.clone(),
            telemetry.clone(),
            daemon_version,
            shutdown.clone(),
        );
        Self {
            config,
            markers,
            telemetry,
            supervisor,
            shutdown,
        }
    }

    /// Runs supervision rounds until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.lib_dir)
            .with_context(|| format!("failed to create {}", self.config.lib_dir.display()))?;

        self.emit_start_event();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.supervisor.run_latest().await {
                SupervisionOutcome::Terminated => break,
                SupervisionOutcome::Exited { code } => {
                    info!(code, "Child agent exited, starting the next round");
                }
                SupervisionOutcome::Skipped => {
                    warn!("No agent was launched this round");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RELAUNCH_PAUSE) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Daemon is exiting");
        Ok(())
    }

    /// The sentinel is written before every spawn and removed only on the
    /// clean shutdown path, so finding it at startup means the previous
    /// generation died without terminating cleanly.
    fn emit_start_event(&self) {
        if self.markers.has(Marker::Sentinel) {
            self.telemetry.report_error(
                TelemetryOperation::Supervision,
                "Recovered start: the previous agent did not terminate cleanly",
            );
        } else {
            self.telemetry
                .report_success(TelemetryOperation::Supervision, "Clean start");
        }
    }
}
