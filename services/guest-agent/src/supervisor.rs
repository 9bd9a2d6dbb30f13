//! Child agent supervision.
//!
//! The daemon process never runs goal-state processing itself. Each round it
//! picks the latest installed agent above the packaged daemon version
//! (falling back to its own binary when none qualifies), launches it with the
//! `run` subcommand, and watches it until it exits. Failures feed back into
//! the per-version error records so a broken agent drops out of the selection
//! order on the next round, and a version that keeps dying inside the launch
//! window is marked fatally failed instead of being relaunched forever.
//!
//! Orphan handling lives here as well: a freshly started agent waits out (and
//! eventually kills) agents left over from a previous daemon generation, and
//! a running agent can detect that its own daemon is gone.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vega_reconcile::{LaunchTracker, DEFAULT_LAUNCH_WINDOW, DEFAULT_MAX_LAUNCHES};
use vega_version::AgentVersion;

use crate::config::Config;
use crate::inventory::{AgentInventory, InstalledAgent, AGENT_BIN_NAME};
use crate::markers::{Marker, MarkerStore};
use crate::telemetry::{TelemetryOperation, TelemetryQueue};

/// Environment variable carrying the daemon's version to the child agent.
pub const DAEMON_VERSION_ENV: &str = "VEGA_DAEMON_VERSION";

/// How long a previous-generation agent may keep running before it is
/// forcibly killed.
const ORPHAN_WAIT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Poll period while waiting for orphans to terminate.
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period between SIGTERM and SIGKILL when stopping the child.
const CHILD_TERM_TIMEOUT: Duration = Duration::from_secs(10);

/// Faults that end a supervision round without a child exit status.
///
/// Both are fatal for the selected version: an agent that cannot even be
/// spawned or watched is worse off than one that exits nonzero.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed while monitoring: {0}")]
    Monitor(#[source] std::io::Error),
}

/// How one supervision round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The child exited on its own with this code.
    Exited { code: i32 },

    /// Shutdown was requested and the child was stopped.
    Terminated,

    /// Nothing was launched: the selected agent is crash-looping or could
    /// not be spawned.
    Skipped,
}

/// The agent chosen for one supervision round.
struct SelectedAgent {
    version: AgentVersion,
    bin: PathBuf,
    cwd: PathBuf,

    /// Present when the child is an installed agent rather than the binary
    /// the daemon itself was started from.
    installed: Option<InstalledAgent>,
}

/// Launches and watches one agent child at a time.
pub struct ProcessSupervisor {
    config: Arc<Config>,
    inventory: AgentInventory,
    markers: Arc<dyn MarkerStore>,
    telemetry: TelemetryQueue,
    daemon_version: AgentVersion,
    launches: LaunchTracker,
    shutdown: watch::Receiver<bool>,
}

impl ProcessSupervisor {
    pub fn new(
        config: Arc<Config>,
        markers: Arc<dyn MarkerStore>,
        telemetry: TelemetryQueue,
        daemon_version: AgentVersion,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let inventory = AgentInventory::new(&config.lib_dir);
        Self {
            config,
            inventory,
            markers,
            telemetry,
            daemon_version,
            launches: LaunchTracker::new(DEFAULT_MAX_LAUNCHES, DEFAULT_LAUNCH_WINDOW),
            shutdown,
        }
    }

    /// Runs one supervision round: select, launch, watch until exit.
    pub async fn run_latest(&mut self) -> SupervisionOutcome {
        let mut selected = self.select_agent();
        let command_line = format!("{} run", selected.bin.display());

        if self.launches.record_launch(&selected.version.to_string()) {
            let msg = format!(
                "Agent {} restarted more than {} times in {} seconds",
                selected.version,
                DEFAULT_MAX_LAUNCHES,
                DEFAULT_LAUNCH_WINDOW.as_secs()
            );
            warn!("{msg}");
            self.telemetry
                .report_error(TelemetryOperation::Supervision, &msg);
            self.mark_selected_failure(&mut selected, &msg, true);
            return SupervisionOutcome::Skipped;
        }

        // The sentinel stays behind on hard stops so the next start can tell
        // it is recovering rather than starting clean.
        if let Err(e) = self.markers.set(Marker::Sentinel) {
            warn!(error = %e, "Failed to write the start sentinel");
        }

        info!(version = %selected.version, command = %command_line, "Launching agent");

        let mut child = match Command::new(&selected.bin)
            .arg("run")
            .current_dir(&selected.cwd)
            .env(DAEMON_VERSION_ENV, self.daemon_version.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return self.handle_exception(
                    &mut selected,
                    &command_line,
                    SupervisorError::Spawn(e),
                );
            }
        };

        let pid = child.id().expect("child should have pid");
        if let Err(e) = self.inventory.write_pid_file(pid) {
            warn!(pid, error = %e, "Failed to record the agent pid");
        }

        self.watch_child(&mut child, &mut selected, &command_line)
            .await
    }

    /// Latest complete, non-blacklisted install above the daemon version,
    /// or the daemon's own binary when none qualifies.
    fn select_agent(&self) -> SelectedAgent {
        let installed = match self.inventory.list() {
            Ok(agents) => agents
                .into_iter()
                .find(|agent| agent.is_available() && agent.version > self.daemon_version),
            Err(e) => {
                warn!(error = %e, "Failed to scan installed agents, running own binary");
                None
            }
        };

        match installed {
            Some(agent) => SelectedAgent {
                version: agent.version,
                bin: agent.bin_path(),
                cwd: agent.dir.clone(),
                installed: Some(agent),
            },
            None => {
                let bin = std::env::current_exe().unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to resolve own binary path");
                    PathBuf::from(AGENT_BIN_NAME)
                });
                SelectedAgent {
                    version: self.daemon_version,
                    bin,
                    cwd: self.config.lib_dir.clone(),
                    installed: None,
                }
            }
        }
    }

    async fn watch_child(
        &mut self,
        child: &mut Child,
        selected: &mut SelectedAgent,
        command_line: &str,
    ) -> SupervisionOutcome {
        let launched_at = Instant::now();
        let mut reported_healthy = false;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => self.handle_exit(selected, command_line, status),
                        Err(e) => self.handle_exception(
                            selected,
                            command_line,
                            SupervisorError::Monitor(e),
                        ),
                    };
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return self.terminate(child, selected).await;
                    }
                }
                _ = tokio::time::sleep(self.config.child_poll_interval) => {
                    if !reported_healthy
                        && launched_at.elapsed() >= self.config.child_health_interval
                    {
                        reported_healthy = true;
                        let msg = format!(
                            "Agent {} launched with command '{}' is successfully running",
                            selected.version, command_line
                        );
                        info!("{msg}");
                        self.telemetry
                            .report_success(TelemetryOperation::Supervision, &msg);
                    }
                }
            }
        }
    }

    fn handle_exit(
        &mut self,
        selected: &mut SelectedAgent,
        command_line: &str,
        status: ExitStatus,
    ) -> SupervisionOutcome {
        match status.code() {
            Some(0) => {
                info!(version = %selected.version, "Agent exited cleanly");
                SupervisionOutcome::Exited { code: 0 }
            }
            Some(code) => {
                let msg = format!(
                    "Agent {} launched with command '{}' failed with return code: {}",
                    selected.version, command_line, code
                );
                warn!("{msg}");
                self.telemetry
                    .report_error(TelemetryOperation::Supervision, &msg);
                if !self.terminating() {
                    self.mark_selected_failure(selected, &msg, false);
                }
                SupervisionOutcome::Exited { code }
            }
            None => {
                // Signal deaths are not scored against the version: during
                // shutdown they are expected, and outside it the signal came
                // from outside the agent.
                let signal = status.signal().unwrap_or(0);
                warn!(version = %selected.version, signal, "Agent terminated by signal");
                SupervisionOutcome::Exited { code: 128 + signal }
            }
        }
    }

    async fn terminate(
        &mut self,
        child: &mut Child,
        selected: &SelectedAgent,
    ) -> SupervisionOutcome {
        info!(version = %selected.version, "Shutdown requested, stopping the supervised agent");

        match child.id() {
            Some(pid) => {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %e, "Failed to signal the supervised agent");
                }
                if tokio::time::timeout(CHILD_TERM_TIMEOUT, child.wait())
                    .await
                    .is_err()
                {
                    warn!(pid, "Supervised agent ignored SIGTERM, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Failed to kill the supervised agent");
                    }
                }
            }
            None => {
                // Already exited; reap it.
                let _ = child.wait().await;
            }
        }

        if let Err(e) = self.markers.clear(Marker::Sentinel) {
            warn!(error = %e, "Failed to clear the start sentinel");
        }
        SupervisionOutcome::Terminated
    }

    fn handle_exception(
        &mut self,
        selected: &mut SelectedAgent,
        command_line: &str,
        error: SupervisorError,
    ) -> SupervisionOutcome {
        let msg = format!(
            "Agent {} launched with command '{}' failed with exception: {}",
            selected.version, command_line, error
        );
        warn!("{msg}");
        self.telemetry
            .report_error(TelemetryOperation::Supervision, &msg);
        if !self.terminating() {
            self.mark_selected_failure(selected, &msg, true);
        }
        SupervisionOutcome::Skipped
    }

    fn mark_selected_failure(&self, selected: &mut SelectedAgent, reason: &str, fatal: bool) {
        // Only installed agents carry error records; the binary the daemon
        // fell back to cannot blacklist itself.
        let Some(agent) = selected.installed.as_mut() else {
            return;
        };
        if let Err(e) = agent.mark_failure(reason, fatal) {
            warn!(version = %agent.version, error = %e, "Failed to record the agent failure");
        }
    }

    fn terminating(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Pid of the process that launched this one.
pub fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

/// True when the daemon that launched this process is gone and the process
/// has been reparented.
pub fn is_orphaned(recorded_parent: u32) -> bool {
    let parent = parent_pid();
    parent == 1 || parent != recorded_parent
}

/// Waits for agents recorded by a previous daemon generation to exit,
/// force-killing any that outlive [`ORPHAN_WAIT_INTERVAL`], and drops their
/// pid files. The calling process's own pid file is left alone.
pub async fn ensure_no_orphans(inventory: &AgentInventory) -> Result<()> {
    let own_pid = std::process::id();

    for pid in inventory.recorded_pids()? {
        if pid == own_pid {
            continue;
        }
        let Ok(raw) = i32::try_from(pid) else {
            inventory.remove_pid_file(pid);
            continue;
        };

        let mut waited = Duration::ZERO;
        while pid_alive(raw) {
            if waited >= ORPHAN_WAIT_INTERVAL {
                warn!(pid, "Forcibly terminating an orphaned agent process");
                if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
                    warn!(pid, error = %e, "Failed to kill the orphaned agent process");
                }
                break;
            }
            debug!(pid, "Waiting for an orphaned agent process to terminate");
            tokio::time::sleep(ORPHAN_POLL_INTERVAL).await;
            waited += ORPHAN_POLL_INTERVAL;
        }

        inventory.remove_pid_file(pid);
    }

    Ok(())
}

fn pid_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}
