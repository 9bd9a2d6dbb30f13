//! The goal state control loop.
//!
//! One iteration: orphan check, goal state fetch, agent update evaluation,
//! extension and remote-access processing on a new incarnation, status
//! report, cadence adjustment, then the independent side tasks (heartbeat,
//! memory check, worker liveness). A failed fetch skips the processing steps
//! but never the side tasks. Process-fatal conditions surface as a tagged
//! [`FatalSignal`] handed back to the caller instead of unwinding.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vega_reconcile::{ConvergenceStatus, ErrorStreak, PollCadence, ReportDisposition};
use vega_version::AgentVersion;

use crate::client::GoalStateClient;
use crate::config::Config;
use crate::handlers::{ExtensionHandler, RemoteAccessHandler};
use crate::inventory::AgentInventory;
use crate::markers::MarkerStore;
use crate::resolver::UpgradeKind;
use crate::resources::MemoryCheck;
use crate::status::{ExtensionsSummary, GoalState, GuestAgentState, StatusReport};
use crate::supervisor::{ensure_no_orphans, is_orphaned, parent_pid};
use crate::telemetry::{ReportOnce, TelemetryEvent, TelemetryOperation, TelemetryQueue};
use crate::update::AgentUpdateHandler;
use crate::workers::WorkerSet;

/// Poll period while waiting for the cloud-init state file.
const CLOUD_INIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive fetch failures reported individually before aggregation.
const MAX_IMMEDIATE_FETCH_REPORTS: u32 = 3;

/// Process-fatal conditions. The loop stops, the process exits and the
/// daemon decides what runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSignal {
    /// A different agent version is installed and ready; exit so the daemon
    /// relaunches the latest.
    ExitToRestart {
        target: AgentVersion,
        kind: UpgradeKind,
    },

    /// RSS crossed the configured limit.
    MemoryLimitExceeded,
}

/// Everything the control loop needs from its environment, constructed in
/// `main` and passed down.
pub struct AgentContext {
    pub config: Arc<Config>,
    pub client: Arc<dyn GoalStateClient>,
    pub extensions: Arc<dyn ExtensionHandler>,
    pub remote_access: Arc<dyn RemoteAccessHandler>,
    pub markers: Arc<dyn MarkerStore>,
    pub telemetry: TelemetryQueue,
    pub events: mpsc::UnboundedReceiver<TelemetryEvent>,
    pub daemon_version: AgentVersion,
    pub shutdown: watch::Receiver<bool>,
}

/// Drives goal state processing until shutdown, orphaning or a fatal signal.
pub struct ControlLoop {
    config: Arc<Config>,
    client: Arc<dyn GoalStateClient>,
    extensions: Arc<dyn ExtensionHandler>,
    remote_access: Arc<dyn RemoteAccessHandler>,
    update_handler: AgentUpdateHandler,
    workers: WorkerSet,
    telemetry: TelemetryQueue,
    inventory: AgentInventory,
    cadence: PollCadence,
    gs_errors: ErrorStreak,
    report_once: ReportOnce,
    current_incarnation: Option<String>,
    last_summary: ExtensionsSummary,
    heartbeat_counter: u64,
    heartbeat_id: String,
    next_heartbeat_at: Instant,
    memory: Option<MemoryCheck>,
    memory_error_reported: bool,
    cloud_init_done: bool,
    recorded_parent: u32,
    shutdown: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(context: AgentContext) -> Self {
        let AgentContext {
            config,
            client,
            extensions,
            remote_access,
            markers,
            telemetry,
            events,
            daemon_version,
            shutdown,
        } = context;

        let update_handler = AgentUpdateHandler::new(
            config.clone(),
            client.clone(),
            markers,
            telemetry.clone(),
            telemetry.agent_version(),
            daemon_version,
        );
        let workers = WorkerSet::spawn(
            config.clone(),
            client.clone(),
            telemetry.clone(),
            events,
            shutdown.clone(),
        );
        let memory = config.memory_check_enabled.then(|| {
            MemoryCheck::new(
                config.memory_limit_bytes,
                config.child_launch_interval,
                config.memory_check_period,
            )
        });

        Self {
            inventory: AgentInventory::new(&config.lib_dir),
            cadence: PollCadence::new(config.initial_goal_state_period, config.goal_state_period),
            gs_errors: ErrorStreak::new(
                MAX_IMMEDIATE_FETCH_REPORTS,
                config.gs_error_report_interval,
            ),
            report_once: ReportOnce::new(),
            current_incarnation: None,
            last_summary: ExtensionsSummary::empty(),
            heartbeat_counter: 0,
            heartbeat_id: Uuid::new_v4().to_string().to_uppercase(),
            next_heartbeat_at: Instant::now(),
            memory,
            memory_error_reported: false,
            cloud_init_done: false,
            recorded_parent: parent_pid(),
            config,
            client,
            extensions,
            remote_access,
            update_handler,
            workers,
            telemetry,
            shutdown,
        }
    }

    /// Overrides the parent pid recorded for orphan detection.
    pub fn set_recorded_parent(&mut self, pid: u32) {
        self.recorded_parent = pid;
    }

    /// Runs until shutdown, orphaning, the iteration limit or a fatal
    /// signal. `Ok(None)` means a clean stop.
    pub async fn run(&mut self) -> Result<Option<FatalSignal>> {
        let version = self.telemetry.agent_version();
        info!(version = %version, "Agent is running as the goal state agent");

        ensure_no_orphans(&self.inventory).await?;

        let mut iterations: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                info!("Shutdown requested, stopping the control loop");
                break;
            }
            if is_orphaned(self.recorded_parent) {
                info!("Agent {version} is an orphan -- exiting");
                break;
            }

            if let Some(signal) = self.iterate().await {
                self.announce(&signal);
                self.send_status_report().await;
                return Ok(Some(signal));
            }

            iterations += 1;
            if let Some(limit) = self.config.debug_iterations {
                if iterations >= limit {
                    info!(iterations, "Iteration limit reached, stopping the control loop");
                    break;
                }
            }

            let period = self.cadence.current();
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Shutdown requested, stopping the control loop");
                        break;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Stops the background workers, flushing queued telemetry.
    pub async fn stop(self) {
        self.workers.stop_all().await;
    }

    async fn iterate(&mut self) -> Option<FatalSignal> {
        if let Some((goal_state, gs_updated)) = self.try_update_goal_state().await {
            if let Some(request) = self.update_handler.run(&goal_state, gs_updated).await {
                return Some(FatalSignal::ExitToRestart {
                    target: request.target,
                    kind: request.kind,
                });
            }

            if gs_updated {
                self.cloud_init_barrier().await;

                if let Err(e) = self.extensions.process_goal_state(&goal_state).await {
                    if self.report_once.first(&goal_state.incarnation, "extensions") {
                        error!(error = %e, "Extension processing failed");
                    }
                }
                if let Err(e) = self.remote_access.run(&goal_state).await {
                    if self.report_once.first(&goal_state.incarnation, "remote-access") {
                        error!(error = %e, "Remote access processing failed");
                    }
                }
            }

            self.compose_and_report_status().await;

            let convergence = if self.last_summary.converged() {
                ConvergenceStatus::Converged
            } else {
                ConvergenceStatus::Converging
            };
            self.cadence.observe(convergence, gs_updated);
        }

        // Side tasks run even when the fetch failed, each isolated so a
        // failure cannot abort the loop.
        self.maybe_heartbeat();
        if let Some(signal) = self.check_memory() {
            return Some(signal);
        }
        self.workers.ensure_running();

        None
    }

    /// Fetches the goal state, tracking the failure streak. Returns the
    /// goal state and whether it carries a new incarnation.
    async fn try_update_goal_state(&mut self) -> Option<(GoalState, bool)> {
        match self.client.fetch_goal_state().await {
            Ok(goal_state) => {
                if self.gs_errors.record_success() {
                    let msg = "Fetching the goal state recovered from previous errors.";
                    self.telemetry
                        .report_success(TelemetryOperation::FetchGoalState, msg);
                }

                let gs_updated = self.current_incarnation.as_deref()
                    != Some(goal_state.incarnation.as_str());
                if gs_updated {
                    info!(incarnation = %goal_state.incarnation, "Fetched new goal state");
                    self.current_incarnation = Some(goal_state.incarnation.clone());
                } else {
                    debug!(incarnation = %goal_state.incarnation, "Goal state unchanged");
                }

                Some((goal_state, gs_updated))
            }
            Err(e) => {
                match self.gs_errors.record_failure() {
                    ReportDisposition::Immediate => {
                        let msg = format!("Error fetching the goal state: {e}");
                        self.telemetry
                            .report_error(TelemetryOperation::FetchGoalState, &msg);
                    }
                    ReportDisposition::Periodic => {
                        let msg = format!("Fetching the goal state is still failing: {e}");
                        self.telemetry
                            .report_error(TelemetryOperation::FetchGoalState, &msg);
                    }
                    ReportDisposition::Suppress => {
                        debug!(error = %e, "Goal state fetch still failing");
                    }
                }
                None
            }
        }
    }

    async fn cloud_init_barrier(&mut self) {
        if self.cloud_init_done || !self.config.wait_for_cloud_init {
            return;
        }

        info!(
            path = %self.config.cloud_init_state_file.display(),
            "Waiting for cloud-init to complete"
        );
        wait_for_cloud_init(
            &self.config.cloud_init_state_file,
            self.config.cloud_init_timeout,
            &mut self.shutdown,
        )
        .await;

        // One-shot: either cloud-init finished or the timeout was spent.
        self.cloud_init_done = true;
    }

    async fn compose_and_report_status(&mut self) {
        match self.extensions.report_status().await {
            Ok(summary) => self.last_summary = summary,
            Err(e) => {
                let incarnation = self.current_incarnation.clone().unwrap_or_default();
                if self.report_once.first(&incarnation, "compose-status") {
                    error!(error = %e, "Failed to compose the extension status");
                }
            }
        }
        self.send_status_report().await;
    }

    async fn send_status_report(&mut self) {
        let report = StatusReport {
            incarnation: self.current_incarnation.clone(),
            agent_version: self.telemetry.agent_version(),
            state: GuestAgentState::Ready,
            reported_at: Utc::now(),
            update_status: self.update_handler.update_status(),
            extensions_expected: self.last_summary.expected,
            extensions_transitioning: self.last_summary.transitioning,
        };

        if let Err(e) = self.client.report_status(&report).await {
            let incarnation = self.current_incarnation.clone().unwrap_or_default();
            if self.report_once.first(&incarnation, "report-status") {
                warn!(error = %e, "Failed to report status");
            } else {
                debug!(error = %e, "Failed to report status");
            }
        }
    }

    fn maybe_heartbeat(&mut self) {
        if Instant::now() < self.next_heartbeat_at {
            return;
        }
        self.next_heartbeat_at = Instant::now() + self.config.heartbeat_period;

        let msg = heartbeat_message(
            self.telemetry.agent_version(),
            self.heartbeat_counter,
            &self.heartbeat_id,
            self.gs_errors.count(),
            self.config.autoupdate_enabled,
        );
        self.telemetry
            .report_success(TelemetryOperation::HeartBeat, &msg);
        self.heartbeat_counter += 1;
    }

    fn check_memory(&mut self) -> Option<FatalSignal> {
        let check = self.memory.as_mut()?;
        match check.poll()? {
            Ok(sample) if sample.exceeded() => {
                let msg = format!(
                    "Agent {} is reached memory limit -- exiting",
                    self.telemetry.agent_version()
                );
                warn!(
                    rss_bytes = sample.rss_bytes,
                    limit_bytes = sample.limit_bytes,
                    "Memory limit exceeded"
                );
                self.telemetry
                    .report_error(TelemetryOperation::MemoryUsage, &msg);
                Some(FatalSignal::MemoryLimitExceeded)
            }
            Ok(sample) => {
                debug!(rss_bytes = sample.rss_bytes, "Memory check passed");
                None
            }
            Err(e) => {
                let msg = format!("Error checking the agent's memory usage: {e}");
                warn!("{msg}");
                if !self.memory_error_reported {
                    self.memory_error_reported = true;
                    self.telemetry
                        .report_error(TelemetryOperation::MemoryUsage, &msg);
                }
                None
            }
        }
    }

    fn announce(&self, signal: &FatalSignal) {
        match signal {
            FatalSignal::ExitToRestart { target, kind } => {
                let msg = format!(
                    "Current Agent {} completed all update checks, exiting current process to {} to the new Agent version {}",
                    self.telemetry.agent_version(),
                    kind,
                    target
                );
                self.telemetry
                    .report_success(TelemetryOperation::AgentUpdate, &msg);
            }
            // Already reported at detection time.
            FatalSignal::MemoryLimitExceeded => {}
        }
    }
}

/// Waits until the cloud-init state file exists, the timeout elapses or
/// shutdown is signalled.
async fn wait_for_cloud_init(
    state_file: &Path,
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let deadline = Instant::now() + timeout;

    loop {
        if state_file.exists() {
            info!("cloud-init completed");
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                path = %state_file.display(),
                "Timed out waiting for cloud-init, continuing without it"
            );
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(CLOUD_INIT_POLL_INTERVAL.min(remaining)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn heartbeat_message(
    version: AgentVersion,
    counter: u64,
    heartbeat_id: &str,
    gs_errors: u32,
    autoupdate_enabled: bool,
) -> String {
    format!(
        "[HEARTBEAT] Agent {} is running as the goal state agent [DEBUG HeartbeatCounter: {};HeartbeatId: {};UpdateGSErrors: {};AutoUpdate: {}]",
        version,
        counter,
        heartbeat_id,
        gs_errors,
        u8::from(autoupdate_enabled)
    )
}
