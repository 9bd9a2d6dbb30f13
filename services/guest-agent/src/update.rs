//! Agent update pipeline.
//!
//! Runs once per control-loop iteration, before extension processing, and
//! decides whether this process should hand over to a different agent
//! version. Two channels exist: RSM, where the platform's rollout manager
//! pins an exact version in the goal state, and self-update, where the
//! agent tracks the largest version advertised in the family manifest,
//! throttled by hotfix/regular windows. A decided update ends with an
//! [`UpgradeRequest`]; the control loop turns that into a process exit so
//! the daemon can launch the new version.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};
use vega_version::AgentVersion;

use crate::client::GoalStateClient;
use crate::config::Config;
use crate::installer::PackageInstaller;
use crate::inventory::AgentInventory;
use crate::markers::{Marker, MarkerStore};
use crate::resolver::{self, ChannelDecision, RsmDecision, SelfUpdateWindow, UpdateChannel, UpgradeKind};
use crate::status::{AgentFamily, AgentManifest, AgentUpdateStatus, GoalState};
use crate::telemetry::{ReportOnce, TelemetryOperation, TelemetryQueue};

/// Update attempts per target version before the updater gives up on it.
const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// A decided update. The control loop exits the process in response so the
/// daemon can launch the target version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub target: AgentVersion,
    pub kind: UpgradeKind,
}

/// Drives version resolution and package installation for one agent
/// process. Single-writer over the inventory; owned by the control loop.
pub struct AgentUpdateHandler {
    config: Arc<Config>,
    client: Arc<dyn GoalStateClient>,
    installer: PackageInstaller,
    inventory: AgentInventory,
    markers: Arc<dyn MarkerStore>,
    telemetry: TelemetryQueue,

    current_version: AgentVersion,
    daemon_version: AgentVersion,

    /// Cached family manifest plus the refresh gate state.
    manifest: Option<AgentManifest>,
    last_manifest_attempt_at: Option<Instant>,
    last_manifest_incarnation: Option<String>,

    /// Earliest next self-update attempt per window class.
    next_hotfix_at: Instant,
    next_regular_at: Instant,

    report_once: ReportOnce,
    last_update_status: Option<AgentUpdateStatus>,
}

impl AgentUpdateHandler {
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn GoalStateClient>,
        markers: Arc<dyn MarkerStore>,
        telemetry: TelemetryQueue,
        current_version: AgentVersion,
        daemon_version: AgentVersion,
    ) -> Self {
        let installer = PackageInstaller::new(&config.lib_dir);
        let inventory = AgentInventory::new(&config.lib_dir);

        // First windows carry a random delay so a fleet rebooting together
        // does not stampede the package servers.
        let next_hotfix_at = Instant::now() + jittered(config.selfupdate_hotfix_interval);
        let next_regular_at = Instant::now() + jittered(config.selfupdate_regular_interval);

        Self {
            config,
            client,
            installer,
            inventory,
            markers,
            telemetry,
            current_version,
            daemon_version,
            manifest: None,
            last_manifest_attempt_at: None,
            last_manifest_incarnation: None,
            next_hotfix_at,
            next_regular_at,
            report_once: ReportOnce::new(),
            last_update_status: None,
        }
    }

    #[must_use]
    pub fn current_version(&self) -> AgentVersion {
        self.current_version
    }

    /// Update status to attach to the next status report, when the RSM
    /// channel produced one. Self-update never reports an update status.
    #[must_use]
    pub fn update_status(&self) -> Option<AgentUpdateStatus> {
        self.last_update_status.clone()
    }

    /// Evaluate the goal state for an agent update. `gs_updated` is true
    /// when `goal_state` carries a new incarnation; the RSM channel only
    /// re-evaluates on a new incarnation, while self-update is gated by
    /// elapsed time instead.
    pub async fn run(&mut self, goal_state: &GoalState, gs_updated: bool) -> Option<UpgradeRequest> {
        let initial = !self.markers.has(Marker::InitialUpdateAttempted);
        let request = self.evaluate(goal_state, gs_updated, initial).await;

        // The first-ever evaluation counts whether it attempted anything
        // or skipped; it is never re-run.
        if initial {
            if let Err(e) = self.markers.set(Marker::InitialUpdateAttempted) {
                warn!(error = %e, "Failed to persist the initial-update marker");
            }
        }
        request
    }

    async fn evaluate(
        &mut self,
        goal_state: &GoalState,
        gs_updated: bool,
        initial: bool,
    ) -> Option<UpgradeRequest> {
        let incarnation = goal_state.incarnation.clone();

        if !self.config.autoupdate_enabled {
            if self.markers.has(Marker::RsmUpdateAttempted) {
                let message = "Auto update is disabled, skipping agent update";
                if self.report_once.first(&incarnation, "autoupdate-disabled") {
                    self.telemetry
                        .report_error(TelemetryOperation::AgentUpdate, message);
                }
                self.last_update_status =
                    Some(AgentUpdateStatus::error(self.current_version, 1, message));
            } else {
                self.last_update_status = None;
            }
            return None;
        }

        let family = goal_state
            .family(&self.config.family)
            .filter(|f| !f.manifest_uris.is_empty());
        let Some(family) = family else {
            self.last_update_status = None;
            if self.report_once.first(&incarnation, "no-manifest-links") {
                let message = format!(
                    "No manifest links found for agent family: {}. Skipping agent update",
                    self.config.family
                );
                self.telemetry
                    .report_error(TelemetryOperation::AgentUpdate, &message);
            }
            return None;
        };
        let family = family.clone();

        // An RSM attempt leaves a durable marker; it goes away once the
        // goal state stops enrolling the VM.
        if !family.rsm_enrolled && self.markers.has(Marker::RsmUpdateAttempted) {
            debug!("Goal state is no longer RSM enrolled, clearing the RSM marker");
            if let Err(e) = self.markers.clear(Marker::RsmUpdateAttempted) {
                warn!(error = %e, "Failed to clear the RSM marker");
            }
        }

        match resolver::decide_channel(&family, self.config.rsm_enabled, !initial) {
            ChannelDecision::RsmVersionNotFromRsm => {
                self.last_update_status = None;
                if self.report_once.first(&incarnation, "not-from-rsm") {
                    debug!(
                        "Agent version in the goal state did not originate from RSM, skipping agent update"
                    );
                }
                None
            }
            ChannelDecision::RsmVersionMissing => {
                let message = format!(
                    "Agent family: {} is missing version property. So, skipping agent update",
                    family.name
                );
                if self.report_once.first(&incarnation, "missing-version") {
                    self.telemetry
                        .report_error(TelemetryOperation::AgentUpdate, &message);
                }
                self.last_update_status =
                    Some(AgentUpdateStatus::error(self.current_version, 1, message));
                None
            }
            ChannelDecision::SelfUpdate => {
                self.last_update_status = None;
                self.run_self_update(&incarnation, &family, initial).await
            }
            ChannelDecision::Rsm { requested } => {
                self.run_rsm(&incarnation, &family, requested, gs_updated)
                    .await
            }
        }
    }

    async fn run_rsm(
        &mut self,
        incarnation: &str,
        family: &AgentFamily,
        requested: AgentVersion,
        gs_updated: bool,
    ) -> Option<UpgradeRequest> {
        if !gs_updated {
            // Pending RSM state is only re-evaluated on a new incarnation;
            // the previously reported update status stands.
            return None;
        }

        match resolver::evaluate_rsm_target(
            requested,
            self.current_version,
            self.daemon_version,
            self.config.downgrade_enabled,
        ) {
            RsmDecision::UpToDate => {
                debug!(version = %requested, "Requested RSM version is already running");
                self.last_update_status =
                    Some(AgentUpdateStatus::success(self.current_version, ""));
                None
            }
            RsmDecision::BelowDaemon => {
                let message = format!(
                    "The Agent received a request to downgrade to version {requested}, \
                     but downgrading to a version less than the Agent installed on the image \
                     ({daemon}) is not supported. Skipping downgrade.",
                    daemon = self.daemon_version
                );
                if self
                    .report_once
                    .first(incarnation, format!("below-daemon:{requested}"))
                {
                    self.telemetry
                        .report_error(TelemetryOperation::AgentUpdate, &message);
                }
                self.last_update_status = Some(AgentUpdateStatus::error(requested, 1, message));
                None
            }
            RsmDecision::DowngradeDisabled => {
                let message = format!(
                    "The Agent received a request to downgrade to version {requested}, \
                     but downgrades are not enabled on this VM. Skipping downgrade."
                );
                if self
                    .report_once
                    .first(incarnation, format!("downgrade-disabled:{requested}"))
                {
                    self.telemetry
                        .report_error(TelemetryOperation::AgentUpdate, &message);
                }
                self.last_update_status = Some(AgentUpdateStatus::error(requested, 1, message));
                None
            }
            RsmDecision::Proceed { kind } => {
                let message = format!(
                    "New agent version:{requested} requested by RSM in Goal state \
                     incarnation_{incarnation}, will update the agent before processing the goal state"
                );
                self.telemetry
                    .report_success(TelemetryOperation::AgentUpdate, &message);

                if let Err(e) = self.markers.set(Marker::RsmUpdateAttempted) {
                    warn!(error = %e, "Failed to persist the RSM-attempt marker");
                }

                self.attempt_update(incarnation, family, requested, kind, UpdateChannel::Rsm)
                    .await
            }
        }
    }

    async fn run_self_update(
        &mut self,
        incarnation: &str,
        family: &AgentFamily,
        initial: bool,
    ) -> Option<UpgradeRequest> {
        let now = Instant::now();
        if !initial && now < self.next_hotfix_at && now < self.next_regular_at {
            debug!("No self-update window is due");
            return None;
        }

        let manifest = self.refresh_manifest(incarnation, family).await?;
        let target =
            resolver::select_self_update_target(manifest.largest_version(), self.current_version)?;

        let window = resolver::self_update_window(self.current_version, target);
        if !initial {
            let due = match window {
                SelfUpdateWindow::Hotfix => now >= self.next_hotfix_at,
                SelfUpdateWindow::Regular => now >= self.next_regular_at,
            };
            if !due {
                debug!(version = %target, "Self-update candidate is outside its window");
                return None;
            }
        }

        let message = format!(
            "Self-update is ready to upgrade the new agent: {target} now before processing \
             the goal state: incarnation_{incarnation}"
        );
        self.telemetry
            .report_success(TelemetryOperation::AgentUpdate, &message);

        // The windows restart whether or not the attempt works out.
        self.next_hotfix_at = Instant::now() + self.config.selfupdate_hotfix_interval;
        self.next_regular_at = Instant::now() + self.config.selfupdate_regular_interval;

        self.attempt_update(
            incarnation,
            family,
            target,
            UpgradeKind::Upgrade,
            UpdateChannel::SelfUpdate,
        )
        .await
    }

    /// Install `target` and, when everything checks out, request the
    /// process restart that hands over to it.
    async fn attempt_update(
        &mut self,
        incarnation: &str,
        family: &AgentFamily,
        target: AgentVersion,
        kind: UpgradeKind,
        channel: UpdateChannel,
    ) -> Option<UpgradeRequest> {
        let Some(manifest) = self.refresh_manifest(incarnation, family).await else {
            return None;
        };

        let Some(package) = manifest.package(target).cloned() else {
            let message = format!(
                "No matching package found in the agent manifest for version: {target} \
                 in goal state incarnation: {incarnation}, skipping agent update"
            );
            if self
                .report_once
                .first(incarnation, format!("no-package:{target}"))
            {
                self.telemetry
                    .report_error(TelemetryOperation::AgentUpdate, &message);
            }
            self.set_error_status(channel, target, message);
            return None;
        };

        let attempts = self.inventory.update_attempts(target);
        let blacklisted = self
            .inventory
            .get(target)
            .is_some_and(|agent| agent.error.is_blacklisted());
        if attempts >= MAX_UPDATE_ATTEMPTS && blacklisted {
            let message = format!(
                "Attempted enough update retries for version: {target} but still agent \
                 not recovered from bad state"
            );
            if self
                .report_once
                .first(incarnation, format!("retries-exhausted:{target}"))
            {
                self.telemetry
                    .report_error(TelemetryOperation::AgentUpdate, &message);
            }
            self.set_error_status(channel, target, message);
            return None;
        }

        match self.inventory.record_update_attempt(target) {
            Ok(count) => debug!(version = %target, attempt = count, "Recorded update attempt"),
            Err(e) => warn!(version = %target, error = %e, "Failed to record update attempt"),
        }

        if let Err(e) = self.installer.install(&*self.client, &package).await {
            let message = e.to_string();
            warn!(version = %target, channel = %channel, "{message}");
            if self
                .report_once
                .first(incarnation, format!("install-failed:{target}"))
            {
                self.telemetry
                    .report_error(TelemetryOperation::Download, &message);
            }
            self.set_error_status(channel, target, message);
            return None;
        }

        // Proceeding wipes the target's failure history: a fresh install
        // gets a fresh chance, and the attempt ceiling above is what ends
        // the cycle for versions that never recover.
        match self.inventory.get(target) {
            Some(mut agent) => {
                if let Err(e) = agent.clear_errors() {
                    warn!(version = %target, error = %e, "Failed to clear the agent's failure record");
                }
                if !agent.is_complete() {
                    let message =
                        format!("Installed agent vega-agent-{target} is incomplete, skipping agent update");
                    warn!("{message}");
                    self.set_error_status(channel, target, message);
                    return None;
                }
            }
            None => {
                let message =
                    format!("Installed agent vega-agent-{target} went missing, skipping agent update");
                warn!("{message}");
                self.set_error_status(channel, target, message);
                return None;
            }
        }

        if let Err(e) = self
            .inventory
            .purge_outdated(&[self.current_version, target])
        {
            warn!(error = %e, "Failed to purge outdated agents");
        }

        info!(
            current = %self.current_version,
            target = %target,
            channel = %channel,
            "Agent update is ready"
        );
        Some(UpgradeRequest { target, kind })
    }

    /// Fetch the family manifest, at most once per refresh interval unless
    /// the incarnation changed. Failed attempts also arm the gate.
    async fn refresh_manifest(
        &mut self,
        incarnation: &str,
        family: &AgentFamily,
    ) -> Option<AgentManifest> {
        let due = self
            .last_manifest_attempt_at
            .map_or(true, |at| at.elapsed() >= self.config.manifest_refresh_interval);
        let incarnation_changed =
            self.last_manifest_incarnation.as_deref() != Some(incarnation);

        if !due && !incarnation_changed {
            return self.manifest.clone();
        }

        self.last_manifest_attempt_at = Some(Instant::now());
        self.last_manifest_incarnation = Some(incarnation.to_string());

        for uri in &family.manifest_uris {
            match self.client.fetch_agent_manifest(uri).await {
                Ok(manifest) => {
                    debug!(uri = %uri, packages = manifest.packages.len(), "Fetched agent manifest");
                    self.manifest = Some(manifest);
                    return self.manifest.clone();
                }
                Err(e) => {
                    warn!(uri = %uri, error = %e, "Failed to fetch agent manifest, trying next URI");
                }
            }
        }

        if self.report_once.first(incarnation, "manifest-fetch-failed") {
            self.telemetry.report_error(
                TelemetryOperation::AgentUpdate,
                &format!(
                    "Failed to fetch the agent manifest for family: {} from all URIs",
                    family.name
                ),
            );
        }
        None
    }

    fn set_error_status(&mut self, channel: UpdateChannel, target: AgentVersion, message: String) {
        if channel == UpdateChannel::Rsm {
            self.last_update_status = Some(AgentUpdateStatus::error(target, 1, message));
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    if interval.as_secs() == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::rng().random_range(0..=interval.as_secs()))
}
