//! Version-resolution rules for agent updates.
//!
//! Pure decision logic, separated from the orchestration in `update` so the
//! rules can be tested without wire traffic or a lib directory. Two update
//! channels exist:
//!
//! - **RSM**: the platform's rollout manager names an exact version in the
//!   goal state. Honored only when the VM is enrolled and the version
//!   actually originated from a rollout.
//! - **Self-update**: the agent tracks the largest version advertised in
//!   the agent manifest, rate-limited by upgrade-type windows.
//!
//! The very first update on a VM always goes through self-update so a
//! stale image recovers even when enrollment data is wrong.

use vega_version::AgentVersion;

use crate::status::AgentFamily;

/// Update channel a goal state is evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateChannel {
    SelfUpdate,
    Rsm,
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateChannel::SelfUpdate => write!(f, "self-update"),
            UpdateChannel::Rsm => write!(f, "rsm"),
        }
    }
}

/// Direction of a version change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    Upgrade,
    Downgrade,
}

impl std::fmt::Display for UpgradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeKind::Upgrade => write!(f, "upgrade"),
            UpgradeKind::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// Which channel evaluates this goal state, or why neither can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    SelfUpdate,
    Rsm { requested: AgentVersion },

    /// Enrolled goal state is missing the version property.
    RsmVersionMissing,

    /// Enrolled goal state carries a version that did not originate from
    /// an RSM rollout; neither channel acts on it.
    RsmVersionNotFromRsm,
}

/// Pick the update channel for a goal state's agent family.
#[must_use]
pub fn decide_channel(
    family: &AgentFamily,
    rsm_enabled: bool,
    initial_update_attempted: bool,
) -> ChannelDecision {
    // The first-ever update is forced onto self-update.
    if !initial_update_attempted {
        return ChannelDecision::SelfUpdate;
    }

    if rsm_enabled && family.rsm_enrolled {
        if !family.version_from_rsm {
            return ChannelDecision::RsmVersionNotFromRsm;
        }
        return match family.requested_version {
            Some(requested) => ChannelDecision::Rsm { requested },
            None => ChannelDecision::RsmVersionMissing,
        };
    }

    ChannelDecision::SelfUpdate
}

/// Outcome of evaluating an RSM-requested version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsmDecision {
    Proceed { kind: UpgradeKind },

    /// Requested version is what is already running.
    UpToDate,

    /// Requested version is older than the agent baked into the image.
    BelowDaemon,

    /// Requested version is older than the running agent and downgrades
    /// are not enabled.
    DowngradeDisabled,
}

/// Apply the RSM version rules.
#[must_use]
pub fn evaluate_rsm_target(
    requested: AgentVersion,
    current: AgentVersion,
    daemon: AgentVersion,
    downgrade_enabled: bool,
) -> RsmDecision {
    if requested == current {
        return RsmDecision::UpToDate;
    }
    if requested < daemon {
        return RsmDecision::BelowDaemon;
    }
    if requested < current && !downgrade_enabled {
        return RsmDecision::DowngradeDisabled;
    }

    let kind = if requested > current {
        UpgradeKind::Upgrade
    } else {
        UpgradeKind::Downgrade
    };
    RsmDecision::Proceed { kind }
}

/// Self-update only ever moves forward: the largest manifest version is a
/// candidate when it is strictly newer than the running agent.
#[must_use]
pub fn select_self_update_target(
    largest: Option<AgentVersion>,
    current: AgentVersion,
) -> Option<AgentVersion> {
    largest.filter(|candidate| *candidate > current)
}

/// Self-update window class for a candidate version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfUpdateWindow {
    /// Same major.minor.patch, only the build component moved.
    Hotfix,
    Regular,
}

#[must_use]
pub fn self_update_window(current: AgentVersion, target: AgentVersion) -> SelfUpdateWindow {
    if target.is_hotfix_of(&current) {
        SelfUpdateWindow::Hotfix
    } else {
        SelfUpdateWindow::Regular
    }
}
