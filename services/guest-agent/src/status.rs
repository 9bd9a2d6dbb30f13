//! Wire model shared with the platform endpoint.
//!
//! Covers the three documents the agent exchanges with the platform:
//! the goal state it polls, the agent manifest it resolves packages from,
//! and the status report it posts back every cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vega_version::AgentVersion;

/// Goal state fetched from the platform.
///
/// The incarnation is an opaque string that changes whenever the platform
/// publishes new desired state. Ordering is meaningless; only equality with
/// the previously processed value matters.
#[derive(Debug, Clone, Deserialize)]
pub struct GoalState {
    pub incarnation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub agent_families: Vec<AgentFamily>,
    #[serde(default)]
    pub extensions: Vec<ExtensionGoal>,
}

impl GoalState {
    /// The agent family this agent tracks, if the goal state carries one.
    #[must_use]
    pub fn family(&self, name: &str) -> Option<&AgentFamily> {
        self.agent_families.iter().find(|f| f.name == name)
    }
}

/// Desired agent state for one family.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentFamily {
    pub name: String,

    /// Locations of the agent manifest, tried in order.
    #[serde(default)]
    pub manifest_uris: Vec<String>,

    /// Version requested by the platform's rollout manager (RSM).
    #[serde(default)]
    pub requested_version: Option<AgentVersion>,

    /// Whether `requested_version` originates from an RSM rollout.
    #[serde(default)]
    pub version_from_rsm: bool,

    /// Whether this VM is enrolled for RSM-driven upgrades.
    #[serde(default)]
    pub rsm_enrolled: bool,
}

/// One extension in the goal state. The agent only needs enough of the
/// shape to hand it to the extension pipeline and count what is expected.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionGoal {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Agent manifest resolved from one of the family's `manifest_uris`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentManifest {
    #[serde(default)]
    pub packages: Vec<AgentPackage>,
}

impl AgentManifest {
    /// Largest advertised version, if the manifest has any packages.
    #[must_use]
    pub fn largest_version(&self) -> Option<AgentVersion> {
        self.packages.iter().map(|p| p.version).max()
    }

    /// Package entry for an exact version.
    #[must_use]
    pub fn package(&self, version: AgentVersion) -> Option<&AgentPackage> {
        self.packages.iter().find(|p| p.version == version)
    }
}

/// A downloadable agent package.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentPackage {
    pub version: AgentVersion,

    /// Download locations, tried in order.
    #[serde(default)]
    pub uris: Vec<String>,

    /// Hex-encoded SHA-256 of the archive, verified when present.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Overall agent health reported to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAgentState {
    Ready,
    NotReady,
}

impl std::fmt::Display for GuestAgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestAgentState::Ready => write!(f, "ready"),
            GuestAgentState::NotReady => write!(f, "not_ready"),
        }
    }
}

/// Outcome kind carried in an update status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Success,
    Error,
}

/// Update status attached to a status report when an RSM rollout is in
/// play. Self-update never produces one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdateStatus {
    pub expected_version: AgentVersion,
    pub status: UpdateOutcome,
    pub code: i32,
    pub message: String,
}

impl AgentUpdateStatus {
    /// A code-0 success for `expected_version`.
    #[must_use]
    pub fn success(expected_version: AgentVersion, message: impl Into<String>) -> Self {
        Self {
            expected_version,
            status: UpdateOutcome::Success,
            code: 0,
            message: message.into(),
        }
    }

    /// An error with an explicit wire code.
    #[must_use]
    pub fn error(expected_version: AgentVersion, code: i32, message: impl Into<String>) -> Self {
        Self {
            expected_version,
            status: UpdateOutcome::Error,
            code,
            message: message.into(),
        }
    }
}

/// Status report posted to the platform every control-loop cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Incarnation of the goal state this report responds to, when one
    /// has been fetched successfully at least once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incarnation: Option<String>,

    pub agent_version: AgentVersion,
    pub state: GuestAgentState,
    pub reported_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_status: Option<AgentUpdateStatus>,

    /// Count of extensions expected by the active goal state.
    pub extensions_expected: usize,

    /// Count of extensions still transitioning.
    pub extensions_transitioning: usize,
}

/// Outcome of one extension-processing pass, used for convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionsSummary {
    pub expected: usize,
    pub transitioning: usize,
}

impl ExtensionsSummary {
    /// Summary for a goal state with nothing expected.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            expected: 0,
            transitioning: 0,
        }
    }

    /// All expected extensions reached a terminal state.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.transitioning == 0
    }
}
