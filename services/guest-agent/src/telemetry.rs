//! Operational telemetry for the guest agent.
//!
//! Events are immutable records of agent activity (updates, goal-state
//! fetches, heartbeats). Producers push onto an unbounded queue and never
//! block; the telemetry workers drain the queue in the background and ship
//! batches to the platform. Every reported event is also logged locally so
//! a box with no uplink still has a usable trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{error, info};
use vega_version::AgentVersion;

/// Operation category an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOperation {
    /// Agent update pipeline (version resolution, installs, restarts).
    AgentUpdate,
    /// Goal-state fetch outcomes.
    FetchGoalState,
    /// Package download activity.
    Download,
    /// Periodic liveness signal.
    HeartBeat,
    /// Resident-memory enforcement.
    MemoryUsage,
    /// Child process supervision.
    Supervision,
}

impl std::fmt::Display for TelemetryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TelemetryOperation::AgentUpdate => "agent_update",
            TelemetryOperation::FetchGoalState => "fetch_goal_state",
            TelemetryOperation::Download => "download",
            TelemetryOperation::HeartBeat => "heart_beat",
            TelemetryOperation::MemoryUsage => "memory_usage",
            TelemetryOperation::Supervision => "supervision",
        };
        write!(f, "{}", s)
    }
}

/// A single telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Version of the agent that emitted the event.
    pub agent_version: AgentVersion,

    /// Operation category.
    pub operation: TelemetryOperation,

    /// Whether the operation succeeded.
    pub is_success: bool,

    /// Human-readable detail.
    pub message: String,
}

/// Producer handle for the telemetry queue.
///
/// Cheap to clone; every subsystem that reports events holds one.
#[derive(Debug, Clone)]
pub struct TelemetryQueue {
    agent_version: AgentVersion,
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl TelemetryQueue {
    /// Creates the queue and returns the producer handle plus the receiver
    /// the collector worker drains.
    pub fn channel(
        agent_version: AgentVersion,
    ) -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { agent_version, tx }, rx)
    }

    /// Records an event and mirrors it to the local log.
    pub fn report_event(&self, operation: TelemetryOperation, is_success: bool, message: &str) {
        if is_success {
            info!(operation = %operation, "{message}");
        } else {
            error!(operation = %operation, "{message}");
        }

        let event = TelemetryEvent {
            occurred_at: Utc::now(),
            agent_version: self.agent_version,
            operation,
            is_success,
            message: message.to_string(),
        };

        // The receiver only goes away during shutdown; drop silently then.
        let _ = self.tx.send(event);
    }

    /// Records a successful operation.
    pub fn report_success(&self, operation: TelemetryOperation, message: &str) {
        self.report_event(operation, true, message);
    }

    /// Records a failed operation.
    pub fn report_error(&self, operation: TelemetryOperation, message: &str) {
        self.report_event(operation, false, message);
    }

    #[must_use]
    pub fn agent_version(&self) -> AgentVersion {
        self.agent_version
    }
}

/// Suppresses duplicate reports within a single goal state.
///
/// Several update-pipeline conditions (missing manifest, no matching
/// package, exhausted download URIs) repeat on every poll while the same
/// goal state is active. Reporting them once per goal state keeps the
/// telemetry stream readable; a new incarnation resets the gate.
#[derive(Debug, Default)]
pub struct ReportOnce {
    incarnation: Option<String>,
    seen: HashSet<String>,
}

impl ReportOnce {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is seen under `incarnation`.
    pub fn first(&mut self, incarnation: &str, key: impl Into<String>) -> bool {
        if self.incarnation.as_deref() != Some(incarnation) {
            self.incarnation = Some(incarnation.to_string());
            self.seen.clear();
        }
        self.seen.insert(key.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> AgentVersion {
        "2.1.0".parse().unwrap()
    }

    #[test]
    fn events_carry_the_emitting_version() {
        let (queue, mut rx) = TelemetryQueue::channel(version());
        queue.report_success(TelemetryOperation::HeartBeat, "alive");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.agent_version, version());
        assert_eq!(event.operation, TelemetryOperation::HeartBeat);
        assert!(event.is_success);
        assert_eq!(event.message, "alive");
    }

    #[test]
    fn reporting_survives_a_dropped_receiver() {
        let (queue, rx) = TelemetryQueue::channel(version());
        drop(rx);
        // Must not panic or error out.
        queue.report_error(TelemetryOperation::Download, "gone");
    }

    #[test]
    fn report_once_gates_by_goal_state() {
        let mut gate = ReportOnce::new();
        assert!(gate.first("incarnation_1", "no-manifest"));
        assert!(!gate.first("incarnation_1", "no-manifest"));
        assert!(gate.first("incarnation_1", "download-failed"));

        // New goal state clears everything.
        assert!(gate.first("incarnation_2", "no-manifest"));
        assert!(!gate.first("incarnation_2", "no-manifest"));
    }

    #[test]
    fn operation_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TelemetryOperation::FetchGoalState).unwrap(),
            "\"fetch_goal_state\""
        );
        assert_eq!(TelemetryOperation::AgentUpdate.to_string(), "agent_update");
    }
}
