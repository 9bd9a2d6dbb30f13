//! Extension and remote-access interfaces and built-in implementations.
//!
//! The control loop hands each new incarnation to the handlers exactly once
//! and polls [`ExtensionHandler::report_status`] every cycle; the returned
//! summary drives convergence tracking and the reported status blob. Real
//! extension execution hangs off this seam; the built-in pipeline
//! acknowledges goals and reports them terminal, which is enough to drive
//! the agent-update and cadence machinery.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::status::{ExtensionsSummary, GoalState};

/// Extension processing interface.
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    /// Process the extensions carried by a goal state. Called once per new
    /// incarnation.
    async fn process_goal_state(&self, goal_state: &GoalState) -> Result<()>;

    /// Aggregate extension status, polled every cycle.
    async fn report_status(&self) -> Result<ExtensionsSummary>;
}

/// Remote-access directive interface, invoked once per new incarnation.
#[async_trait]
pub trait RemoteAccessHandler: Send + Sync {
    async fn run(&self, goal_state: &GoalState) -> Result<()>;
}

/// Built-in pipeline: acknowledges every extension and reports it terminal.
pub struct ExtensionPipeline {
    expected: AtomicUsize,
}

impl ExtensionPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            expected: AtomicUsize::new(0),
        }
    }
}

impl Default for ExtensionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtensionHandler for ExtensionPipeline {
    async fn process_goal_state(&self, goal_state: &GoalState) -> Result<()> {
        for extension in &goal_state.extensions {
            info!(
                name = %extension.name,
                version = extension.version.as_deref().unwrap_or("-"),
                state = extension.state.as_deref().unwrap_or("enabled"),
                "Acknowledged extension goal"
            );
        }

        self.expected
            .store(goal_state.extensions.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn report_status(&self) -> Result<ExtensionsSummary> {
        Ok(ExtensionsSummary {
            expected: self.expected.load(Ordering::SeqCst),
            transitioning: 0,
        })
    }
}

/// Built-in remote-access handler: no directives supported, acknowledges.
pub struct RemoteAccessPipeline;

impl RemoteAccessPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for RemoteAccessPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteAccessHandler for RemoteAccessPipeline {
    async fn run(&self, goal_state: &GoalState) -> Result<()> {
        debug!(
            incarnation = %goal_state.incarnation,
            "No remote access directives to process"
        );
        Ok(())
    }
}

/// Mock handler for testing convergence behavior.
///
/// Reports every expected extension as transitioning for a configurable
/// number of status polls before declaring them terminal.
pub struct MockExtensionHandler {
    invocations: AtomicU64,
    status_polls: AtomicU64,
    transitioning_polls: AtomicUsize,
    expected: AtomicUsize,
    fail_process: bool,
    fail_status: bool,
}

impl MockExtensionHandler {
    /// Converges on the first status poll.
    #[must_use]
    pub fn new() -> Self {
        Self::converging_after(0)
    }

    /// Reports extensions as transitioning for the first `polls` status
    /// polls.
    #[must_use]
    pub fn converging_after(polls: usize) -> Self {
        Self {
            invocations: AtomicU64::new(0),
            status_polls: AtomicU64::new(0),
            transitioning_polls: AtomicUsize::new(polls),
            expected: AtomicUsize::new(0),
            fail_process: false,
            fail_status: false,
        }
    }

    /// Fails every `process_goal_state` call.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_process: true,
            ..Self::converging_after(0)
        }
    }

    /// Fails every `report_status` call.
    #[must_use]
    pub fn failing_status() -> Self {
        Self {
            fail_status: true,
            ..Self::converging_after(0)
        }
    }

    /// How many goal states the handler has processed.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// How many times the status has been polled.
    pub fn status_polls(&self) -> u64 {
        self.status_polls.load(Ordering::SeqCst)
    }
}

impl Default for MockExtensionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtensionHandler for MockExtensionHandler {
    async fn process_goal_state(&self, goal_state: &GoalState) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if self.fail_process {
            anyhow::bail!("Mock extension handler configured to fail");
        }

        self.expected
            .store(goal_state.extensions.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn report_status(&self) -> Result<ExtensionsSummary> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);

        if self.fail_status {
            anyhow::bail!("Mock extension handler configured to fail status");
        }

        let expected = self.expected.load(Ordering::SeqCst);
        let remaining = self.transitioning_polls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transitioning_polls
                .store(remaining - 1, Ordering::SeqCst);
            debug!(expected, "[MOCK] Extensions still transitioning");
            return Ok(ExtensionsSummary {
                expected,
                transitioning: expected.max(1),
            });
        }

        debug!(expected, "[MOCK] Extensions converged");
        Ok(ExtensionsSummary {
            expected,
            transitioning: 0,
        })
    }
}

/// Mock remote-access handler counting invocations.
#[derive(Default)]
pub struct MockRemoteAccessHandler {
    invocations: AtomicU64,
}

impl MockRemoteAccessHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAccessHandler for MockRemoteAccessHandler {
    async fn run(&self, goal_state: &GoalState) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        info!(
            incarnation = %goal_state.incarnation,
            "[MOCK] Acknowledged remote access directives"
        );
        Ok(())
    }
}
