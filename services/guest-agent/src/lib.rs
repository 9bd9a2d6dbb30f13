//! Vega Guest Agent Library
//!
//! The guest agent runs inside each cloud VM and keeps it converged with the
//! platform's goal state: it updates itself to the version the platform
//! requests, acknowledges extension and remote-access directives, and reports
//! VM status and telemetry back to the host endpoint.
//!
//! ## Architecture
//!
//! Two processes share one binary:
//!
//! ```text
//! vega-agent daemon                 (root process, package version)
//! └── vega-agent run                (latest installed version)
//!     ├── ControlLoop               (goal state fetch, agent update, status)
//!     └── WorkerSet                 (monitor, environment, telemetry, logs)
//! ```
//!
//! The daemon supervises the child and relaunches it whenever it exits; the
//! child exits deliberately after installing a different agent version, which
//! is how upgrades land without a service restart.
//!
//! ## Modules
//!
//! - `daemon` / `supervisor`: parent-side process supervision
//! - `control_loop` / `workers`: child-side goal state processing
//! - `update` / `resolver` / `installer` / `inventory`: the self-update pipeline
//! - `client`: the host goal state endpoint (HTTP and mock)

pub mod client;
pub mod config;
pub mod control_loop;
pub mod daemon;
pub mod handlers;
pub mod installer;
pub mod inventory;
pub mod markers;
pub mod resolver;
pub mod resources;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod update;
pub mod workers;

// Re-export commonly used types
pub use client::{GoalStateClient, HttpGoalStateClient, MockGoalStateClient};
pub use config::Config;
pub use control_loop::{AgentContext, ControlLoop, FatalSignal};
pub use telemetry::{TelemetryEvent, TelemetryOperation, TelemetryQueue};
