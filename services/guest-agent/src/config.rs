//! Configuration for the guest agent.
//!
//! All settings come from `VEGA_*` environment variables with defaults that
//! match a production guest. Malformed values fall back to the default rather
//! than aborting: the agent must come up even on a box with a broken
//! environment, because it is the only thing that can repair itself.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Goal-state poll period applied when extension processing is disabled.
const EXTENSIONS_DISABLED_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Guest agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the platform goal-state endpoint.
    pub endpoint: String,

    /// Directory for durable agent state (installs, markers, pid files).
    pub lib_dir: PathBuf,

    /// Agent family tracked in the goal state.
    pub family: String,

    /// Master switch for agent updates.
    pub autoupdate_enabled: bool,

    /// Whether platform-requested (RSM) versions are honored.
    pub rsm_enabled: bool,

    /// Whether an RSM request below the current version is honored.
    pub downgrade_enabled: bool,

    /// Minimum interval between agent-manifest refreshes on the
    /// self-update channel.
    pub manifest_refresh_interval: Duration,

    /// Minimum interval between self-update hotfix upgrades.
    pub selfupdate_hotfix_interval: Duration,

    /// Minimum interval between self-update regular upgrades.
    pub selfupdate_regular_interval: Duration,

    /// Steady-state goal-state poll period.
    pub goal_state_period: Duration,

    /// Poll period used until the first convergence.
    pub initial_goal_state_period: Duration,

    /// Whether extension goal states are processed at all.
    pub extensions_enabled: bool,

    /// Minimum interval between periodic goal-state failure reports.
    pub gs_error_report_interval: Duration,

    /// Timeout applied to individual HTTP requests.
    pub http_timeout: Duration,

    /// Child liveness poll period while supervising.
    pub child_poll_interval: Duration,

    /// Age at which a running child is considered healthy.
    pub child_health_interval: Duration,

    /// Minimum spacing between child launches; also delays the first
    /// memory check after startup.
    pub child_launch_interval: Duration,

    /// Whether the resident-memory ceiling is enforced.
    pub memory_check_enabled: bool,

    /// Resident-memory ceiling in bytes.
    pub memory_limit_bytes: u64,

    /// Interval between memory checks once the initial delay has passed.
    pub memory_check_period: Duration,

    /// Whether startup blocks on the cloud-init completion barrier.
    pub wait_for_cloud_init: bool,

    /// Upper bound on the cloud-init wait.
    pub cloud_init_timeout: Duration,

    /// File whose existence marks cloud-init completion.
    pub cloud_init_state_file: PathBuf,

    /// Interval between heartbeat telemetry events.
    pub heartbeat_period: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("text" or "json").
    pub log_format: String,

    /// Debug-only: run this many control-loop iterations, then exit cleanly.
    pub debug_iterations: Option<u32>,
}

impl Config {
    /// Production defaults, before any environment override.
    pub fn defaults() -> Self {
        Self {
            endpoint: "http://169.254.169.254".to_string(),
            lib_dir: PathBuf::from("/var/lib/vega"),
            family: "Prod".to_string(),
            autoupdate_enabled: true,
            rsm_enabled: true,
            downgrade_enabled: false,
            manifest_refresh_interval: Duration::from_secs(3600),
            selfupdate_hotfix_interval: Duration::from_secs(4 * 3600),
            selfupdate_regular_interval: Duration::from_secs(24 * 3600),
            goal_state_period: Duration::from_secs(6),
            initial_goal_state_period: Duration::from_secs(6),
            extensions_enabled: true,
            gs_error_report_interval: Duration::from_secs(6 * 3600),
            http_timeout: Duration::from_secs(30),
            child_poll_interval: Duration::from_millis(500),
            child_health_interval: Duration::from_secs(3 * 60),
            child_launch_interval: Duration::from_secs(5 * 60),
            memory_check_enabled: false,
            memory_limit_bytes: 256 * 1024 * 1024,
            memory_check_period: Duration::from_secs(24 * 60),
            wait_for_cloud_init: false,
            cloud_init_timeout: Duration::from_secs(3600),
            cloud_init_state_file: PathBuf::from("/run/cloud-init/result.json"),
            heartbeat_period: Duration::from_secs(30 * 60),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            debug_iterations: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::defaults();

        Ok(Self {
            endpoint: env_string("VEGA_ENDPOINT", d.endpoint),
            lib_dir: env_path("VEGA_LIB_DIR", d.lib_dir),
            family: env_string("VEGA_FAMILY", d.family),
            autoupdate_enabled: env_bool("VEGA_AUTOUPDATE_ENABLED", d.autoupdate_enabled),
            rsm_enabled: env_bool("VEGA_RSM_ENABLED", d.rsm_enabled),
            downgrade_enabled: env_bool("VEGA_DOWNGRADE_ENABLED", d.downgrade_enabled),
            manifest_refresh_interval: env_secs(
                "VEGA_MANIFEST_REFRESH_INTERVAL",
                d.manifest_refresh_interval,
            ),
            selfupdate_hotfix_interval: env_secs(
                "VEGA_SELFUPDATE_HOTFIX_INTERVAL",
                d.selfupdate_hotfix_interval,
            ),
            selfupdate_regular_interval: env_secs(
                "VEGA_SELFUPDATE_REGULAR_INTERVAL",
                d.selfupdate_regular_interval,
            ),
            goal_state_period: env_secs("VEGA_GOAL_STATE_PERIOD", d.goal_state_period),
            initial_goal_state_period: env_secs(
                "VEGA_INITIAL_GOAL_STATE_PERIOD",
                d.initial_goal_state_period,
            ),
            extensions_enabled: env_bool("VEGA_EXTENSIONS_ENABLED", d.extensions_enabled),
            gs_error_report_interval: env_secs(
                "VEGA_GOAL_STATE_ERROR_REPORT_INTERVAL",
                d.gs_error_report_interval,
            ),
            http_timeout: env_secs("VEGA_HTTP_TIMEOUT", d.http_timeout),
            child_poll_interval: env_millis("VEGA_CHILD_POLL_INTERVAL_MS", d.child_poll_interval),
            child_health_interval: env_secs("VEGA_CHILD_HEALTH_INTERVAL", d.child_health_interval),
            child_launch_interval: env_secs("VEGA_CHILD_LAUNCH_INTERVAL", d.child_launch_interval),
            memory_check_enabled: env_bool("VEGA_MEMORY_CHECK_ENABLED", d.memory_check_enabled),
            memory_limit_bytes: env_u64("VEGA_MEMORY_LIMIT_BYTES", d.memory_limit_bytes),
            memory_check_period: env_secs("VEGA_MEMORY_CHECK_PERIOD", d.memory_check_period),
            wait_for_cloud_init: env_bool("VEGA_WAIT_FOR_CLOUD_INIT", d.wait_for_cloud_init),
            cloud_init_timeout: env_secs("VEGA_CLOUD_INIT_TIMEOUT", d.cloud_init_timeout),
            cloud_init_state_file: env_path("VEGA_CLOUD_INIT_STATE_FILE", d.cloud_init_state_file),
            heartbeat_period: env_secs("VEGA_HEARTBEAT_PERIOD", d.heartbeat_period),
            log_level: env_string("VEGA_LOG_LEVEL", d.log_level),
            log_format: env_string("VEGA_LOG_FORMAT", d.log_format),
            debug_iterations: std::env::var("VEGA_DEBUG_ITERATIONS")
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }

    /// Goal-state poll period, accounting for disabled extensions.
    #[must_use]
    pub fn effective_goal_state_period(&self) -> Duration {
        if self.extensions_enabled {
            self.goal_state_period
        } else {
            EXTENSIONS_DISABLED_PERIOD
        }
    }

    /// Initial poll period, accounting for disabled extensions.
    #[must_use]
    pub fn effective_initial_goal_state_period(&self) -> Duration {
        if self.extensions_enabled {
            self.initial_goal_state_period
        } else {
            EXTENSIONS_DISABLED_PERIOD
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "y" | "yes" => Some(true),
            "0" | "false" | "n" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let config = Config::defaults();
        assert_eq!(config.family, "Prod");
        assert!(config.autoupdate_enabled);
        assert!(!config.downgrade_enabled);
        assert_eq!(config.goal_state_period, Duration::from_secs(6));
        assert_eq!(config.gs_error_report_interval, Duration::from_secs(6 * 3600));
        assert!(config.debug_iterations.is_none());
    }

    #[test]
    fn disabled_extensions_stretch_the_poll_period() {
        let mut config = Config::defaults();
        config.extensions_enabled = false;
        assert_eq!(config.effective_goal_state_period(), Duration::from_secs(300));
        assert_eq!(
            config.effective_initial_goal_state_period(),
            Duration::from_secs(300)
        );
    }
}
