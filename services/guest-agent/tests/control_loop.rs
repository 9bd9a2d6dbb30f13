//! End-to-end control loop scenarios against the mock client and handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use vega_guest_agent::client::MockGoalStateClient;
use vega_guest_agent::config::Config;
use vega_guest_agent::control_loop::{AgentContext, ControlLoop, FatalSignal};
use vega_guest_agent::handlers::{MockExtensionHandler, MockRemoteAccessHandler};
use vega_guest_agent::markers::{Marker, MarkerStore, MemoryMarkerStore};
use vega_guest_agent::resolver::UpgradeKind;
use vega_guest_agent::status::{
    AgentFamily, AgentManifest, AgentPackage, ExtensionGoal, GoalState,
};
use vega_guest_agent::supervisor::parent_pid;
use vega_guest_agent::telemetry::TelemetryQueue;
use vega_version::AgentVersion;

const MANIFEST_URI: &str = "http://packages/manifest";

fn v(s: &str) -> AgentVersion {
    s.parse().unwrap()
}

fn extension(name: &str) -> ExtensionGoal {
    ExtensionGoal {
        name: name.to_string(),
        version: None,
        state: None,
    }
}

fn goal_state(incarnation: &str, extensions: Vec<ExtensionGoal>) -> GoalState {
    GoalState {
        incarnation: incarnation.to_string(),
        created_at: Utc::now(),
        agent_families: Vec::new(),
        extensions,
    }
}

fn goal_state_with_family(
    incarnation: &str,
    family: AgentFamily,
    extensions: Vec<ExtensionGoal>,
) -> GoalState {
    GoalState {
        incarnation: incarnation.to_string(),
        created_at: Utc::now(),
        agent_families: vec![family],
        extensions,
    }
}

fn prod_family(requested: Option<&str>, version_from_rsm: bool, rsm_enrolled: bool) -> AgentFamily {
    AgentFamily {
        name: "Prod".to_string(),
        manifest_uris: vec![MANIFEST_URI.to_string()],
        requested_version: requested.map(|s| s.parse().unwrap()),
        version_from_rsm,
        rsm_enrolled,
    }
}

fn manifest_with(versions: &[&str]) -> AgentManifest {
    AgentManifest {
        packages: versions
            .iter()
            .map(|s| AgentPackage {
                version: v(s),
                uris: vec![format!("http://packages/vega-agent-{s}.tar.gz")],
                sha256: None,
            })
            .collect(),
    }
}

fn package_bytes() -> bytes::Bytes {
    use flate2::{write::GzEncoder, Compression};
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in [
        ("vega-agent", b"#!agent".as_slice()),
        ("manifest.json", b"{}".as_slice()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap().into()
}

struct Fixture {
    control_loop: ControlLoop,
    client: Arc<MockGoalStateClient>,
    extensions: Arc<MockExtensionHandler>,
    remote_access: Arc<MockRemoteAccessHandler>,
    markers: Arc<MemoryMarkerStore>,
    shutdown_tx: watch::Sender<bool>,
    _tmp: TempDir,
}

fn fixture(
    iterations: u32,
    extensions: MockExtensionHandler,
    configure: impl FnOnce(&mut Config),
) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::defaults();
    config.lib_dir = tmp.path().to_path_buf();
    config.debug_iterations = Some(iterations);
    config.initial_goal_state_period = Duration::from_millis(5);
    config.goal_state_period = Duration::from_millis(5);
    config.manifest_refresh_interval = Duration::ZERO;
    config.selfupdate_hotfix_interval = Duration::ZERO;
    config.selfupdate_regular_interval = Duration::ZERO;
    configure(&mut config);

    let client = Arc::new(MockGoalStateClient::new());
    let extensions = Arc::new(extensions);
    let remote_access = Arc::new(MockRemoteAccessHandler::new());
    let markers = Arc::new(MemoryMarkerStore::new());
    // Most scenarios start from a steady state; the forced first update is
    // covered by the update pipeline's own tests.
    markers.set(Marker::InitialUpdateAttempted).unwrap();

    let (telemetry, events) = TelemetryQueue::channel(v("2.2.53"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_loop = ControlLoop::new(AgentContext {
        config: Arc::new(config),
        client: client.clone(),
        extensions: extensions.clone(),
        remote_access: remote_access.clone(),
        markers: markers.clone(),
        telemetry,
        events,
        daemon_version: v("2.2.53"),
        shutdown: shutdown_rx,
    });

    Fixture {
        control_loop,
        client,
        extensions,
        remote_access,
        markers,
        shutdown_tx,
        _tmp: tmp,
    }
}

/// Flush queued telemetry through the worker set and return the messages
/// the mock client received.
async fn shipped_messages(fx: Fixture) -> Vec<String> {
    // Give the collector a beat to drain the channel before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.shutdown_tx.send(true).unwrap();
    fx.control_loop.stop().await;

    fx.client
        .telemetry()
        .into_iter()
        .map(|e| e.message)
        .collect()
}

#[tokio::test]
async fn extensions_run_once_per_incarnation_but_status_is_polled_every_cycle() {
    let mut fx = fixture(3, MockExtensionHandler::new(), |_| {});
    fx.client
        .set_goal_state(goal_state("1", vec![extension("ext.one")]));

    let signal = fx.control_loop.run().await.unwrap();

    assert!(signal.is_none());
    assert_eq!(fx.client.fetch_count(), 3);
    assert_eq!(fx.extensions.invocations(), 1);
    assert_eq!(fx.remote_access.invocations(), 1);
    assert_eq!(fx.extensions.status_polls(), 3);
    assert_eq!(fx.client.reports().len(), 3);
}

#[tokio::test]
async fn a_new_incarnation_reruns_the_handlers() {
    let mut fx = fixture(2, MockExtensionHandler::new(), |_| {});

    fx.client
        .set_goal_state(goal_state("1", vec![extension("ext.one")]));
    fx.control_loop.run().await.unwrap();
    assert_eq!(fx.extensions.invocations(), 1);

    fx.client.set_goal_state(goal_state(
        "2",
        vec![extension("ext.one"), extension("ext.two")],
    ));
    fx.control_loop.run().await.unwrap();

    assert_eq!(fx.extensions.invocations(), 2);
    assert_eq!(fx.remote_access.invocations(), 2);
}

#[tokio::test]
async fn fetch_failures_report_immediately_then_aggregate_then_recover() {
    let mut fx = fixture(6, MockExtensionHandler::new(), |c| {
        c.gs_error_report_interval = Duration::ZERO;
    });
    fx.client.set_goal_state(goal_state("1", Vec::new()));
    fx.client.fail_next_fetches(5);

    let signal = fx.control_loop.run().await.unwrap();
    assert!(signal.is_none());

    let reports = fx.client.reports();
    assert_eq!(reports.len(), 1, "only the successful cycle reports status");

    let messages = shipped_messages(fx).await;
    let count = |needle: &str| messages.iter().filter(|m| m.contains(needle)).count();
    assert_eq!(count("Error fetching the goal state:"), 3);
    assert_eq!(count("Fetching the goal state is still failing:"), 2);
    assert_eq!(
        count("Fetching the goal state recovered from previous errors."),
        1
    );
}

#[tokio::test]
async fn heartbeat_fires_immediately_and_counts_fetch_errors() {
    let mut fx = fixture(2, MockExtensionHandler::new(), |c| {
        c.heartbeat_period = Duration::ZERO;
    });
    fx.client.set_goal_state(goal_state("1", Vec::new()));
    fx.client.fail_next_fetches(2);

    fx.control_loop.run().await.unwrap();

    let messages = shipped_messages(fx).await;
    let beats: Vec<&String> = messages
        .iter()
        .filter(|m| m.starts_with("[HEARTBEAT] Agent 2.2.53 is running as the goal state agent"))
        .collect();
    assert_eq!(beats.len(), 2);
    assert!(beats[0].contains("HeartbeatCounter: 0;"));
    assert!(beats[0].contains("UpdateGSErrors: 1;"));
    assert!(beats[1].contains("HeartbeatCounter: 1;"));
    assert!(beats[1].contains("UpdateGSErrors: 2;"));
    assert!(beats[1].ends_with("AutoUpdate: 1]"));
}

#[tokio::test]
async fn an_orphaned_agent_exits_without_processing() {
    let mut fx = fixture(5, MockExtensionHandler::new(), |_| {});
    fx.client.set_goal_state(goal_state("1", Vec::new()));
    fx.control_loop.set_recorded_parent(parent_pid() + 1);

    let signal = fx.control_loop.run().await.unwrap();

    assert!(signal.is_none());
    assert_eq!(fx.client.fetch_count(), 0);
    assert!(fx.client.reports().is_empty());
}

#[tokio::test]
async fn a_ready_self_update_stops_the_loop_with_a_restart_signal() {
    let mut fx = fixture(10, MockExtensionHandler::new(), |_| {});
    fx.client.set_goal_state(goal_state_with_family(
        "1",
        prod_family(None, false, false),
        vec![extension("ext.one")],
    ));
    fx.client
        .add_manifest(MANIFEST_URI, manifest_with(&["2.2.53", "99999.0.0.0"]));
    fx.client.add_package(
        "http://packages/vega-agent-99999.0.0.0.tar.gz",
        package_bytes(),
    );

    let signal = fx.control_loop.run().await.unwrap();

    assert_eq!(
        signal,
        Some(FatalSignal::ExitToRestart {
            target: v("99999.0.0.0"),
            kind: UpgradeKind::Upgrade,
        })
    );
    assert!(fx._tmp.path().join("vega-agent-99999.0.0.0").is_dir());
    // The update preempts extension processing for that goal state.
    assert_eq!(fx.extensions.invocations(), 0);
    // One final status still goes out before the process exits.
    assert_eq!(fx.client.reports().len(), 1);

    let messages = shipped_messages(fx).await;
    assert!(messages.iter().any(|m| m.contains(
        "Self-update is ready to upgrade the new agent: 99999.0.0.0"
    )));
    assert!(messages.iter().any(|m| m
        == "Current Agent 2.2.53 completed all update checks, exiting current process \
            to upgrade to the new Agent version 99999.0.0.0"));
}

#[tokio::test]
async fn a_refused_rsm_downgrade_sticks_to_the_error_status() {
    let mut fx = fixture(2, MockExtensionHandler::new(), |_| {});
    fx.client.set_goal_state(goal_state_with_family(
        "1",
        prod_family(Some("1.2.0"), true, true),
        Vec::new(),
    ));

    let signal = fx.control_loop.run().await.unwrap();
    assert!(signal.is_none());

    // No install directory appears for the refused version.
    assert!(!fx._tmp.path().join("vega-agent-1.2.0").exists());

    let reports = fx.client.reports();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        let status = report.update_status.clone().unwrap();
        assert_eq!(status.code, 1);
        assert_eq!(status.expected_version, v("1.2.0"));
        assert!(status.message.contains("Skipping downgrade"));
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn crossing_the_memory_limit_stops_the_loop() {
    let mut fx = fixture(10, MockExtensionHandler::new(), |c| {
        c.memory_check_enabled = true;
        c.memory_limit_bytes = 1;
        c.child_launch_interval = Duration::ZERO;
        c.memory_check_period = Duration::ZERO;
    });
    fx.client.set_goal_state(goal_state("1", Vec::new()));

    let signal = fx.control_loop.run().await.unwrap();
    assert_eq!(signal, Some(FatalSignal::MemoryLimitExceeded));

    let messages = shipped_messages(fx).await;
    assert!(messages
        .iter()
        .any(|m| m == "Agent 2.2.53 is reached memory limit -- exiting"));
}

#[tokio::test]
async fn extension_failures_do_not_stop_the_loop() {
    let mut fx = fixture(3, MockExtensionHandler::failing(), |_| {});
    fx.client
        .set_goal_state(goal_state("1", vec![extension("ext.one")]));

    let signal = fx.control_loop.run().await.unwrap();

    assert!(signal.is_none());
    assert_eq!(fx.extensions.invocations(), 1);
    // Status still goes out every cycle with the last known summary.
    assert_eq!(fx.client.reports().len(), 3);
}

#[tokio::test]
async fn status_composition_failures_reuse_the_last_summary() {
    let mut fx = fixture(2, MockExtensionHandler::failing_status(), |_| {});
    fx.client
        .set_goal_state(goal_state("1", vec![extension("ext.one")]));

    let signal = fx.control_loop.run().await.unwrap();

    assert!(signal.is_none());
    let reports = fx.client.reports();
    assert_eq!(reports.len(), 2);
    // The summary never composed, so the empty initial one is reported.
    assert!(reports.iter().all(|r| r.extensions_expected == 0));
}

#[tokio::test]
async fn transitioning_extensions_flow_into_the_status_report() {
    let mut fx = fixture(3, MockExtensionHandler::converging_after(2), |_| {});
    fx.client.set_goal_state(goal_state(
        "1",
        vec![extension("ext.one"), extension("ext.two")],
    ));

    fx.control_loop.run().await.unwrap();

    let reports = fx.client.reports();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].extensions_expected, 2);
    assert!(reports[0].extensions_transitioning > 0);
    assert!(reports[1].extensions_transitioning > 0);
    assert_eq!(reports[2].extensions_transitioning, 0);
    assert_eq!(reports[2].incarnation.as_deref(), Some("1"));
}

#[tokio::test]
async fn rsm_marker_clears_once_the_goal_state_drops_enrollment() {
    let mut fx = fixture(1, MockExtensionHandler::new(), |_| {});
    fx.markers.set(Marker::RsmUpdateAttempted).unwrap();
    fx.client.set_goal_state(goal_state_with_family(
        "1",
        prod_family(None, false, false),
        Vec::new(),
    ));

    fx.control_loop.run().await.unwrap();

    assert!(!fx.markers.has(Marker::RsmUpdateAttempted));
}
