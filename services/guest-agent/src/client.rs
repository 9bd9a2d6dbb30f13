//! Platform API client for the guest agent.
//!
//! Covers the control-plane surface: fetching the goal state and agent
//! manifests, downloading agent packages, posting status reports, and
//! shipping telemetry batches. The trait seam keeps the update pipeline
//! testable without a live endpoint; transport failures are folded into
//! [`FetchError`] so callers never see raw HTTP errors.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::status::{AgentManifest, GoalState, StatusReport};
use crate::telemetry::TelemetryEvent;

/// Per-request timeout for package downloads, which can be much larger
/// than control-plane exchanges.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Transient client-side failure. Retried by the caller; never carries
/// transport internals.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// Client surface against the platform control plane.
#[async_trait]
pub trait GoalStateClient: Send + Sync {
    /// Fetch the current goal state.
    async fn fetch_goal_state(&self) -> Result<GoalState, FetchError>;

    /// Fetch an agent manifest from one of the family's manifest URIs.
    async fn fetch_agent_manifest(&self, uri: &str) -> Result<AgentManifest, FetchError>;

    /// Download an agent package archive.
    async fn download_package(&self, uri: &str) -> Result<Bytes, FetchError>;

    /// Post the per-cycle status report.
    async fn report_status(&self, report: &StatusReport) -> Result<(), FetchError>;

    /// Ship a batch of telemetry events.
    async fn send_telemetry(&self, events: &[TelemetryEvent]) -> Result<(), FetchError>;
}

/// HTTP implementation of [`GoalStateClient`].
pub struct HttpGoalStateClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGoalStateClient {
    /// Create a new client against the configured endpoint.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl GoalStateClient for HttpGoalStateClient {
    async fn fetch_goal_state(&self) -> Result<GoalState, FetchError> {
        let url = format!("{}/v1/vm/goalstate", self.base_url);
        debug!(url = %url, "Fetching goal state");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, "Failed to fetch goal state");
            return Err(FetchError::Status { status, body });
        }

        let goal_state: GoalState = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(
            incarnation = %goal_state.incarnation,
            family_count = goal_state.agent_families.len(),
            extension_count = goal_state.extensions.len(),
            "Fetched goal state"
        );

        Ok(goal_state)
    }

    async fn fetch_agent_manifest(&self, uri: &str) -> Result<AgentManifest, FetchError> {
        debug!(uri = %uri, "Fetching agent manifest");

        let response = self.client.get(uri).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, uri = %uri, "Failed to fetch agent manifest");
            return Err(FetchError::Status { status, body });
        }

        let manifest: AgentManifest = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(
            uri = %uri,
            package_count = manifest.packages.len(),
            "Fetched agent manifest"
        );

        Ok(manifest)
    }

    async fn download_package(&self, uri: &str) -> Result<Bytes, FetchError> {
        debug!(uri = %uri, "Downloading agent package");

        let response = self
            .client
            .get(uri)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, uri = %uri, "Failed to download agent package");
            return Err(FetchError::Status { status, body });
        }

        Ok(response.bytes().await?)
    }

    async fn report_status(&self, report: &StatusReport) -> Result<(), FetchError> {
        let url = format!("{}/v1/vm/status", self.base_url);
        debug!(
            state = %report.state,
            agent_version = %report.agent_version,
            "Reporting agent status"
        );

        let response = self.client.post(&url).json(report).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, "Failed to report status");
            return Err(FetchError::Status { status, body });
        }

        Ok(())
    }

    async fn send_telemetry(&self, events: &[TelemetryEvent]) -> Result<(), FetchError> {
        if events.is_empty() {
            return Ok(());
        }

        let url = format!("{}/v1/vm/telemetry", self.base_url);
        let request = TelemetryRequest { events };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, "Failed to send telemetry");
            return Err(FetchError::Status { status, body });
        }

        Ok(())
    }
}

#[derive(serde::Serialize)]
struct TelemetryRequest<'a> {
    events: &'a [TelemetryEvent],
}

/// Mock client for tests and local development.
#[derive(Default)]
pub struct MockGoalStateClient {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    goal_state: Option<GoalState>,
    fetch_failures: u32,
    manifests: HashMap<String, AgentManifest>,
    packages: HashMap<String, Bytes>,
    reports: Vec<StatusReport>,
    telemetry: Vec<TelemetryEvent>,
    fetch_count: u64,
    manifest_fetch_count: u64,
    download_count: u64,
}

impl MockGoalStateClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the goal state returned by subsequent fetches.
    pub fn set_goal_state(&self, goal_state: GoalState) {
        self.state.lock().unwrap().goal_state = Some(goal_state);
    }

    /// Make the next `n` goal-state fetches fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().unwrap().fetch_failures = n;
    }

    /// Serve `manifest` for fetches of `uri`.
    pub fn add_manifest(&self, uri: &str, manifest: AgentManifest) {
        self.state
            .lock()
            .unwrap()
            .manifests
            .insert(uri.to_string(), manifest);
    }

    /// Serve `bytes` for downloads of `uri`.
    pub fn add_package(&self, uri: &str, bytes: Bytes) {
        self.state
            .lock()
            .unwrap()
            .packages
            .insert(uri.to_string(), bytes);
    }

    pub fn reports(&self) -> Vec<StatusReport> {
        self.state.lock().unwrap().reports.clone()
    }

    pub fn last_report(&self) -> Option<StatusReport> {
        self.state.lock().unwrap().reports.last().cloned()
    }

    pub fn telemetry(&self) -> Vec<TelemetryEvent> {
        self.state.lock().unwrap().telemetry.clone()
    }

    pub fn fetch_count(&self) -> u64 {
        self.state.lock().unwrap().fetch_count
    }

    pub fn manifest_fetch_count(&self) -> u64 {
        self.state.lock().unwrap().manifest_fetch_count
    }

    pub fn download_count(&self) -> u64 {
        self.state.lock().unwrap().download_count
    }
}

#[async_trait]
impl GoalStateClient for MockGoalStateClient {
    async fn fetch_goal_state(&self) -> Result<GoalState, FetchError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_count += 1;

        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            info!("[MOCK] Failing goal state fetch");
            return Err(FetchError::Request("injected fetch failure".to_string()));
        }

        let goal_state = state
            .goal_state
            .clone()
            .ok_or_else(|| FetchError::Request("no goal state configured".to_string()))?;
        info!(incarnation = %goal_state.incarnation, "[MOCK] Serving goal state");
        Ok(goal_state)
    }

    async fn fetch_agent_manifest(&self, uri: &str) -> Result<AgentManifest, FetchError> {
        let mut state = self.state.lock().unwrap();
        state.manifest_fetch_count += 1;
        info!(uri = %uri, "[MOCK] Serving agent manifest");

        state.manifests.get(uri).cloned().ok_or_else(|| {
            FetchError::Status {
                status: 404,
                body: format!("no manifest for {uri}"),
            }
        })
    }

    async fn download_package(&self, uri: &str) -> Result<Bytes, FetchError> {
        let mut state = self.state.lock().unwrap();
        state.download_count += 1;
        info!(uri = %uri, "[MOCK] Serving agent package");

        state.packages.get(uri).cloned().ok_or_else(|| {
            FetchError::Status {
                status: 404,
                body: format!("no package for {uri}"),
            }
        })
    }

    async fn report_status(&self, report: &StatusReport) -> Result<(), FetchError> {
        info!(state = %report.state, "[MOCK] Recording status report");
        self.state.lock().unwrap().reports.push(report.clone());
        Ok(())
    }

    async fn send_telemetry(&self, events: &[TelemetryEvent]) -> Result<(), FetchError> {
        self.state
            .lock()
            .unwrap()
            .telemetry
            .extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::GuestAgentState;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: &str) -> Config {
        let mut config = Config::defaults();
        config.endpoint = endpoint.to_string();
        config
    }

    fn goal_state(incarnation: &str) -> GoalState {
        GoalState {
            incarnation: incarnation.to_string(),
            created_at: Utc::now(),
            agent_families: Vec::new(),
            extensions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fetches_and_decodes_goal_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/vm/goalstate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{
                    "incarnation": "2",
                    "created_at": "2026-03-01T08:30:00Z",
                    "agent_families": [
                        {
                            "name": "Prod",
                            "manifest_uris": ["http://host/manifest"],
                            "requested_version": "9.9.9.10",
                            "version_from_rsm": true,
                            "rsm_enrolled": true
                        }
                    ],
                    "extensions": []
                }"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = HttpGoalStateClient::new(&test_config(&server.uri()));
        let fetched = client.fetch_goal_state().await.unwrap();

        assert_eq!(fetched.incarnation, "2");
        let family = fetched.family("Prod").unwrap();
        assert!(family.rsm_enrolled);
        assert_eq!(
            family.requested_version.unwrap().to_string(),
            "9.9.9.10"
        );
    }

    #[tokio::test]
    async fn non_success_status_maps_to_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/vm/goalstate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = HttpGoalStateClient::new(&test_config(&server.uri()));
        let err = client.fetch_goal_state().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn posts_status_reports() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/vm/status"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpGoalStateClient::new(&test_config(&server.uri()));
        let report = StatusReport {
            incarnation: Some("1".to_string()),
            agent_version: "2.2.53".parse().unwrap(),
            state: GuestAgentState::Ready,
            reported_at: Utc::now(),
            update_status: None,
            extensions_expected: 0,
            extensions_transitioning: 0,
        };
        client.report_status(&report).await.unwrap();
    }

    #[tokio::test]
    async fn mock_fails_then_recovers() {
        let mock = MockGoalStateClient::new();
        mock.set_goal_state(goal_state("1"));
        mock.fail_next_fetches(2);

        assert!(mock.fetch_goal_state().await.is_err());
        assert!(mock.fetch_goal_state().await.is_err());
        assert_eq!(mock.fetch_goal_state().await.unwrap().incarnation, "1");
        assert_eq!(mock.fetch_count(), 3);
    }
}
