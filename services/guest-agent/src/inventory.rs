//! Installed-agent inventory under the lib directory.
//!
//! Each installed agent version lives in its own `vega-agent-<version>`
//! directory holding the agent binary, the package manifest, and an
//! `error.json` with the version's failure history. The inventory scans
//! and mutates these directories; the update handler is the only writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vega_version::AgentVersion;

/// Directory prefix for installed agents.
pub const AGENT_DIR_PREFIX: &str = "vega-agent-";

/// Binary name inside an install directory.
pub const AGENT_BIN_NAME: &str = "vega-agent";

/// Package manifest name inside an install directory.
pub const PACKAGE_MANIFEST_NAME: &str = "manifest.json";

/// Failure-history file inside an install directory.
const ERROR_FILE_NAME: &str = "error.json";

/// Per-version update attempt counts, kept at the lib-dir root so a
/// reinstall of a version does not reset its count.
const UPDATE_ATTEMPTS_FILE: &str = "update_attempts.json";

/// Consecutive failures after which a version is no longer launched.
pub const MAX_FAILURES: u32 = 3;

/// Supervised-agent pid files kept before pruning the oldest.
pub const MAX_PID_FILES: usize = 10;

/// Suffix of the per-launch pid files in the lib directory.
const PID_FILE_SUFFIX: &str = "_vega-agent.pid";

/// Directory name for an installed version.
#[must_use]
pub fn agent_dir_name(version: AgentVersion) -> String {
    format!("{AGENT_DIR_PREFIX}{version}")
}

/// Archive file name for a downloaded package.
#[must_use]
pub fn archive_name(version: AgentVersion) -> String {
    format!("{AGENT_DIR_PREFIX}{version}.tar.gz")
}

/// Failure history of one installed version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentError {
    pub failure_count: u32,
    pub was_fatal: bool,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reason: Option<String>,
}

impl AgentError {
    /// Whether this version must not be launched again.
    #[must_use]
    pub fn is_blacklisted(&self) -> bool {
        self.was_fatal || self.failure_count >= MAX_FAILURES
    }
}

/// One installed agent version.
#[derive(Debug, Clone)]
pub struct InstalledAgent {
    pub version: AgentVersion,
    pub dir: PathBuf,
    pub error: AgentError,
}

impl InstalledAgent {
    fn load(version: AgentVersion, dir: PathBuf) -> Self {
        let error_path = dir.join(ERROR_FILE_NAME);
        let error = std::fs::read_to_string(&error_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self {
            version,
            dir,
            error,
        }
    }

    /// Path to the agent binary.
    #[must_use]
    pub fn bin_path(&self) -> PathBuf {
        self.dir.join(AGENT_BIN_NAME)
    }

    /// Path to the package manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(PACKAGE_MANIFEST_NAME)
    }

    /// A complete install has both the binary and the package manifest.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bin_path().exists() && self.manifest_path().exists()
    }

    /// Complete and not blacklisted.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.is_complete() && !self.error.is_blacklisted()
    }

    /// Record a failure of this version. Fatal failures blacklist it
    /// outright; others blacklist it once [`MAX_FAILURES`] accumulate.
    pub fn mark_failure(&mut self, reason: &str, fatal: bool) -> Result<()> {
        self.error.failure_count += 1;
        self.error.was_fatal = self.error.was_fatal || fatal;
        self.error.last_failure_at = Some(Utc::now());
        self.error.last_reason = Some(reason.to_string());
        self.save_error()
    }

    /// Forget accumulated failures after a healthy run.
    pub fn clear_errors(&mut self) -> Result<()> {
        self.error = AgentError::default();
        self.save_error()
    }

    fn save_error(&self) -> Result<()> {
        let path = self.dir.join(ERROR_FILE_NAME);
        let tmp_path = path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(&self.error).context("Failed to serialize error state")?;

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename {} -> {}", tmp_path.display(), path.display()))?;

        Ok(())
    }
}

/// Scans and mutates the install directories under the lib dir.
pub struct AgentInventory {
    lib_dir: PathBuf,
}

impl AgentInventory {
    pub fn new(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            lib_dir: lib_dir.into(),
        }
    }

    #[must_use]
    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Install directory for a version, whether or not it exists.
    #[must_use]
    pub fn dir_for(&self, version: AgentVersion) -> PathBuf {
        self.lib_dir.join(agent_dir_name(version))
    }

    /// Downloaded package archive for a version, whether or not it exists.
    #[must_use]
    pub fn archive_for(&self, version: AgentVersion) -> PathBuf {
        self.lib_dir.join(archive_name(version))
    }

    /// Load one installed version, if its directory exists.
    #[must_use]
    pub fn get(&self, version: AgentVersion) -> Option<InstalledAgent> {
        let dir = self.dir_for(version);
        dir.is_dir().then(|| InstalledAgent::load(version, dir))
    }

    /// All installed versions, sorted descending.
    pub fn list(&self) -> Result<Vec<InstalledAgent>> {
        let mut agents = Vec::new();

        let entries = match std::fs::read_dir(&self.lib_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(agents),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read lib dir: {}", self.lib_dir.display())
                })
            }
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(version_str) = name.to_str().and_then(|n| n.strip_prefix(AGENT_DIR_PREFIX))
            else {
                continue;
            };

            match version_str.parse::<AgentVersion>() {
                Ok(version) => agents.push(InstalledAgent::load(version, entry.path())),
                Err(_) => {
                    debug!(dir = %entry.path().display(), "Ignoring unparseable agent directory")
                }
            }
        }

        agents.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(agents)
    }

    /// Whether a complete install of `version` exists.
    #[must_use]
    pub fn is_installed(&self, version: AgentVersion) -> bool {
        self.get(version).is_some_and(|agent| agent.is_complete())
    }

    /// Remove one installed version, directory and archive together.
    pub fn remove(&self, version: AgentVersion) -> Result<()> {
        let dir = self.dir_for(version);
        remove_file_if_exists(&self.archive_for(version));
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove agent dir: {}", dir.display()))
    }

    /// Remove installs not named in `keep`, directories and archives
    /// together.
    pub fn purge_outdated(&self, keep: &[AgentVersion]) -> Result<()> {
        for agent in self.list()? {
            if keep.contains(&agent.version) {
                continue;
            }
            warn!(version = %agent.version, "Purging outdated agent install");
            remove_file_if_exists(&self.archive_for(agent.version));
            if let Err(e) = std::fs::remove_dir_all(&agent.dir) {
                warn!(version = %agent.version, error = %e, "Failed to purge agent install");
            }
        }
        Ok(())
    }

    // ===== Update attempt counts =====

    /// Attempts recorded so far for updating to `version`.
    #[must_use]
    pub fn update_attempts(&self, version: AgentVersion) -> u32 {
        self.load_attempts()
            .get(&version.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Record one more attempt to update to `version`, returning the new
    /// count.
    pub fn record_update_attempt(&self, version: AgentVersion) -> Result<u32> {
        let mut attempts = self.load_attempts();
        let count = attempts.entry(version.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        std::fs::create_dir_all(&self.lib_dir)?;
        let path = self.lib_dir.join(UPDATE_ATTEMPTS_FILE);
        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&attempts)
            .context("Failed to serialize update attempts")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename {} -> {}", tmp_path.display(), path.display()))?;

        Ok(count)
    }

    fn load_attempts(&self) -> std::collections::HashMap<String, u32> {
        std::fs::read_to_string(self.lib_dir.join(UPDATE_ATTEMPTS_FILE))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    // ===== Supervised-agent pid files =====

    /// Record the pid of a freshly launched agent, pruning the oldest
    /// files beyond [`MAX_PID_FILES`].
    pub fn write_pid_file(&self, pid: u32) -> Result<()> {
        std::fs::create_dir_all(&self.lib_dir)?;
        let path = self.lib_dir.join(format!("{pid}{PID_FILE_SUFFIX}"));
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to write pid file: {}", path.display()))?;

        let mut pids = self.recorded_pids()?;
        if pids.len() > MAX_PID_FILES {
            pids.sort_unstable();
            for stale in &pids[..pids.len() - MAX_PID_FILES] {
                let stale_path = self.lib_dir.join(format!("{stale}{PID_FILE_SUFFIX}"));
                if let Err(e) = std::fs::remove_file(&stale_path) {
                    warn!(path = %stale_path.display(), error = %e, "Failed to prune pid file");
                }
            }
        }

        Ok(())
    }

    /// Drop the pid file for an agent process that is known to be gone.
    pub fn remove_pid_file(&self, pid: u32) {
        remove_file_if_exists(&self.lib_dir.join(format!("{pid}{PID_FILE_SUFFIX}")));
    }

    /// Pids recorded by previous and current launches.
    pub fn recorded_pids(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();

        let entries = match std::fs::read_dir(&self.lib_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pids),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read lib dir: {}", self.lib_dir.display())
                })
            }
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(pid) = name
                .to_str()
                .and_then(|n| n.strip_suffix(PID_FILE_SUFFIX))
                .and_then(|p| p.parse::<u32>().ok())
            {
                pids.push(pid);
            }
        }

        Ok(pids)
    }
}

fn remove_file_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
