//! Agent package download and installation.
//!
//! Packages are gzipped tarballs fetched from the URIs listed in the agent
//! manifest, tried in order. A package is staged under `downloads/`,
//! validated (the binary and the handler manifest must both be present),
//! and only then promoted into its `vega-agent-<version>` directory, so a
//! half-written install can never be mistaken for a usable one. The
//! downloaded archive is kept beside the install directory; inventory
//! purge removes the two together.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};
use vega_version::AgentVersion;

use crate::client::{FetchError, GoalStateClient};
use crate::inventory::{agent_dir_name, archive_name, AGENT_BIN_NAME, PACKAGE_MANIFEST_NAME};
use crate::status::AgentPackage;

/// Staging directory under the lib dir.
const DOWNLOADS_DIR: &str = "downloads";

/// Errors from package installation.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to download vega-agent-{version} from all URIs")]
    AllUrisFailed { version: AgentVersion },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Downloaded agent package: vega-agent-{version} is missing agent handler manifest file")]
    MissingHandlerManifest { version: AgentVersion },

    #[error("Downloaded agent package: vega-agent-{version} is missing agent binary")]
    MissingBinary { version: AgentVersion },
}

/// Downloads and installs agent packages under the lib directory.
pub struct PackageInstaller {
    lib_dir: PathBuf,
}

impl PackageInstaller {
    /// Create a new installer rooted at the lib directory.
    pub fn new(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            lib_dir: lib_dir.into(),
        }
    }

    /// Ensure `package` is installed, returning its install directory.
    ///
    /// Idempotent: a complete install short-circuits without touching the
    /// network. A failed install leaves no trace of the version behind.
    pub async fn install(
        &self,
        client: &dyn GoalStateClient,
        package: &AgentPackage,
    ) -> Result<PathBuf, InstallError> {
        let version = package.version;
        let dest = self.lib_dir.join(agent_dir_name(version));

        if dest.join(AGENT_BIN_NAME).is_file() && dest.join(PACKAGE_MANIFEST_NAME).is_file() {
            debug!(version = %version, "Agent package already installed");
            return Ok(dest);
        }

        let archive_path = self.download(client, package).await?;
        let result = self.extract_and_promote(version, &archive_path, &dest);

        match &result {
            Ok(dir) => info!(version = %version, dir = %dir.display(), "Agent package installed"),
            Err(_) => {
                std::fs::remove_file(&archive_path).ok();
            }
        }
        result
    }

    /// Download the package archive, trying each URI in order.
    async fn download(
        &self,
        client: &dyn GoalStateClient,
        package: &AgentPackage,
    ) -> Result<PathBuf, InstallError> {
        let version = package.version;
        let archive_path = self.lib_dir.join(archive_name(version));

        for uri in &package.uris {
            match self
                .download_one(client, uri, &archive_path, package.sha256.as_deref())
                .await
            {
                Ok(size) => {
                    debug!(version = %version, uri = %uri, size, "Agent package downloaded");
                    return Ok(archive_path);
                }
                Err(e) => {
                    warn!(version = %version, uri = %uri, error = %e, "Package download failed, trying next URI");
                }
            }
        }

        Err(InstallError::AllUrisFailed { version })
    }

    /// Download one URI to `dest`, verifying the checksum when one is
    /// advertised. Writes to a temp file and renames on success.
    async fn download_one(
        &self,
        client: &dyn GoalStateClient,
        uri: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<u64, InstallError> {
        let bytes = client.download_package(uri).await?;
        let total_bytes = bytes.len() as u64;

        if let Some(expected) = expected_sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(InstallError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let temp_path = dest.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, dest)?;
        Ok(total_bytes)
    }

    /// Extract the archive into staging, validate the layout, and promote
    /// it into the final install directory.
    fn extract_and_promote(
        &self,
        version: AgentVersion,
        archive_path: &Path,
        dest: &Path,
    ) -> Result<PathBuf, InstallError> {
        let staging = self.lib_dir.join(DOWNLOADS_DIR).join(agent_dir_name(version));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        if let Err(e) = unpack_archive(archive_path, &staging) {
            std::fs::remove_dir_all(&staging).ok();
            return Err(e);
        }

        if !staging.join(PACKAGE_MANIFEST_NAME).is_file() {
            std::fs::remove_dir_all(&staging).ok();
            return Err(InstallError::MissingHandlerManifest { version });
        }
        if !staging.join(AGENT_BIN_NAME).is_file() {
            std::fs::remove_dir_all(&staging).ok();
            return Err(InstallError::MissingBinary { version });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                staging.join(AGENT_BIN_NAME),
                std::fs::Permissions::from_mode(0o755),
            )?;
        }

        // Promote atomically; a partial previous install is replaced.
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        std::fs::rename(&staging, dest)?;
        Ok(dest.to_path_buf())
    }
}

/// Unpack a gzipped tar archive into `dest`, skipping unsafe entry paths.
fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir
                    | std::path::Component::RootDir
                    | std::path::Component::Prefix(_)
            )
        }) {
            warn!(path = %path.display(), "Skipping unsafe archive entry");
            continue;
        }

        entry.unpack(dest.join(&path))?;
    }

    Ok(())
}
