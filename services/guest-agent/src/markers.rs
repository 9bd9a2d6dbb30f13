//! Durable on-disk markers.
//!
//! Markers are empty-ish files under the agent lib directory whose
//! existence encodes facts that must survive process restarts and agent
//! upgrades. The file content is a timestamp for debugging; only presence
//! matters.

use std::io;
use std::path::PathBuf;

use chrono::Utc;

/// Facts recorded durably across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// The very first update attempt on this VM has happened. Until it is
    /// set, the updater is forced onto the self-update channel once.
    InitialUpdateAttempted,

    /// An RSM-requested update has been attempted. Cleared when the goal
    /// state stops being RSM-enrolled.
    RsmUpdateAttempted,

    /// An agent owns the goal-state role. Set before spawning a child,
    /// cleared only on clean shutdown; present at startup means the
    /// previous run died uncleanly.
    Sentinel,
}

impl Marker {
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Marker::InitialUpdateAttempted => "initial_update_attempted",
            Marker::RsmUpdateAttempted => "rsm_update_attempted",
            Marker::Sentinel => "agent_sentinel",
        }
    }
}

/// Storage for durable markers.
///
/// A trait so update-pipeline tests can run against in-memory state.
pub trait MarkerStore: Send + Sync {
    /// Whether the marker is set.
    fn has(&self, marker: Marker) -> bool;

    /// Set the marker. Idempotent.
    fn set(&self, marker: Marker) -> io::Result<()>;

    /// Clear the marker. Clearing an unset marker is not an error.
    fn clear(&self, marker: Marker) -> io::Result<()>;
}

/// Marker store backed by files in the agent lib directory.
pub struct FileMarkerStore {
    dir: PathBuf,
}

impl FileMarkerStore {
    pub fn new(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: lib_dir.into(),
        }
    }

    fn path(&self, marker: Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }
}

impl MarkerStore for FileMarkerStore {
    fn has(&self, marker: Marker) -> bool {
        self.path(marker).exists()
    }

    fn set(&self, marker: Marker) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(marker), Utc::now().to_rfc3339())
    }

    fn clear(&self, marker: Marker) -> io::Result<()> {
        match std::fs::remove_file(self.path(marker)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory marker store for tests.
#[derive(Default)]
pub struct MemoryMarkerStore {
    markers: std::sync::Mutex<std::collections::HashSet<Marker>>,
}

impl MemoryMarkerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn has(&self, marker: Marker) -> bool {
        self.markers.lock().unwrap().contains(&marker)
    }

    fn set(&self, marker: Marker) -> io::Result<()> {
        self.markers.lock().unwrap().insert(marker);
        Ok(())
    }

    fn clear(&self, marker: Marker) -> io::Result<()> {
        self.markers.lock().unwrap().remove(&marker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::new(dir.path());

        assert!(!store.has(Marker::Sentinel));
        store.set(Marker::Sentinel).unwrap();
        assert!(store.has(Marker::Sentinel));
        assert!(dir.path().join("agent_sentinel").exists());

        // Setting twice is fine.
        store.set(Marker::Sentinel).unwrap();

        store.clear(Marker::Sentinel).unwrap();
        assert!(!store.has(Marker::Sentinel));

        // Clearing an unset marker is fine.
        store.clear(Marker::Sentinel).unwrap();
    }

    #[test]
    fn file_store_creates_missing_lib_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::new(dir.path().join("nested/vega"));
        store.set(Marker::InitialUpdateAttempted).unwrap();
        assert!(store.has(Marker::InitialUpdateAttempted));
    }

    #[test]
    fn markers_are_independent() {
        let store = MemoryMarkerStore::new();
        store.set(Marker::InitialUpdateAttempted).unwrap();
        store.set(Marker::RsmUpdateAttempted).unwrap();

        store.clear(Marker::RsmUpdateAttempted).unwrap();
        assert!(store.has(Marker::InitialUpdateAttempted));
        assert!(!store.has(Marker::RsmUpdateAttempted));
    }
}
