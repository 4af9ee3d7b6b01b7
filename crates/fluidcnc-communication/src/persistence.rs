//! Machine snapshot persistence
//!
//! A small JSON file holding the last known position, offsets, tool and
//! travel limits. It is advisory: a restored snapshot only seeds the model
//! until the first live status report arrives.

use chrono::{DateTime, Utc};
use fluidcnc_core::{Error, MachineState, Position, Result, TravelLimits};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Drift above which a restored position is reported
pub const RECONCILE_TOLERANCE: f64 = 0.01;

/// Persisted subset of [`MachineState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
    /// Machine position
    pub machine_position: Position,
    /// Work coordinate offset
    pub work_offset: Position,
    /// Active work coordinate system
    pub active_wcs: String,
    /// Tool number
    pub tool: u32,
    /// Max travel per axis
    pub travel: TravelLimits,
}

impl MachineSnapshot {
    /// Capture the persisted fields of a state
    pub fn capture(state: &MachineState) -> Self {
        Self {
            saved_at: Utc::now(),
            machine_position: state.machine_position,
            work_offset: state.work_offset,
            active_wcs: state.active_wcs.clone(),
            tool: state.tool,
            travel: state.travel,
        }
    }

    /// Age of the snapshot; future timestamps count as zero
    pub fn age(&self) -> Duration {
        (Utc::now() - self.saved_at).to_std().unwrap_or_default()
    }

    /// Seed a state, marking it as restored
    pub fn apply_to(&self, state: &mut MachineState) {
        state.set_work_offset(self.work_offset);
        state.set_machine_position(self.machine_position);
        state.active_wcs = self.active_wcs.clone();
        state.tool = self.tool;
        state.travel = self.travel;
        state.restored = true;
    }
}

/// File-backed snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically (temporary file, then rename)
    pub fn save(&self, snapshot: &MachineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| Error::other(format!("Failed to serialize snapshot: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!("Snapshot saved to {:?}", self.path);
        Ok(())
    }

    /// Read the snapshot, `None` when no file exists
    pub fn load(&self) -> Result<Option<MachineSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| Error::other(format!("Invalid snapshot {:?}: {}", self.path, e)))?;
        Ok(Some(snapshot))
    }

    /// Read the snapshot if it is younger than `max_age`. Unreadable or stale
    /// files are logged and ignored.
    pub fn load_fresh(&self, max_age: Duration) -> Option<MachineSnapshot> {
        match self.load() {
            Ok(Some(snapshot)) if snapshot.age() <= max_age => Some(snapshot),
            Ok(Some(snapshot)) => {
                tracing::info!(
                    "Ignoring snapshot from {} (older than {}s)",
                    snapshot.saved_at,
                    max_age.as_secs()
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> MachineState {
        let mut state = MachineState::new();
        state.set_work_offset(Position::new(10.0, 20.0, -5.0));
        state.set_machine_position(Position::new(-100.0, -50.0, -10.0));
        state.active_wcs = "G55".to_string();
        state.tool = 3;
        state.travel.set(fluidcnc_core::Axis::X, 300.0);
        state
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("nested").join("snap.json"));
        assert!(store.load().expect("load").is_none());

        let snapshot = MachineSnapshot::capture(&sample_state());
        store.save(&snapshot).expect("save");
        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded, snapshot);
        assert!(store.load_fresh(Duration::from_secs(3600)).is_some());
    }

    #[test]
    fn test_stale_and_corrupt_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snap.json"));

        let mut snapshot = MachineSnapshot::capture(&sample_state());
        snapshot.saved_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&snapshot).expect("save");
        assert!(store.load_fresh(Duration::from_secs(3600)).is_none());

        fs::write(store.path(), "{ not json").expect("write");
        assert!(store.load().is_err());
        assert!(store.load_fresh(Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn test_apply_marks_restored() {
        let snapshot = MachineSnapshot::capture(&sample_state());
        let mut state = MachineState::new();
        snapshot.apply_to(&mut state);
        assert!(state.restored);
        assert_eq!(state.active_wcs, "G55");
        assert_eq!(state.work_position, Position::new(-110.0, -70.0, -5.0));
        assert!(state.positions_consistent());
    }
}
