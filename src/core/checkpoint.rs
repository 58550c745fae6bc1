//! Checkpoint Store.
//!
//! The checkpoint is the only persisted progress: current phase, completed and
//! failed workflows, the per-card status map and soft items carried across
//! phases. It is sealed with a SHA-256 digest of its canonical body; a snapshot
//! that does not parse or does not match its digest is corrupt and resume is
//! refused until the operator resets it.
//!
//! Writers hold the write half of an `RwLock` across the whole
//! clone-modify-persist-swap sequence, so persisted snapshots are linearized
//! and memory never runs ahead of disk.

use crate::core::error::PhasegateError;
use crate::core::gate::ControlledPending;
use crate::core::plan::Plan;
use crate::core::taskcard::CardStatus;
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

pub const CHECKPOINT_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub schema_version: String,
    pub phase: String,
    pub completed_workflows: BTreeSet<String>,
    /// Workflow id -> reason.
    pub failed_workflows: BTreeMap<String, String>,
    pub card_status: BTreeMap<String, CardStatus>,
    pub completed_phases: Vec<String>,
    pub controlled_pending: Vec<ControlledPending>,
    pub timestamp: String,
    #[serde(default)]
    pub digest: String,
}

impl Checkpoint {
    pub fn fresh(phase: &str) -> Self {
        Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION.to_string(),
            phase: phase.to_string(),
            completed_workflows: BTreeSet::new(),
            failed_workflows: BTreeMap::new(),
            card_status: BTreeMap::new(),
            completed_phases: Vec::new(),
            controlled_pending: Vec::new(),
            timestamp: time::now_epoch_z(),
            digest: String::new(),
        }
    }

    pub fn compute_digest(&self) -> Result<String, serde_json::Error> {
        let mut body = self.clone();
        body.digest = String::new();
        let bytes = serde_json::to_vec(&body)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn sealed(mut self) -> Result<Self, serde_json::Error> {
        self.digest = self.compute_digest()?;
        Ok(self)
    }

    pub fn card_status(&self, id: &str) -> CardStatus {
        self.card_status
            .get(id)
            .copied()
            .unwrap_or(CardStatus::Pending)
    }

    pub fn is_workflow_done(&self, id: &str) -> bool {
        self.completed_workflows.contains(id)
    }

    pub fn is_phase_complete(&self, id: &str) -> bool {
        self.completed_phases.iter().any(|p| p == id)
    }
}

/// Where snapshots live. Injected into [`CheckpointStore`].
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when no snapshot has been written yet.
    fn load(&self) -> Result<Option<Checkpoint>, PhasegateError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PhasegateError>;
}

/// JSON file written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn corruption(&self, reason: impl Into<String>) -> PhasegateError {
        PhasegateError::CheckpointCorruption {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<Checkpoint>, PhasegateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(PhasegateError::IoError)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| self.corruption(format!("unparsable snapshot: {e}")))?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(self.corruption(format!(
                "unsupported schema_version '{}'",
                checkpoint.schema_version
            )));
        }
        let expected = checkpoint
            .compute_digest()
            .map_err(|e| self.corruption(e.to_string()))?;
        if checkpoint.digest != expected {
            return Err(self.corruption("digest mismatch"));
        }
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PhasegateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(PhasegateError::IoError)?;
        }
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(PhasegateError::IoError)?;
        fs::rename(&tmp, &self.path).map_err(PhasegateError::IoError)?;
        Ok(())
    }
}

/// In-process snapshot holder.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Option<Checkpoint>>,
}

impl MemorySnapshotStore {
    pub fn latest(&self) -> Option<Checkpoint> {
        self.inner.lock().ok().and_then(|c| c.clone())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<Checkpoint>, PhasegateError> {
        Ok(self.latest())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PhasegateError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PhasegateError::ValidationError("snapshot lock poisoned".into()))?;
        *inner = Some(checkpoint.clone());
        Ok(())
    }
}

/// Owner of the live checkpoint. All progress mutations go through here.
pub struct CheckpointStore {
    backend: Box<dyn SnapshotStore>,
    state: RwLock<Checkpoint>,
}

impl CheckpointStore {
    /// Read the snapshot once. No snapshot starts the first phase from scratch.
    pub fn open(backend: Box<dyn SnapshotStore>, plan: &Plan) -> Result<Self, PhasegateError> {
        let checkpoint = match backend.load()? {
            Some(cp) => {
                if plan.phase_index(&cp.phase).is_none() {
                    return Err(PhasegateError::CheckpointCorruption {
                        path: "checkpoint".to_string(),
                        reason: format!("snapshot names phase '{}' which the plan does not declare", cp.phase),
                    });
                }
                cp
            }
            None => {
                let first = plan.first_phase().ok_or_else(|| {
                    PhasegateError::ValidationError("plan declares no phases".to_string())
                })?;
                Checkpoint::fresh(first)
            }
        };
        Ok(Self {
            backend,
            state: RwLock::new(checkpoint),
        })
    }

    fn poisoned() -> PhasegateError {
        PhasegateError::ValidationError("checkpoint lock poisoned".to_string())
    }

    pub fn snapshot(&self) -> Result<Checkpoint, PhasegateError> {
        self.state
            .read()
            .map(|cp| cp.clone())
            .map_err(|_| Self::poisoned())
    }

    pub fn card_status(&self, id: &str) -> Result<CardStatus, PhasegateError> {
        self.state
            .read()
            .map(|cp| cp.card_status(id))
            .map_err(|_| Self::poisoned())
    }

    pub fn is_workflow_done(&self, id: &str) -> Result<bool, PhasegateError> {
        self.state
            .read()
            .map(|cp| cp.is_workflow_done(id))
            .map_err(|_| Self::poisoned())
    }

    /// Clone, modify, persist, then swap in. A failed write leaves memory untouched.
    fn mutate<F>(&self, f: F) -> Result<(), PhasegateError>
    where
        F: FnOnce(&mut Checkpoint) -> Result<(), PhasegateError>,
    {
        let mut guard = self.state.write().map_err(|_| Self::poisoned())?;
        let mut next = guard.clone();
        f(&mut next)?;
        next.timestamp = time::now_epoch_z();
        let next = next.sealed()?;
        self.backend.save(&next)?;
        *guard = next;
        Ok(())
    }

    pub fn transition_card(&self, id: &str, to: CardStatus) -> Result<(), PhasegateError> {
        self.mutate(|cp| {
            let from = cp.card_status(id);
            if !from.can_advance_to(to) {
                return Err(PhasegateError::IllegalTransition {
                    card: id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            cp.card_status.insert(id.to_string(), to);
            Ok(())
        })
    }

    pub fn complete_workflow(&self, id: &str) -> Result<(), PhasegateError> {
        self.mutate(|cp| {
            cp.failed_workflows.remove(id);
            cp.completed_workflows.insert(id.to_string());
            Ok(())
        })
    }

    pub fn fail_workflow(&self, id: &str, reason: &str) -> Result<(), PhasegateError> {
        self.mutate(|cp| {
            cp.failed_workflows.insert(id.to_string(), reason.to_string());
            Ok(())
        })
    }

    /// Close the current phase and move to `next`. Without a next phase the
    /// checkpoint stays on the last phase, marked complete.
    pub fn advance_phase(
        &self,
        next: Option<&str>,
        carried: Vec<ControlledPending>,
    ) -> Result<(), PhasegateError> {
        self.mutate(|cp| {
            if !cp.is_phase_complete(&cp.phase) {
                let current = cp.phase.clone();
                cp.completed_phases.push(current);
            }
            if let Some(next) = next {
                cp.phase = next.to_string();
            }
            cp.controlled_pending = carried;
            Ok(())
        })
    }
}

/// Move an existing checkpoint into `archive_dir`. Returns the archived path.
pub fn archive_checkpoint(
    checkpoint_path: &Path,
    archive_dir: &Path,
) -> Result<Option<PathBuf>, PhasegateError> {
    if !checkpoint_path.exists() {
        return Ok(None);
    }
    fs::create_dir_all(archive_dir).map_err(PhasegateError::IoError)?;
    let target = archive_dir.join(format!("checkpoint-{}.json", time::new_event_id()));
    fs::rename(checkpoint_path, &target).map_err(PhasegateError::IoError)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::PhaseDecl;

    fn two_phase_plan() -> Plan {
        Plan {
            phases: vec![
                PhaseDecl {
                    id: "P1".into(),
                    description: String::new(),
                },
                PhaseDecl {
                    id: "P2".into(),
                    description: String::new(),
                },
            ],
            ..Plan::default()
        }
    }

    #[test]
    fn absent_snapshot_starts_first_phase() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileSnapshotStore::new(&tmp.path().join("checkpoint.json"));
        let store = CheckpointStore::open(Box::new(backend), &two_phase_plan()).unwrap();
        let cp = store.snapshot().unwrap();
        assert_eq!(cp.phase, "P1");
        assert!(cp.completed_workflows.is_empty());
    }

    #[test]
    fn file_round_trip_preserves_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        let plan = two_phase_plan();
        {
            let store =
                CheckpointStore::open(Box::new(FileSnapshotStore::new(&path)), &plan).unwrap();
            store.transition_card("C1", CardStatus::InProgress).unwrap();
            store.transition_card("C1", CardStatus::Done).unwrap();
            store.complete_workflow("W0").unwrap();
        }
        let store = CheckpointStore::open(Box::new(FileSnapshotStore::new(&path)), &plan).unwrap();
        assert_eq!(store.card_status("C1").unwrap(), CardStatus::Done);
        assert!(store.is_workflow_done("W0").unwrap());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn regressions_are_refused_and_not_persisted() {
        let backend = MemorySnapshotStore::default();
        let store = CheckpointStore::open(Box::new(backend), &two_phase_plan()).unwrap();
        store.transition_card("C1", CardStatus::InProgress).unwrap();
        store.transition_card("C1", CardStatus::Done).unwrap();
        let err = store
            .transition_card("C1", CardStatus::InProgress)
            .unwrap_err();
        assert!(matches!(err, PhasegateError::IllegalTransition { .. }));
        assert_eq!(store.card_status("C1").unwrap(), CardStatus::Done);
    }

    #[test]
    fn tampered_snapshot_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        let plan = two_phase_plan();
        {
            let store =
                CheckpointStore::open(Box::new(FileSnapshotStore::new(&path)), &plan).unwrap();
            store.complete_workflow("W0").unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("\"W0\"", "\"W9\"")).unwrap();
        let err = CheckpointStore::open(Box::new(FileSnapshotStore::new(&path)), &plan)
            .err()
            .unwrap();
        assert!(matches!(err, PhasegateError::CheckpointCorruption { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn garbage_snapshot_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        fs::write(&path, "{not json").unwrap();
        let err = CheckpointStore::open(Box::new(FileSnapshotStore::new(&path)), &two_phase_plan())
            .err()
            .unwrap();
        assert!(matches!(err, PhasegateError::CheckpointCorruption { .. }));
    }

    #[test]
    fn advance_phase_records_completion() {
        let store =
            CheckpointStore::open(Box::new(MemorySnapshotStore::default()), &two_phase_plan())
                .unwrap();
        store.advance_phase(Some("P2"), Vec::new()).unwrap();
        let cp = store.snapshot().unwrap();
        assert_eq!(cp.phase, "P2");
        assert_eq!(cp.completed_phases, vec!["P1"]);
        store.advance_phase(None, Vec::new()).unwrap();
        let cp = store.snapshot().unwrap();
        assert_eq!(cp.phase, "P2");
        assert!(cp.is_phase_complete("P2"));
    }

    #[test]
    fn archive_moves_snapshot_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        fs::write(&path, "{}").unwrap();
        let archived = archive_checkpoint(&path, &tmp.path().join("archive"))
            .unwrap()
            .unwrap();
        assert!(!path.exists());
        assert!(archived.exists());
        assert!(archive_checkpoint(&path, &tmp.path().join("archive")).unwrap().is_none());
    }
}
