//! Store abstraction for phasegate's on-disk state.
//!
//! A project keeps its declarative inputs (plan manifest, task cards) in the
//! repository and its mutable run state under `<project>/.phasegate/`.

use crate::core::error::PhasegateError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".phasegate";

/// Store handle representing a phasegate project workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the project root (parent of `.phasegate/`)
    pub project_root: PathBuf,
    /// Absolute path to the state directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            root: project_root.join(STATE_DIR),
        }
    }

    /// Create the state directory layout if missing.
    pub fn ensure(&self) -> Result<(), PhasegateError> {
        fs::create_dir_all(self.reports_dir()).map_err(PhasegateError::IoError)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoint.json")
    }

    pub fn evidence_path(&self) -> PathBuf {
        self.root.join("evidence.events.jsonl")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("orchestrator.events.jsonl")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }
}

/// Walk up from `start_dir` until a directory holding `.phasegate/` or the
/// plan manifest is found.
pub fn find_project_root(start_dir: &Path, manifest: &str) -> Result<PathBuf, PhasegateError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(STATE_DIR).exists() || current_dir.join(manifest).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(PhasegateError::NotFound(format!(
                "neither '{}' nor '{}' found in current or parent directories",
                STATE_DIR, manifest
            )));
        }
    }
}
