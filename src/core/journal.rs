//! Orchestrator run journal (`orchestrator.events.jsonl`).
//!
//! One line per state-machine step. Unlike the evidence ledger this is an
//! operational trail: it is not hash-chained and never consulted for verdicts.

use crate::core::error::PhasegateError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub ts: String,
    pub event_id: String,
    pub run_id: String,
    pub actor: String,
    pub op: String,
    pub subject: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub detail: JsonValue,
}

pub struct Journal {
    path: Option<PathBuf>,
    run_id: String,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: &Path, run_id: &str) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            run_id: run_id.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// A journal that drops every event.
    pub fn disabled(run_id: &str) -> Self {
        Self {
            path: None,
            run_id: run_id.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn record(
        &self,
        op: &str,
        subject: &str,
        status: &str,
        detail: JsonValue,
    ) -> Result<(), PhasegateError> {
        tracing::info!(run = %self.run_id, op, subject, status, "step");
        let Some(path) = &self.path else {
            return Ok(());
        };
        let ev = JournalEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            run_id: self.run_id.clone(),
            actor: "orchestrator".to_string(),
            op: op.to_string(),
            subject: subject.to_string(),
            status: status.to_string(),
            detail,
        };
        let _guard = self
            .lock
            .lock()
            .map_err(|_| PhasegateError::ValidationError("journal lock poisoned".into()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(PhasegateError::IoError)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(PhasegateError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(PhasegateError::IoError)?;
        Ok(())
    }

    /// Journal failures are never allowed to change a run's outcome.
    pub fn note(&self, op: &str, subject: &str, status: &str, detail: JsonValue) {
        if let Err(e) = self.record(op, subject, status, detail) {
            tracing::warn!(error = %e, op, subject, "journal write failed");
        }
    }
}

pub fn read_events(path: &Path) -> Result<Vec<JournalEvent>, PhasegateError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(PhasegateError::IoError)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(PhasegateError::from))
        .collect()
}
