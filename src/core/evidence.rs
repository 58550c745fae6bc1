//! Evidence ledger.
//!
//! Append-only JSONL where every record carries the hash of its predecessor.
//! A card only counts as done once its completion record is on disk, and the
//! integrity check at phase exit re-reads the ledger to confirm it.

use crate::core::error::PhasegateError;
use crate::core::taskcard::CardStatus;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const GENESIS_HASH: &str = "genesis";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Card,
    Workflow,
    Guard,
    Gate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRecord {
    pub event_id: String,
    pub ts: String,
    pub subject: String,
    pub subject_kind: SubjectKind,
    pub action: String,
    pub verdict: String,
    pub actor: String,
    pub detail: JsonValue,
    pub prev_hash: String,
    pub hash: String,
}

impl EvidenceRecord {
    fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut body = self.clone();
        body.hash = String::new();
        let bytes = serde_json::to_vec(&body)?;
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn is_card_completion(&self, card: &str) -> bool {
        self.subject_kind == SubjectKind::Card && self.subject == card && self.verdict == "pass"
    }
}

/// Fields a caller supplies; ids, timestamps and hashes are filled in on append.
#[derive(Debug, Clone)]
pub struct EvidenceEntry {
    pub subject: String,
    pub subject_kind: SubjectKind,
    pub action: String,
    pub verdict: String,
    pub actor: String,
    pub detail: JsonValue,
}

impl EvidenceEntry {
    pub fn card(card: &str, action: &str, verdict: &str, detail: JsonValue) -> Self {
        Self {
            subject: card.to_string(),
            subject_kind: SubjectKind::Card,
            action: action.to_string(),
            verdict: verdict.to_string(),
            actor: "orchestrator".to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub records: usize,
    pub done_cards: usize,
    /// Cards marked done with no completion record.
    pub missing_evidence: Vec<String>,
    pub chain_breaks: Vec<String>,
    /// Set when opening the ledger cut off a record torn by an interrupted append.
    #[serde(default)]
    pub repaired_tail: Option<String>,
}

impl IntegrityReport {
    pub fn ok(&self) -> bool {
        self.missing_evidence.is_empty() && self.chain_breaks.is_empty()
    }

    pub fn violations(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .missing_evidence
            .iter()
            .map(|c| format!("card '{c}' is done but has no evidence record"))
            .collect();
        out.extend(self.chain_breaks.iter().cloned());
        out
    }
}

pub struct EvidenceLedger {
    path: PathBuf,
    /// Hash of the last appended record.
    head: Mutex<String>,
    repaired_tail: Option<String>,
}

impl EvidenceLedger {
    /// Open the ledger, cutting off a torn final line if a previous append
    /// was interrupted. The fragment is kept next to the ledger. A damaged
    /// line anywhere else is an error.
    pub fn open(path: &Path) -> Result<Self, PhasegateError> {
        let scan = scan_records(path)?;
        let repaired_tail = match &scan.torn_tail {
            Some(tail) => Some(quarantine_tail(path, scan.valid_len, tail)?),
            None => {
                if scan.unterminated {
                    let mut f = OpenOptions::new()
                        .append(true)
                        .open(path)
                        .map_err(PhasegateError::IoError)?;
                    writeln!(f).map_err(PhasegateError::IoError)?;
                }
                None
            }
        };
        let head = scan
            .records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        Ok(Self {
            path: path.to_path_buf(),
            head: Mutex::new(head),
            repaired_tail,
        })
    }

    /// Where a torn trailing record was moved when the ledger was opened.
    pub fn repaired_tail(&self) -> Option<&str> {
        self.repaired_tail.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: EvidenceEntry) -> Result<EvidenceRecord, PhasegateError> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| PhasegateError::ValidationError("evidence lock poisoned".into()))?;
        let mut record = EvidenceRecord {
            event_id: time::new_event_id(),
            ts: time::now_epoch_z(),
            subject: entry.subject,
            subject_kind: entry.subject_kind,
            action: entry.action,
            verdict: entry.verdict,
            actor: entry.actor,
            detail: entry.detail,
            prev_hash: head.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(PhasegateError::IoError)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(PhasegateError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(&record)?).map_err(PhasegateError::IoError)?;
        f.sync_data().map_err(PhasegateError::IoError)?;

        *head = record.hash.clone();
        Ok(record)
    }

    pub fn read_all(&self) -> Result<Vec<EvidenceRecord>, PhasegateError> {
        let _head = self
            .head
            .lock()
            .map_err(|_| PhasegateError::ValidationError("evidence lock poisoned".into()))?;
        read_records(&self.path)
    }

    pub fn records_for(&self, subject: &str) -> Result<Vec<EvidenceRecord>, PhasegateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.subject == subject)
            .collect())
    }

    /// Every done card must have a completion record and the chain must be intact.
    pub fn integrity_check(
        &self,
        card_status: &BTreeMap<String, CardStatus>,
    ) -> Result<IntegrityReport, PhasegateError> {
        let records = self.read_all()?;
        let mut report = IntegrityReport {
            records: records.len(),
            chain_breaks: verify_chain(&records),
            repaired_tail: self.repaired_tail.clone(),
            ..IntegrityReport::default()
        };

        let evidenced: BTreeSet<&str> = records
            .iter()
            .filter(|r| r.is_card_completion(&r.subject))
            .map(|r| r.subject.as_str())
            .collect();
        for (card, status) in card_status {
            if *status != CardStatus::Done {
                continue;
            }
            report.done_cards += 1;
            if !evidenced.contains(card.as_str()) {
                report.missing_evidence.push(card.clone());
            }
        }
        Ok(report)
    }
}

/// Ledger contents as found on disk.
struct Scan {
    records: Vec<EvidenceRecord>,
    /// Byte length of the well-formed prefix.
    valid_len: usize,
    /// Unparsable final line left by an interrupted append.
    torn_tail: Option<String>,
    /// The last record parsed but its newline never made it to disk.
    unterminated: bool,
}

fn scan_records(path: &Path) -> Result<Scan, PhasegateError> {
    let mut scan = Scan {
        records: Vec::new(),
        valid_len: 0,
        torn_tail: None,
        unterminated: false,
    };
    if !path.exists() {
        return Ok(scan);
    }
    let content = fs::read_to_string(path).map_err(PhasegateError::IoError)?;
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let last_nonempty = lines.iter().rposition(|l| !l.trim().is_empty());
    let mut offset = 0;
    for (idx, raw) in lines.iter().enumerate() {
        offset += raw.len();
        let line = raw.trim();
        if line.is_empty() {
            scan.valid_len = offset;
            continue;
        }
        match serde_json::from_str::<EvidenceRecord>(line) {
            Ok(record) => {
                scan.records.push(record);
                scan.valid_len = offset;
                scan.unterminated = !raw.ends_with('\n');
            }
            Err(_) if Some(idx) == last_nonempty => {
                scan.torn_tail = Some(content[offset - raw.len()..].to_string());
                return Ok(scan);
            }
            Err(e) => {
                return Err(PhasegateError::ValidationError(format!(
                    "{}:{}: unreadable evidence record: {e}",
                    path.display(),
                    idx + 1
                )));
            }
        }
    }
    Ok(scan)
}

fn read_records(path: &Path) -> Result<Vec<EvidenceRecord>, PhasegateError> {
    Ok(scan_records(path)?.records)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "evidence".to_string());
    path.with_file_name(format!("{name}.{suffix}-{}", time::new_event_id()))
}

fn quarantine_tail(path: &Path, valid_len: usize, tail: &str) -> Result<String, PhasegateError> {
    let target = sibling(path, "torn");
    fs::write(&target, tail).map_err(PhasegateError::IoError)?;
    let f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(PhasegateError::IoError)?;
    f.set_len(valid_len as u64).map_err(PhasegateError::IoError)?;
    f.sync_data().map_err(PhasegateError::IoError)?;
    tracing::warn!(
        ledger = %path.display(),
        fragment = %target.display(),
        "cut torn trailing evidence record"
    );
    Ok(target.display().to_string())
}

/// Move a ledger that cannot be read aside so the next run starts a fresh
/// chain. A readable ledger is left in place.
pub fn archive_damaged_ledger(
    path: &Path,
    archive_dir: &Path,
) -> Result<Option<PathBuf>, PhasegateError> {
    match scan_records(path) {
        Ok(_) => Ok(None),
        Err(PhasegateError::ValidationError(reason)) => {
            fs::create_dir_all(archive_dir).map_err(PhasegateError::IoError)?;
            let target =
                archive_dir.join(format!("evidence-{}.jsonl", time::new_event_id()));
            fs::rename(path, &target).map_err(PhasegateError::IoError)?;
            tracing::warn!(%reason, archived = %target.display(), "damaged evidence ledger archived");
            Ok(Some(target))
        }
        Err(e) => Err(e),
    }
}

/// Describe every link where a record does not follow from its predecessor.
pub fn verify_chain(records: &[EvidenceRecord]) -> Vec<String> {
    let mut breaks = Vec::new();
    let mut expected_prev = GENESIS_HASH.to_string();
    for record in records {
        if record.prev_hash != expected_prev {
            breaks.push(format!(
                "record {} does not link to its predecessor",
                record.event_id
            ));
        }
        match record.compute_hash() {
            Ok(h) if h == record.hash => {}
            _ => breaks.push(format!("record {} hash mismatch", record.event_id)),
        }
        expected_prev = record.hash.clone();
    }
    breaks
}
