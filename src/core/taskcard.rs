//! Task card documents.
//!
//! A card is one TOML document under the cards directory. Parsing is strict:
//! the raw document is decoded, validated against the tier's required field
//! set, and only then turned into a [`TaskCard`]. Findings are classified
//! BLOCK / WARNING / INFO; a card with any BLOCK finding is never scheduled.

use crate::core::error::PhasegateError;
use crate::core::output::compact_line;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const DEFAULT_CAPABILITY: &str = "implementation";

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").expect("static id pattern"));

/// Identifier rule shared by cards, workflows, phases, guards, criteria and nodes.
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    A,
    B,
}

impl Tier {
    pub fn parse(raw: &str) -> Option<Tier> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Tier::A),
            "B" => Some(Tier::B),
            _ => None,
        }
    }

    /// Fields a document of this tier must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Tier::A => &[
                "id",
                "goal",
                "scope_in",
                "scope_out",
                "dependencies",
                "risk",
                "acceptance_command",
                "rollback_plan",
                "evidence",
                "decision_record",
            ],
            Tier::B => &[
                "id",
                "goal",
                "scope_in",
                "scope_out",
                "dependencies",
                "acceptance_command",
                "rollback_plan",
                "evidence",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Risk {
    pub level: RiskLevel,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Block,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub card: String,
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

/// Card lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Pending => "pending",
            CardStatus::InProgress => "in_progress",
            CardStatus::Blocked => "blocked",
            CardStatus::Done => "done",
            CardStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CardStatus::Done | CardStatus::Failed | CardStatus::Blocked
        )
    }

    /// `in_progress -> in_progress` is allowed: it is the re-dispatch of a
    /// unit that was in flight when the previous run stopped.
    pub fn can_advance_to(&self, next: CardStatus) -> bool {
        use CardStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (InProgress, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Blocked)
        )
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCard {
    pub id: String,
    pub tier: Tier,
    pub goal: String,
    pub scope_in: Vec<String>,
    pub scope_out: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub risk: Option<Risk>,
    pub acceptance_command: String,
    pub rollback_plan: String,
    pub evidence: String,
    pub decision_record: Option<String>,
    /// Executor capability tag this card is dispatched to.
    pub capability: String,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl TaskCard {
    /// Minimal Tier-B card for plans assembled in code.
    pub fn new(id: &str, goal: &str, acceptance_command: &str) -> Self {
        TaskCard {
            id: id.to_string(),
            tier: Tier::B,
            goal: goal.to_string(),
            scope_in: vec![id.to_string()],
            scope_out: Vec::new(),
            dependencies: BTreeSet::new(),
            risk: None,
            acceptance_command: acceptance_command.to_string(),
            rollback_plan: "revert the change".to_string(),
            evidence: String::new(),
            decision_record: None,
            capability: DEFAULT_CAPABILITY.to_string(),
            source: None,
        }
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.dependencies.insert(dep.to_string());
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawTaskCard {
    id: Option<String>,
    tier: Option<String>,
    goal: Option<String>,
    scope_in: Option<Vec<String>>,
    scope_out: Option<Vec<String>>,
    dependencies: Option<Vec<String>>,
    risk: Option<Risk>,
    acceptance_command: Option<String>,
    rollback_plan: Option<String>,
    evidence: Option<String>,
    decision_record: Option<String>,
    capability: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

impl RawTaskCard {
    fn has_field(&self, field: &str) -> bool {
        fn text(v: &Option<String>) -> bool {
            v.as_deref().is_some_and(|s| !s.trim().is_empty())
        }
        match field {
            "id" => text(&self.id),
            "goal" => text(&self.goal),
            "scope_in" => self.scope_in.is_some(),
            "scope_out" => self.scope_out.is_some(),
            "dependencies" => self.dependencies.is_some(),
            "risk" => self.risk.is_some(),
            "acceptance_command" => text(&self.acceptance_command),
            "rollback_plan" => text(&self.rollback_plan),
            "evidence" => text(&self.evidence),
            "decision_record" => text(&self.decision_record),
            _ => false,
        }
    }
}

/// A parsed card plus everything validation had to say about it.
#[derive(Debug, Clone)]
pub struct ValidatedCard {
    pub card: TaskCard,
    pub findings: Vec<Finding>,
}

impl ValidatedCard {
    pub fn blocking_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Block)
            .count()
    }

    pub fn is_schedulable(&self) -> bool {
        self.blocking_count() == 0
    }
}

fn finding(card: &str, field: &str, severity: Severity, message: impl Into<String>) -> Finding {
    Finding {
        card: card.to_string(),
        field: field.to_string(),
        severity,
        message: message.into(),
    }
}

/// Parse and validate one card document.
///
/// `fallback_id` names the card in findings when the document has no usable id
/// (normally the file stem).
pub fn parse_card(text: &str, fallback_id: &str, source: Option<&Path>) -> ValidatedCard {
    let raw: RawTaskCard = match toml::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            let card = placeholder_card(fallback_id, source);
            return ValidatedCard {
                findings: vec![finding(
                    fallback_id,
                    "document",
                    Severity::Block,
                    format!("unparsable card document: {}", compact_line(&e.to_string(), 160)),
                )],
                card,
            };
        }
    };
    validate_raw(raw, fallback_id, source)
}

fn placeholder_card(id: &str, source: Option<&Path>) -> TaskCard {
    TaskCard {
        id: id.to_string(),
        tier: Tier::B,
        goal: String::new(),
        scope_in: Vec::new(),
        scope_out: Vec::new(),
        dependencies: BTreeSet::new(),
        risk: None,
        acceptance_command: String::new(),
        rollback_plan: String::new(),
        evidence: String::new(),
        decision_record: None,
        capability: DEFAULT_CAPABILITY.to_string(),
        source: source.map(Path::to_path_buf),
    }
}

fn validate_raw(raw: RawTaskCard, fallback_id: &str, source: Option<&Path>) -> ValidatedCard {
    let mut findings = Vec::new();

    let id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_id)
        .to_string();
    if !is_valid_id(&id) {
        findings.push(finding(
            &id,
            "id",
            Severity::Block,
            "id must match [A-Za-z0-9][A-Za-z0-9_.:-]*",
        ));
    }

    let tier = match raw.tier.as_deref().map(Tier::parse) {
        Some(Some(tier)) => tier,
        Some(None) => {
            findings.push(finding(&id, "tier", Severity::Block, "tier must be A or B"));
            Tier::A
        }
        None => {
            findings.push(finding(&id, "tier", Severity::Block, "tier is required"));
            Tier::A
        }
    };

    for field in tier.required_fields() {
        if !raw.has_field(field) {
            findings.push(finding(
                &id,
                field,
                Severity::Block,
                format!("Tier-{tier:?} card requires '{field}'"),
            ));
        }
    }

    if matches!(&raw.scope_in, Some(v) if v.is_empty()) {
        findings.push(finding(
            &id,
            "scope_in",
            Severity::Block,
            "scope_in must name at least one area",
        ));
    }
    if matches!(&raw.scope_out, Some(v) if v.is_empty()) {
        findings.push(finding(
            &id,
            "scope_out",
            Severity::Warning,
            "scope_out is empty; nothing is explicitly excluded",
        ));
    }

    let raw_deps = raw.dependencies.clone().unwrap_or_default();
    let mut dependencies = BTreeSet::new();
    for dep in raw_deps {
        let dep = dep.trim().to_string();
        if dep == id {
            findings.push(finding(
                &id,
                "dependencies",
                Severity::Block,
                "card depends on itself",
            ));
            continue;
        }
        if !dependencies.insert(dep.clone()) {
            findings.push(finding(
                &id,
                "dependencies",
                Severity::Info,
                format!("duplicate dependency '{dep}' ignored"),
            ));
        }
    }

    if tier == Tier::B {
        if let Some(risk) = &raw.risk {
            if risk.level >= RiskLevel::High {
                findings.push(finding(
                    &id,
                    "risk",
                    Severity::Warning,
                    "high-risk work should be a Tier-A card",
                ));
            }
        }
        if raw.has_field("decision_record") {
            findings.push(finding(
                &id,
                "decision_record",
                Severity::Info,
                "decision_record is optional for Tier-B cards",
            ));
        }
    }

    if let Some(plan) = raw.rollback_plan.as_deref() {
        let lowered = plan.trim().to_ascii_lowercase();
        if matches!(lowered.as_str(), "none" | "n/a" | "na" | "-") {
            findings.push(finding(
                &id,
                "rollback_plan",
                Severity::Warning,
                "rollback_plan declares no undo path",
            ));
        }
    }

    if raw.capability.is_none() {
        findings.push(finding(
            &id,
            "capability",
            Severity::Info,
            format!("capability not set; defaulting to '{DEFAULT_CAPABILITY}'"),
        ));
    }

    for key in raw.extra.keys() {
        findings.push(finding(
            &id,
            key,
            Severity::Warning,
            format!("unknown field '{key}'"),
        ));
    }

    let card = TaskCard {
        id,
        tier,
        goal: raw.goal.unwrap_or_default(),
        scope_in: raw.scope_in.unwrap_or_default(),
        scope_out: raw.scope_out.unwrap_or_default(),
        dependencies,
        risk: raw.risk,
        acceptance_command: raw.acceptance_command.unwrap_or_default(),
        rollback_plan: raw.rollback_plan.unwrap_or_default(),
        evidence: raw.evidence.unwrap_or_default(),
        decision_record: raw.decision_record.filter(|s| !s.trim().is_empty()),
        capability: raw
            .capability
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CAPABILITY.to_string()),
        source: source.map(Path::to_path_buf),
    };

    ValidatedCard { card, findings }
}

/// All cards known to a project, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CardStore {
    cards: BTreeMap<String, ValidatedCard>,
}

impl CardStore {
    /// Load every `*.toml` document under `dir`. A missing directory is an empty store.
    pub fn load_dir(dir: &Path) -> Result<Self, PhasegateError> {
        let mut store = CardStore::default();
        if !dir.exists() {
            return Ok(store);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(PhasegateError::IoError)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
            .collect();
        paths.sort();
        for path in paths {
            let text = fs::read_to_string(&path).map_err(PhasegateError::IoError)?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            store.insert(parse_card(&text, &stem, Some(&path)));
        }
        Ok(store)
    }

    /// Add a validated card. A duplicate id keeps the first document and
    /// blocks it, naming the second source.
    pub fn insert(&mut self, validated: ValidatedCard) {
        let id = validated.card.id.clone();
        match self.cards.get_mut(&id) {
            Some(existing) => {
                let other = validated
                    .card
                    .source
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<inline>".to_string());
                existing.findings.push(finding(
                    &id,
                    "id",
                    Severity::Block,
                    format!("duplicate card id also defined in {other}"),
                ));
            }
            None => {
                self.cards.insert(id, validated);
            }
        }
    }

    pub fn from_cards(cards: impl IntoIterator<Item = TaskCard>) -> Self {
        let mut store = CardStore::default();
        for card in cards {
            store.insert(ValidatedCard {
                card,
                findings: Vec::new(),
            });
        }
        store
    }

    pub fn get(&self, id: &str) -> Option<&ValidatedCard> {
        self.cards.get(id)
    }

    pub fn card(&self, id: &str) -> Option<&TaskCard> {
        self.cards.get(id).map(|v| &v.card)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cards.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatedCard> {
        self.cards.values()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn findings(&self) -> Vec<&Finding> {
        self.cards.values().flat_map(|v| v.findings.iter()).collect()
    }

    pub fn severity_counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for f in self.findings() {
            *counts.entry(f.severity).or_insert(0) += 1;
        }
        counts
    }
}
