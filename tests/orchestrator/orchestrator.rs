use phasegate::core::checkpoint::{
    Checkpoint, CheckpointStore, FileSnapshotStore, SnapshotStore, archive_checkpoint,
};
use phasegate::core::error::PhasegateError;
use phasegate::core::evidence::EvidenceLedger;
use phasegate::core::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry, TaskExecutor};
use phasegate::core::guard::{CheckRunner, GuardResult, GuardStatus};
use phasegate::core::journal::read_events;
use phasegate::core::orchestrator::{
    Orchestrator, OrchestratorSettings, PlanView, RunState, Terminal, WorkflowStatus,
};
use phasegate::core::plan::Plan;
use phasegate::core::taskcard::{CardStatus, CardStore, DEFAULT_CAPABILITY, TaskCard};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const PLAN: &str = r#"
[[phase]]
id = "P1"

[[workflow]]
id = "W0"
phase = "P1"
cards = ["C2", "C1"]
checks = ["lint"]

[[workflow]]
id = "W1"
phase = "P1"
depends_on = ["W0"]
cards = ["C3"]

[[guard]]
name = "lint"
command = "true"
"#;

const TWO_PHASE_PLAN: &str = r#"
[[phase]]
id = "P1"

[[phase]]
id = "P2"

[[workflow]]
id = "W0"
phase = "P1"
cards = ["C1", "C2"]
checks = ["lint"]

[[workflow]]
id = "W1"
phase = "P2"
cards = ["C3"]

[[guard]]
name = "lint"
command = "true"

[[guard]]
name = "schema"
command = "true"

[[guard]]
name = "docs"
command = "true"

[[criterion]]
id = "G-schema"
phase = "P1"
kind = "hard"
check = "schema"
node = "XL-orders"

[[criterion]]
id = "G-docs"
phase = "P1"
kind = "soft"
check = "docs"

[[node]]
id = "XL-orders"
layers = ["db", "api"]
"#;

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    fail: BTreeSet<String>,
    panic_on: BTreeSet<String>,
    /// Card that waits for cancellation, signalling once it has started.
    hang_on: Option<(String, Mutex<mpsc::Sender<()>>)>,
    delay: BTreeMap<String, Duration>,
    /// Start and end of each card's execution.
    spans: Mutex<BTreeMap<String, (Instant, Instant)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingExecutor {
    fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    fn slow(cards: &[(&str, u64)]) -> Self {
        Self {
            delay: cards
                .iter()
                .map(|(id, ms)| (id.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn span(&self, card: &str) -> (Instant, Instant) {
        self.spans.lock().expect("spans lock")[card]
    }

    fn outcome_for(&self, card: &TaskCard, ctx: &ExecutionContext) -> ExecutionOutcome {
        if self.panic_on.contains(&card.id) {
            panic!("executor crashed on {}", card.id);
        }
        if let Some(delay) = self.delay.get(&card.id) {
            thread::sleep(*delay);
        }
        if let Some((id, started)) = &self.hang_on {
            if *id == card.id {
                started.lock().expect("sender lock").send(()).expect("signal start");
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                return ExecutionOutcome::failed("cancelled");
            }
        }
        if self.fail.contains(&card.id) {
            ExecutionOutcome::failed(format!("{} could not be applied", card.id))
        } else {
            ExecutionOutcome::ok(format!("{} applied", card.id))
        }
    }
}

impl TaskExecutor for RecordingExecutor {
    fn execute(&self, card: &TaskCard, ctx: &ExecutionContext) -> ExecutionOutcome {
        self.calls.lock().expect("calls lock").push(card.id.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let started = Instant::now();
        let outcome = self.outcome_for(card, ctx);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.spans
            .lock()
            .expect("spans lock")
            .insert(card.id.clone(), (started, Instant::now()));
        outcome
    }
}

/// Checkpoint file whose first save with `card` in progress fails.
struct FlakySnapshots {
    inner: FileSnapshotStore,
    card: String,
    tripped: AtomicBool,
}

impl SnapshotStore for FlakySnapshots {
    fn load(&self) -> Result<Option<Checkpoint>, PhasegateError> {
        self.inner.load()
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PhasegateError> {
        if checkpoint.card_status(&self.card) == CardStatus::InProgress
            && !self.tripped.swap(true, Ordering::SeqCst)
        {
            return Err(PhasegateError::IoError(io::Error::other("disk hiccup")));
        }
        self.inner.save(checkpoint)
    }
}

#[derive(Default)]
struct ScriptedChecks {
    failing: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedChecks {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl CheckRunner for ScriptedChecks {
    fn run_check(&self, guard: &str) -> GuardResult {
        self.calls.lock().expect("checks lock").push(guard.to_string());
        if self.failing.contains(guard) {
            GuardResult::unavailable(guard, format!("{guard}: 1 violation"))
        } else {
            GuardResult {
                guard: guard.to_string(),
                status: GuardStatus::Pass,
                violations: Vec::new(),
                count: 0,
                exit_code: Some(0),
                duration_ms: 1,
                timestamp: "1Z".to_string(),
            }
        }
    }
}

fn default_cards() -> Vec<TaskCard> {
    vec![
        TaskCard::new("C1", "create orders table", "true"),
        TaskCard::new("C2", "expose orders endpoint", "true").depends_on("C1"),
        TaskCard::new("C3", "render orders page", "true"),
    ]
}

fn build(
    dir: &Path,
    plan_text: &str,
    cards: Vec<TaskCard>,
    executor: Arc<RecordingExecutor>,
    checks: Arc<ScriptedChecks>,
) -> Result<Orchestrator, PhasegateError> {
    let snapshots = FileSnapshotStore::new(&dir.join(".phasegate/checkpoint.json"));
    build_with(dir, plan_text, cards, executor, checks, Box::new(snapshots), 4)
}

fn build_with(
    dir: &Path,
    plan_text: &str,
    cards: Vec<TaskCard>,
    executor: Arc<RecordingExecutor>,
    checks: Arc<ScriptedChecks>,
    snapshots: Box<dyn SnapshotStore>,
    max_concurrency: usize,
) -> Result<Orchestrator, PhasegateError> {
    let plan = Plan::from_toml(plan_text)?;
    let state = dir.join(".phasegate");
    let checkpoint = CheckpointStore::open(snapshots, &plan)?;
    let evidence = EvidenceLedger::open(&state.join("evidence.events.jsonl"))?;
    let mut executors = ExecutorRegistry::new();
    executors.register(DEFAULT_CAPABILITY, executor);
    let mut settings = OrchestratorSettings::new(dir);
    settings.max_concurrency = max_concurrency;
    settings.reports_dir = Some(state.join("reports"));
    settings.journal_path = Some(state.join("orchestrator.events.jsonl"));
    Orchestrator::new(
        plan,
        CardStore::from_cards(cards),
        checkpoint,
        evidence,
        executors,
        checks,
        settings,
    )
}

#[test]
fn dependent_workflow_waits_for_cards_and_checks() {
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::default());
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Done);
    assert_eq!(
        report.execution_trace,
        vec!["C1", "C2", "W0-checks", "C3", "W1-checks"]
    );
    assert_eq!(executor.calls(), vec!["C1", "C2", "C3"]);
    assert_eq!(orch.state(), RunState::Done);

    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert!(cp.is_workflow_done("W0") && cp.is_workflow_done("W1"));
    assert!(cp.is_phase_complete("P1"));
    assert!(
        tmp.path()
            .join(".phasegate/reports")
            .join(format!("run-{}.json", report.run_id))
            .exists()
    );
}

#[test]
fn dry_run_selects_only_unblocked_workflows() {
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::default());
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let view = orch.dry_run().expect("dry run");
    assert_eq!(view.next_wave, vec!["W0"]);
    assert_eq!(view.pending_cards, vec!["C1", "C2", "C3"]);
    assert!(executor.calls().is_empty());
    assert!(!tmp.path().join(".phasegate/checkpoint.json").exists());
}

#[test]
fn resume_after_completion_executes_nothing() {
    let tmp = tempdir().expect("tempdir");
    let first = Arc::new(RecordingExecutor::default());
    build(
        tmp.path(),
        PLAN,
        default_cards(),
        first,
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build")
    .resume()
    .expect("first resume");

    let second = Arc::new(RecordingExecutor::default());
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        second.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("rebuild");
    let report = orch.resume().expect("second resume");
    assert_eq!(report.terminal, Terminal::Done);
    assert!(report.execution_trace.is_empty());
    assert!(second.calls().is_empty());
}

#[test]
fn blocked_gate_resumes_without_repeating_completed_workflows() {
    let tmp = tempdir().expect("tempdir");
    let first = Arc::new(RecordingExecutor::default());
    let report = build(
        tmp.path(),
        TWO_PHASE_PLAN,
        default_cards(),
        first.clone(),
        Arc::new(ScriptedChecks::failing(&["schema"])),
    )
    .expect("build")
    .resume()
    .expect("first resume");

    assert_eq!(report.terminal, Terminal::Blocked);
    assert_eq!(first.calls(), vec!["C1", "C2"]);
    let gate = report.phases[0].gate.as_ref().expect("gate report");
    assert!(!gate.go_no_go);
    assert_eq!(gate.blocking_items.len(), 1);
    assert!(report.reasons.iter().any(|r| r.contains("G-schema")));
    assert!(tmp.path().join(".phasegate/reports/P1.gate.json").exists());

    let second = Arc::new(RecordingExecutor::default());
    let orch = build(
        tmp.path(),
        TWO_PHASE_PLAN,
        default_cards(),
        second.clone(),
        Arc::new(ScriptedChecks::failing(&["docs"])),
    )
    .expect("rebuild");
    let report = orch.resume().expect("second resume");
    assert_eq!(report.terminal, Terminal::Done);
    assert_eq!(second.calls(), vec!["C3"]);
    assert_eq!(report.execution_trace, vec!["C3", "W1-checks"]);

    // The soft docs failure was carried into P2 and re-checked there.
    let p1 = report.phases[0].gate.as_ref().expect("P1 gate");
    assert!(p1.go_no_go);
    assert_eq!(p1.controlled_pending.len(), 1);
    let p2 = report.phases[1].gate.as_ref().expect("P2 gate");
    assert_eq!(p2.overdue, vec!["G-docs"]);
    assert!(p2.go_no_go);
}

#[test]
fn failing_card_halts_only_its_workflow() {
    let plan = format!(
        "{PLAN}\n[[workflow]]\nid = \"W2\"\nphase = \"P1\"\ncards = [\"C4\"]\n"
    );
    let mut cards = default_cards();
    cards.push(TaskCard::new("C4", "independent cleanup", "true"));
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::failing(&["C1"]));
    let orch = build(
        tmp.path(),
        &plan,
        cards,
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Failed);
    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert!(cp.is_workflow_done("W2"));
    assert!(cp.failed_workflows["W0"].starts_with("Card 'C1' failed"));
    assert_eq!(cp.card_status("C1"), CardStatus::Failed);
    assert_eq!(cp.card_status("C2"), CardStatus::Pending);
    assert!(!executor.calls().contains(&"C3".to_string()));
    assert!(report.reasons.iter().any(|r| r.contains("W1")));
}

#[test]
fn executor_panic_is_contained_to_its_card() {
    let plan = format!(
        "{PLAN}\n[[workflow]]\nid = \"W2\"\nphase = \"P1\"\ncards = [\"C4\"]\n"
    );
    let mut cards = default_cards();
    cards.push(TaskCard::new("C4", "independent cleanup", "true"));
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor {
        panic_on: BTreeSet::from(["C1".to_string()]),
        ..RecordingExecutor::default()
    });
    let orch = build(
        tmp.path(),
        &plan,
        cards,
        executor,
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume survives panic");
    assert_eq!(report.terminal, Terminal::Failed);
    let w0 = report.phases[0]
        .workflows
        .iter()
        .find(|w| w.workflow == "W0")
        .expect("W0 ran");
    assert_eq!(w0.status, WorkflowStatus::Failed);
    assert!(w0.reason.as_deref().unwrap_or("").contains("panicked"));
    assert!(orch.checkpoint().is_workflow_done("W2").expect("read"));
}

#[test]
fn failing_check_keeps_cards_done_but_fails_workflow() {
    let tmp = tempdir().expect("tempdir");
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::failing(&["lint"])),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Failed);
    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert_eq!(cp.card_status("C1"), CardStatus::Done);
    assert_eq!(cp.card_status("C2"), CardStatus::Done);
    assert!(cp.failed_workflows["W0"].contains("checks failed"));
    assert!(!cp.is_workflow_done("W0"));
}

#[test]
fn failing_acceptance_command_fails_card() {
    let cards = vec![
        TaskCard::new("C1", "create orders table", "exit 7"),
        TaskCard::new("C2", "expose orders endpoint", "true").depends_on("C1"),
        TaskCard::new("C3", "render orders page", "true"),
    ];
    let tmp = tempdir().expect("tempdir");
    let orch = build(
        tmp.path(),
        PLAN,
        cards,
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Failed);
    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert_eq!(cp.card_status("C1"), CardStatus::Failed);
    assert!(cp.failed_workflows["W0"].contains("acceptance"));
}

#[test]
fn every_done_card_has_evidence() {
    let tmp = tempdir().expect("tempdir");
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");
    orch.resume().expect("resume");

    let integrity = orch.verify_evidence().expect("verify");
    assert!(integrity.ok(), "{:?}", integrity.violations());
    assert_eq!(integrity.done_cards, 3);
    for card in ["C1", "C2", "C3"] {
        let records = orch.evidence().records_for(card).expect("records");
        assert!(records.iter().any(|r| r.verdict == "pass"), "{card}");
    }

    let journal = read_events(&tmp.path().join(".phasegate/orchestrator.events.jsonl"))
        .expect("journal");
    assert!(journal.iter().any(|e| e.op == "card.done" && e.subject == "C2"));
}

#[test]
fn corrupt_checkpoint_refuses_resume_until_reset() {
    let tmp = tempdir().expect("tempdir");
    build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build")
    .resume()
    .expect("resume");

    let state = tmp.path().join(".phasegate");
    let checkpoint = state.join("checkpoint.json");
    let text = fs::read_to_string(&checkpoint).expect("read checkpoint");
    fs::write(&checkpoint, text.replace("\"done\"", "\"pending\"")).expect("tamper");

    let err = build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .err()
    .expect("corruption detected");
    assert!(matches!(err, PhasegateError::CheckpointCorruption { .. }));
    assert!(err.is_fatal());

    archive_checkpoint(&checkpoint, &state.join("archive"))
        .expect("archive")
        .expect("archived path");
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("fresh start after reset");
    assert_eq!(orch.checkpoint().snapshot().expect("snapshot").phase, "P1");
}

#[test]
fn abort_fails_workflow_at_last_completed_card() {
    let tmp = tempdir().expect("tempdir");
    let (tx, rx) = mpsc::channel();
    let executor = Arc::new(RecordingExecutor {
        hang_on: Some(("C2".to_string(), Mutex::new(tx))),
        ..RecordingExecutor::default()
    });
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        executor,
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = thread::scope(|s| {
        let handle = s.spawn(|| orch.resume());
        rx.recv_timeout(Duration::from_secs(10)).expect("C2 started");
        orch.abort("W0").expect("abort");
        handle.join().expect("join")
    })
    .expect("resume");

    assert_eq!(report.terminal, Terminal::Failed);
    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert_eq!(cp.failed_workflows["W0"], "aborted after card 'C1'");
    assert_eq!(cp.card_status("C1"), CardStatus::Done);
    assert_eq!(cp.card_status("C2"), CardStatus::Failed);
    assert!(orch.abort("W9").is_err());
}

#[test]
fn targeted_run_requires_done_dependencies() {
    let tmp = tempdir().expect("tempdir");
    let orch = build(
        tmp.path(),
        PLAN,
        default_cards(),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let early = orch.run_workflow("W1").expect("targeted W1");
    assert_eq!(early.terminal, Terminal::Blocked);
    assert!(early.reasons[0].contains("W0"));

    let w0 = orch.run_workflow("W0").expect("targeted W0");
    assert_eq!(w0.terminal, Terminal::Done);
    assert_eq!(w0.execution_trace, vec!["C1", "C2", "W0-checks"]);

    let w1 = orch.run_workflow("W1").expect("targeted W1 again");
    assert_eq!(w1.terminal, Terminal::Done);
    assert!(matches!(
        orch.run_workflow("W9"),
        Err(PhasegateError::NotFound(_))
    ));
}

#[test]
fn unknown_dependency_blocks_card_but_not_siblings() {
    let plan = format!(
        "{PLAN}\n[[workflow]]\nid = \"W2\"\nphase = \"P1\"\ncards = [\"C4\"]\n"
    );
    let mut cards = default_cards();
    cards.push(TaskCard::new("C4", "wire billing", "true").depends_on("C99"));
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::default());
    let orch = build(
        tmp.path(),
        &plan,
        cards,
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let view = orch.dry_run().expect("dry run");
    let text = serde_json::to_string(&view).expect("serialize view");
    let back: PlanView = serde_json::from_str(&text).expect("view reads back");
    assert_eq!(back.unknown_dependencies.len(), 1);
    assert_eq!(back.unknown_dependencies[0].from, "C4");
    assert_eq!(back.unknown_dependencies[0].missing, "C99");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Blocked);
    assert!(report.blocked_cards.contains_key("C4"));
    assert_eq!(executor.calls(), vec!["C1", "C2", "C3"]);
    assert!(report.reasons.iter().any(|r| r.contains("W2")));
}

#[test]
fn dependency_cycle_is_fatal_and_named() {
    let cards = vec![
        TaskCard::new("C1", "a", "true").depends_on("C2"),
        TaskCard::new("C2", "b", "true").depends_on("C1"),
        TaskCard::new("C3", "c", "true"),
    ];
    let tmp = tempdir().expect("tempdir");
    let err = build(
        tmp.path(),
        PLAN,
        cards,
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .err()
    .expect("cycle detected");
    match err {
        PhasegateError::CycleDetected { cycle } => {
            assert!(cycle.contains(&"card:C1".to_string()));
            assert!(cycle.contains(&"card:C2".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn concurrent_workflows_share_one_checkpoint() {
    let mut plan = String::from("[[phase]]\nid = \"P1\"\n");
    let mut cards = Vec::new();
    for i in 0..6 {
        plan.push_str(&format!(
            "\n[[workflow]]\nid = \"W{i}\"\nphase = \"P1\"\ncards = [\"A{i}\", \"B{i}\"]\n"
        ));
        cards.push(TaskCard::new(&format!("A{i}"), "first", "true"));
        cards.push(TaskCard::new(&format!("B{i}"), "second", "true").depends_on(&format!("A{i}")));
    }
    let tmp = tempdir().expect("tempdir");
    let orch = build(
        tmp.path(),
        &plan,
        cards,
        Arc::new(RecordingExecutor::default()),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Done);
    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert_eq!(cp.completed_workflows.len(), 6);
    let statuses: BTreeMap<_, _> = cp.card_status.clone();
    assert_eq!(statuses.len(), 12);
    assert!(statuses.values().all(|s| *s == CardStatus::Done));
    assert!(orch.verify_evidence().expect("verify").ok());
}

#[test]
fn finished_dependency_starts_dependent_without_waiting_for_slow_sibling() {
    let plan = r#"
[[phase]]
id = "P1"

[[workflow]]
id = "Wslow"
phase = "P1"
cards = ["S1"]

[[workflow]]
id = "Wfast"
phase = "P1"
cards = ["F1"]

[[workflow]]
id = "Wnext"
phase = "P1"
depends_on = ["Wfast"]
cards = ["N1"]
"#;
    let cards = vec![
        TaskCard::new("S1", "long migration", "true"),
        TaskCard::new("F1", "quick fix", "true"),
        TaskCard::new("N1", "follow-up", "true"),
    ];
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::slow(&[("S1", 800)]));
    let orch = build(
        tmp.path(),
        plan,
        cards,
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Done);
    let (n1_start, _) = executor.span("N1");
    let (_, s1_end) = executor.span("S1");
    assert!(
        n1_start < s1_end,
        "Wnext waited for the unrelated slow workflow"
    );
}

#[test]
fn max_concurrency_bounds_workflows_in_flight() {
    let mut plan = String::from("[[phase]]\nid = \"P1\"\n");
    let mut cards = Vec::new();
    let mut delays = Vec::new();
    for i in 0..6 {
        plan.push_str(&format!(
            "\n[[workflow]]\nid = \"W{i}\"\nphase = \"P1\"\ncards = [\"K{i}\"]\n"
        ));
        cards.push(TaskCard::new(&format!("K{i}"), "parallel work", "true"));
        delays.push(format!("K{i}"));
    }
    let delays: Vec<(&str, u64)> = delays.iter().map(|id| (id.as_str(), 150)).collect();
    let executor = Arc::new(RecordingExecutor::slow(&delays));
    let tmp = tempdir().expect("tempdir");
    let snapshots = FileSnapshotStore::new(&tmp.path().join(".phasegate/checkpoint.json"));
    let orch = build_with(
        tmp.path(),
        &plan,
        cards,
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
        Box::new(snapshots),
        2,
    )
    .expect("build");

    let report = orch.resume().expect("resume");
    assert_eq!(report.terminal, Terminal::Done);
    assert_eq!(executor.calls().len(), 6);
    assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
}

#[test]
fn store_error_fails_one_workflow_and_the_rest_still_run() {
    let plan = format!(
        "{PLAN}\n[[workflow]]\nid = \"W2\"\nphase = \"P1\"\ncards = [\"C4\"]\n\n[[workflow]]\nid = \"W3\"\nphase = \"P1\"\ncards = [\"C5\"]\n"
    );
    let mut cards = default_cards();
    cards.push(TaskCard::new("C4", "independent cleanup", "true"));
    cards.push(TaskCard::new("C5", "independent docs", "true"));
    let tmp = tempdir().expect("tempdir");
    let executor = Arc::new(RecordingExecutor::default());
    let snapshots = FlakySnapshots {
        inner: FileSnapshotStore::new(&tmp.path().join(".phasegate/checkpoint.json")),
        card: "C1".to_string(),
        tripped: AtomicBool::new(false),
    };
    let orch = build_with(
        tmp.path(),
        &plan,
        cards,
        executor.clone(),
        Arc::new(ScriptedChecks::default()),
        Box::new(snapshots),
        1,
    )
    .expect("build");

    let report = orch.resume().expect("store error stays inside the workflow");
    assert_eq!(report.terminal, Terminal::Failed);
    let calls = executor.calls();
    assert!(calls.contains(&"C4".to_string()));
    assert!(calls.contains(&"C5".to_string()));
    assert!(!calls.contains(&"C1".to_string()));

    let cp = orch.checkpoint().snapshot().expect("snapshot");
    assert!(cp.is_workflow_done("W2") && cp.is_workflow_done("W3"));
    assert!(cp.failed_workflows["W0"].contains("disk hiccup"));
    assert!(
        tmp.path()
            .join(".phasegate/reports")
            .join(format!("run-{}.json", report.run_id))
            .exists()
    );
}
