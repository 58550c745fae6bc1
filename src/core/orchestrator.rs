//! Orchestrator: the phase state machine.
//!
//! ```text
//! IDLE -> SELECT_WORKFLOW -> RUN_CARDS -> RUN_CHECKS -> CHECKPOINT -> (loop)
//!      -> PHASE_EXIT -> DONE | BLOCKED | FAILED
//! ```
//!
//! Workflows whose dependencies are done run on a bounded worker pool, and
//! selection reruns as each one finishes. Every state-changing step goes
//! through the [`CheckpointStore`] before the next one starts, so a crash
//! loses at most the unit in flight. A card failure, an executor panic, a
//! failing check or a non-fatal store error fails its own workflow and
//! nothing else.

use crate::core::checkpoint::{Checkpoint, CheckpointStore, FileSnapshotStore};
use crate::core::config::{Config, GateConfig};
use crate::core::error::PhasegateError;
use crate::core::evidence::{EvidenceEntry, EvidenceLedger, IntegrityReport, SubjectKind};
use crate::core::executor::{ExecutionContext, ExecutorRegistry};
use crate::core::gate::{ControlledPending, GateEvaluator, GateReport};
use crate::core::guard::{CheckRunner, GuardResult, GuardVerifier, run_shell};
use crate::core::journal::Journal;
use crate::core::output::preview_items;
use crate::core::plan::Plan;
use crate::core::resolver::{self, ExecutionPlan, UnknownDependency, WorkflowPlan};
use crate::core::store::Store;
use crate::core::taskcard::{CardStatus, CardStore, TaskCard};
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    SelectWorkflow,
    RunCards,
    RunChecks,
    Checkpoint,
    PhaseExit,
    Done,
    Blocked,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::SelectWorkflow => "SELECT_WORKFLOW",
            RunState::RunCards => "RUN_CARDS",
            RunState::RunChecks => "RUN_CHECKS",
            RunState::Checkpoint => "CHECKPOINT",
            RunState::PhaseExit => "PHASE_EXIT",
            RunState::Done => "DONE",
            RunState::Blocked => "BLOCKED",
            RunState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Terminal {
    Done,
    Blocked,
    Failed,
}

impl Terminal {
    pub fn exit_code(&self) -> i32 {
        match self {
            Terminal::Done => 0,
            Terminal::Failed => 1,
            Terminal::Blocked => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.state().as_str()
    }

    fn state(&self) -> RunState {
        match self {
            Terminal::Done => RunState::Done,
            Terminal::Blocked => RunState::Blocked,
            Terminal::Failed => RunState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Done,
    Failed,
    Blocked,
}

/// What one workflow did during a run. `steps` lists executed cards and the
/// `<workflow>-checks` step, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRun {
    pub workflow: String,
    pub status: WorkflowStatus,
    pub reason: Option<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub terminal: Terminal,
    pub workflows: Vec<WorkflowRun>,
    pub gate: Option<GateReport>,
    pub integrity: Option<IntegrityReport>,
    /// Criteria, cards, workflows or nodes that produced the outcome.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: String,
    pub terminal: Terminal,
    pub started_at: String,
    pub finished_at: String,
    pub execution_trace: Vec<String>,
    pub phases: Vec<PhaseOutcome>,
    pub blocked_cards: BTreeMap<String, Vec<String>>,
    pub blocked_workflows: BTreeMap<String, Vec<String>>,
    pub reasons: Vec<String>,
}

impl RunReport {
    pub fn write(&self, reports_dir: &Path) -> Result<PathBuf, PhasegateError> {
        fs::create_dir_all(reports_dir).map_err(PhasegateError::IoError)?;
        let path = reports_dir.join(format!("run-{}.json", self.run_id));
        fs::write(&path, serde_json::to_vec_pretty(self)?).map_err(PhasegateError::IoError)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardView {
    pub id: String,
    pub status: CardStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowView {
    pub id: String,
    pub phase: String,
    /// done | failed | blocked | ready | waiting
    pub state: String,
    pub depends_on: Vec<String>,
    pub cards: Vec<CardView>,
    pub checks: Vec<String>,
}

/// Side-effect free picture of the plan against the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub phase: String,
    pub completed_phases: Vec<String>,
    pub workflows: Vec<WorkflowView>,
    /// Workflows the next SELECT_WORKFLOW step would start.
    pub next_wave: Vec<String>,
    /// Cards still to run, in execution order.
    pub pending_cards: Vec<String>,
    pub controlled_pending: Vec<ControlledPending>,
    pub blocked_cards: BTreeMap<String, Vec<String>>,
    pub blocked_workflows: BTreeMap<String, Vec<String>>,
    pub unknown_dependencies: Vec<UnknownDependency>,
    pub unassigned_cards: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub project_root: PathBuf,
    pub max_concurrency: usize,
    /// Applied to executor commands and acceptance commands.
    pub command_timeout: Duration,
    pub gate: GateConfig,
    pub reports_dir: Option<PathBuf>,
    pub journal_path: Option<PathBuf>,
}

impl OrchestratorSettings {
    pub fn new(project_root: &Path) -> Self {
        Self::from_config(&Config::default(), project_root)
    }

    pub fn from_config(config: &Config, project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            max_concurrency: config.orchestrator.max_concurrency.max(1),
            command_timeout: Duration::from_secs(config.guards.default_timeout_secs),
            gate: config.gate.clone(),
            reports_dir: None,
            journal_path: None,
        }
    }
}

struct Run {
    id: String,
    journal: Journal,
}

pub struct Orchestrator {
    plan: Plan,
    cards: CardStore,
    execution: ExecutionPlan,
    checkpoint: CheckpointStore,
    evidence: EvidenceLedger,
    executors: ExecutorRegistry,
    checks: Arc<dyn CheckRunner>,
    settings: OrchestratorSettings,
    aborts: Mutex<BTreeMap<String, Arc<AtomicBool>>>,
    state: Mutex<RunState>,
}

impl Orchestrator {
    /// Resolve the plan and take ownership of the stores. A dependency cycle fails here.
    pub fn new(
        plan: Plan,
        cards: CardStore,
        checkpoint: CheckpointStore,
        evidence: EvidenceLedger,
        executors: ExecutorRegistry,
        checks: Arc<dyn CheckRunner>,
        settings: OrchestratorSettings,
    ) -> Result<Self, PhasegateError> {
        let execution = resolver::resolve(&plan, &cards)?;
        Ok(Self {
            plan,
            cards,
            execution,
            checkpoint,
            evidence,
            executors,
            checks,
            settings,
            aborts: Mutex::new(BTreeMap::new()),
            state: Mutex::new(RunState::Idle),
        })
    }

    /// Wire up a project on disk: manifest, cards, `.phasegate/` stores,
    /// guard verifier and configured executors.
    pub fn from_project(store: &Store, config: &Config) -> Result<Self, PhasegateError> {
        let plan = Plan::load(&store.project_root.join(&config.orchestrator.plan))?;
        let cards = CardStore::load_dir(&store.project_root.join(&config.orchestrator.cards_dir))?;
        store.ensure()?;
        let checkpoint = CheckpointStore::open(
            Box::new(FileSnapshotStore::new(&store.checkpoint_path())),
            &plan,
        )?;
        let evidence = EvidenceLedger::open(&store.evidence_path())?;
        let checks = Arc::new(GuardVerifier::new(
            plan.guards.clone(),
            &store.project_root,
            Duration::from_secs(config.guards.default_timeout_secs),
        ));
        let mut settings = OrchestratorSettings::from_config(config, &store.project_root);
        settings.reports_dir = Some(store.reports_dir());
        settings.journal_path = Some(store.journal_path());
        Self::new(
            plan,
            cards,
            checkpoint,
            evidence,
            ExecutorRegistry::from_config(config),
            checks,
            settings,
        )
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn cards(&self) -> &CardStore {
        &self.cards
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn evidence(&self) -> &EvidenceLedger {
        &self.evidence
    }

    pub fn state(&self) -> RunState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or_else(|e| *e.into_inner())
    }

    fn enter(&self, run: &Run, state: RunState, subject: &str) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        run.journal
            .note("state.enter", subject, state.as_str(), JsonValue::Null);
    }

    fn begin_run(&self) -> Run {
        let id = time::new_event_id();
        let journal = match &self.settings.journal_path {
            Some(path) => Journal::new(path, &id),
            None => Journal::disabled(&id),
        };
        Run { id, journal }
    }

    fn abort_flag(&self, workflow: &str) -> Arc<AtomicBool> {
        let mut aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts
            .entry(workflow.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Request cancellation of a workflow. In-flight child processes are
    /// killed and the workflow fails at its last completed card.
    pub fn abort(&self, workflow: &str) -> Result<(), PhasegateError> {
        if self.execution.workflow(workflow).is_none() {
            return Err(PhasegateError::NotFound(format!("workflow '{workflow}'")));
        }
        self.abort_flag(workflow).store(true, Ordering::SeqCst);
        tracing::info!(workflow, "abort requested");
        Ok(())
    }

    /// Continue from the checkpoint through phases until one does not reach DONE.
    pub fn resume(&self) -> Result<RunReport, PhasegateError> {
        let run = self.begin_run();
        let started_at = time::now_epoch_z();
        run.journal.note("run.start", "resume", "running", JsonValue::Null);

        let mut phases = Vec::new();
        let terminal = loop {
            let cp = self.checkpoint.snapshot()?;
            if cp.is_phase_complete(&cp.phase) {
                break Terminal::Done;
            }
            let outcome = self.run_phase(&run, &cp.phase, &cp.controlled_pending)?;
            let terminal = outcome.terminal;
            let carried = outcome
                .gate
                .as_ref()
                .map(|g| g.controlled_pending.clone())
                .unwrap_or_default();
            phases.push(outcome);
            if terminal != Terminal::Done {
                break terminal;
            }
            let next = self.plan.next_phase(&cp.phase);
            self.enter(&run, RunState::Checkpoint, &cp.phase);
            self.checkpoint.advance_phase(next, carried)?;
            run.journal
                .note("phase.advance", &cp.phase, "done", json!({ "next": next }));
            if next.is_none() {
                break Terminal::Done;
            }
        };
        self.finish(run, "resume", started_at, terminal, phases)
    }

    /// Run one workflow whose dependencies are already done. No phase exit.
    pub fn run_workflow(&self, workflow: &str) -> Result<RunReport, PhasegateError> {
        let wf = self
            .execution
            .workflow(workflow)
            .ok_or_else(|| PhasegateError::NotFound(format!("workflow '{workflow}'")))?;
        let run = self.begin_run();
        let started_at = time::now_epoch_z();
        run.journal.note("run.start", workflow, "running", JsonValue::Null);

        let cp = self.checkpoint.snapshot()?;
        let unmet: Vec<&str> = wf
            .depends_on
            .iter()
            .filter(|d| !cp.is_workflow_done(d))
            .map(String::as_str)
            .collect();

        let (terminal, runs, reasons) = if cp.is_workflow_done(workflow) {
            (
                Terminal::Done,
                Vec::new(),
                vec![format!("workflow '{workflow}' is already done")],
            )
        } else if let Some(reasons) = self.execution.blocked_workflows.get(workflow) {
            (Terminal::Blocked, Vec::new(), reasons.clone())
        } else if let Some(reason) = cp.failed_workflows.get(workflow) {
            (
                Terminal::Failed,
                Vec::new(),
                vec![format!("workflow '{workflow}' failed earlier: {reason}")],
            )
        } else if !unmet.is_empty() {
            (
                Terminal::Blocked,
                Vec::new(),
                vec![format!("waiting on workflow(s) {}", unmet.join(", "))],
            )
        } else {
            let result = self.execute_workflow(&run, wf)?;
            let terminal = match result.status {
                WorkflowStatus::Done => Terminal::Done,
                WorkflowStatus::Failed => Terminal::Failed,
                WorkflowStatus::Blocked => Terminal::Blocked,
            };
            let reasons: Vec<String> = result.reason.iter().cloned().collect();
            (terminal, vec![result], reasons)
        };

        let phase = PhaseOutcome {
            phase: wf.phase.clone(),
            terminal,
            workflows: runs,
            gate: None,
            integrity: None,
            reasons,
        };
        self.finish(run, "targeted", started_at, terminal, vec![phase])
    }

    fn finish(
        &self,
        run: Run,
        mode: &str,
        started_at: String,
        terminal: Terminal,
        phases: Vec<PhaseOutcome>,
    ) -> Result<RunReport, PhasegateError> {
        self.enter(&run, terminal.state(), mode);
        let execution_trace = phases
            .iter()
            .flat_map(|p| p.workflows.iter())
            .flat_map(|w| w.steps.iter().cloned())
            .collect();
        let reasons = phases
            .last()
            .map(|p| p.reasons.clone())
            .unwrap_or_default();
        let report = RunReport {
            run_id: run.id.clone(),
            mode: mode.to_string(),
            terminal,
            started_at,
            finished_at: time::now_epoch_z(),
            execution_trace,
            phases,
            blocked_cards: self.execution.blocked_cards.clone(),
            blocked_workflows: self.execution.blocked_workflows.clone(),
            reasons,
        };
        if let Some(dir) = &self.settings.reports_dir {
            report.write(dir)?;
        }
        run.journal.note(
            "run.finish",
            mode,
            terminal.as_str(),
            json!({ "reasons": report.reasons }),
        );
        Ok(report)
    }

    fn is_ready(&self, wf: &WorkflowPlan, cp: &Checkpoint) -> bool {
        !cp.is_workflow_done(&wf.id)
            && !cp.failed_workflows.contains_key(&wf.id)
            && !self.execution.is_workflow_blocked(&wf.id)
            && wf.depends_on.iter().all(|d| cp.is_workflow_done(d))
    }

    fn run_phase(
        &self,
        run: &Run,
        phase: &str,
        carried: &[ControlledPending],
    ) -> Result<PhaseOutcome, PhasegateError> {
        let phase_plan = self
            .execution
            .phase(phase)
            .ok_or_else(|| PhasegateError::NotFound(format!("phase '{phase}'")))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.max_concurrency)
            .thread_name(|i| format!("phasegate-wf-{i}"))
            .build()
            .map_err(|e| PhasegateError::ConfigError(format!("worker pool: {e}")))?;

        let mut runs: Vec<WorkflowRun> = Vec::new();
        let mut attempted: BTreeSet<String> = BTreeSet::new();
        let (tx, rx) = mpsc::channel::<Result<WorkflowRun, PhasegateError>>();
        pool.in_place_scope(|scope| -> Result<(), PhasegateError> {
            let mut in_flight = 0usize;
            loop {
                self.enter(run, RunState::SelectWorkflow, phase);
                let cp = self.checkpoint.snapshot()?;
                for wf in &phase_plan.workflows {
                    if in_flight >= self.settings.max_concurrency {
                        break;
                    }
                    if attempted.contains(&wf.id) || !self.is_ready(wf, &cp) {
                        continue;
                    }
                    attempted.insert(wf.id.clone());
                    in_flight += 1;
                    tracing::debug!(phase, workflow = %wf.id, in_flight, "dispatching workflow");
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.execute_workflow(run, wf)
                        }))
                        .unwrap_or_else(|_| {
                            Ok(WorkflowRun {
                                workflow: wf.id.clone(),
                                status: WorkflowStatus::Failed,
                                reason: Some(format!("workflow '{}' panicked", wf.id)),
                                steps: Vec::new(),
                            })
                        });
                        let _ = tx.send(result);
                    });
                }
                if in_flight == 0 {
                    return Ok(());
                }
                // Any completion may unblock dependents; reselect right away.
                let result = rx.recv().map_err(|_| {
                    PhasegateError::ValidationError("workflow worker disappeared".into())
                })?;
                in_flight -= 1;
                runs.push(result?);
            }
        })?;

        let cp = self.checkpoint.snapshot()?;
        let mut failed = Vec::new();
        let mut blocked = Vec::new();
        for wf in &phase_plan.workflows {
            if cp.is_workflow_done(&wf.id) {
                continue;
            }
            if let Some(reason) = cp.failed_workflows.get(&wf.id) {
                failed.push(format!("workflow '{}' failed: {reason}", wf.id));
            } else {
                blocked.push(format!(
                    "workflow '{}' blocked: {}",
                    wf.id,
                    self.blocked_reason(wf, &cp, &runs)
                ));
            }
        }

        if !failed.is_empty() || !blocked.is_empty() {
            let terminal = if failed.is_empty() {
                Terminal::Blocked
            } else {
                Terminal::Failed
            };
            failed.extend(blocked);
            return Ok(PhaseOutcome {
                phase: phase.to_string(),
                terminal,
                workflows: runs,
                gate: None,
                integrity: None,
                reasons: failed,
            });
        }

        self.enter(run, RunState::PhaseExit, phase);
        let integrity = self.evidence.integrity_check(&cp.card_status)?;
        let gate =
            GateEvaluator::new(&self.plan, self.checks.as_ref(), &self.settings.gate)
                .evaluate(phase, carried)?;
        for result in &gate.guard_results {
            self.evidence.append(guard_entry(phase, result))?;
        }
        self.evidence.append(EvidenceEntry {
            subject: phase.to_string(),
            subject_kind: SubjectKind::Gate,
            action: "gate.evaluated".to_string(),
            verdict: if gate.go_no_go { "go" } else { "no-go" }.to_string(),
            actor: "gate".to_string(),
            detail: json!({
                "hard": gate.hard,
                "soft": gate.soft,
                "blocking": gate.blocking_summary(),
                "unbound_nodes": gate.unbound_nodes,
                "overdue": gate.overdue,
            }),
        })?;
        if let Some(dir) = &self.settings.reports_dir {
            gate.write(dir)?;
        }

        let mut reasons = gate.blocking_summary();
        reasons.extend(
            gate.unbound_nodes
                .iter()
                .map(|n| format!("cross-layer node '{n}' is not verified by any criterion")),
        );
        reasons.extend(integrity.violations());
        let terminal = if gate.go_no_go && integrity.ok() {
            Terminal::Done
        } else {
            Terminal::Blocked
        };
        run.journal.note(
            "phase.exit",
            phase,
            terminal.as_str(),
            json!({ "go_no_go": gate.go_no_go, "integrity_ok": integrity.ok() }),
        );

        Ok(PhaseOutcome {
            phase: phase.to_string(),
            terminal,
            workflows: runs,
            gate: Some(gate),
            integrity: Some(integrity),
            reasons,
        })
    }

    fn blocked_reason(
        &self,
        wf: &WorkflowPlan,
        cp: &Checkpoint,
        runs: &[WorkflowRun],
    ) -> String {
        if let Some(reasons) = self.execution.blocked_workflows.get(&wf.id) {
            return reasons.join("; ");
        }
        if let Some(reason) = runs
            .iter()
            .find(|r| r.workflow == wf.id)
            .and_then(|r| r.reason.clone())
        {
            return reason;
        }
        let unmet: Vec<&str> = wf
            .depends_on
            .iter()
            .filter(|d| !cp.is_workflow_done(d))
            .map(String::as_str)
            .collect();
        format!("waiting on workflow(s) {}", unmet.join(", "))
    }

    /// Run one workflow. A store error fails this workflow only; fatal kinds
    /// still end the run.
    fn execute_workflow(&self, run: &Run, wf: &WorkflowPlan) -> Result<WorkflowRun, PhasegateError> {
        let mut steps = Vec::new();
        match self.drive_workflow(run, wf, &mut steps) {
            Err(e) if !e.is_fatal() => {
                let reason = format!("workflow '{}' stopped: {e}", wf.id);
                tracing::error!(workflow = %wf.id, error = %e, "workflow stopped by store error");
                if let Err(record) = self.fail_workflow(run, wf, Vec::new(), reason.clone()) {
                    tracing::error!(workflow = %wf.id, error = %record, "could not record workflow failure");
                }
                Ok(WorkflowRun {
                    workflow: wf.id.clone(),
                    status: WorkflowStatus::Failed,
                    reason: Some(reason),
                    steps,
                })
            }
            other => other,
        }
    }

    fn drive_workflow(
        &self,
        run: &Run,
        wf: &WorkflowPlan,
        steps: &mut Vec<String>,
    ) -> Result<WorkflowRun, PhasegateError> {
        let ctx = ExecutionContext {
            project_root: self.settings.project_root.clone(),
            workflow: wf.id.clone(),
            cancel: self.abort_flag(&wf.id),
            timeout: self.settings.command_timeout,
        };
        run.journal
            .note("workflow.start", &wf.id, "running", json!({ "phase": wf.phase }));

        let mut last_done: Option<String> = None;

        self.enter(run, RunState::RunCards, &wf.id);
        for card_id in &wf.cards {
            if ctx.is_cancelled() {
                return self.abort_workflow(run, wf, mem::take(steps), last_done.as_deref());
            }
            match self.checkpoint.card_status(card_id)? {
                CardStatus::Done => {
                    last_done = Some(card_id.clone());
                    continue;
                }
                CardStatus::Failed => {
                    let reason = format!("card '{card_id}' failed in an earlier run");
                    return self.fail_workflow(run, wf, mem::take(steps), reason);
                }
                _ => {}
            }
            let Some(card) = self.cards.card(card_id) else {
                return Ok(WorkflowRun {
                    workflow: wf.id.clone(),
                    status: WorkflowStatus::Blocked,
                    reason: Some(format!("card '{card_id}' has no task card document")),
                    steps: mem::take(steps),
                });
            };
            if let Some(dep) = self.unmet_dependency(card)? {
                return Ok(WorkflowRun {
                    workflow: wf.id.clone(),
                    status: WorkflowStatus::Blocked,
                    reason: Some(format!("card '{card_id}' waits on '{dep}'")),
                    steps: mem::take(steps),
                });
            }

            self.checkpoint
                .transition_card(card_id, CardStatus::InProgress)?;
            steps.push(card_id.clone());
            run.journal.note(
                "card.start",
                card_id,
                CardStatus::InProgress.as_str(),
                json!({ "workflow": wf.id, "capability": card.capability }),
            );

            let attempt = self.attempt_card(card, &ctx);
            self.enter(run, RunState::Checkpoint, card_id);
            if attempt.success {
                self.evidence.append(EvidenceEntry::card(
                    card_id,
                    "card.completed",
                    "pass",
                    json!({
                        "workflow": wf.id,
                        "summary": attempt.summary,
                        "acceptance": card.acceptance_command,
                        "evidence_ref": card.evidence,
                    }),
                ))?;
                self.checkpoint.transition_card(card_id, CardStatus::Done)?;
                run.journal
                    .note("card.done", card_id, CardStatus::Done.as_str(), JsonValue::Null);
                last_done = Some(card_id.clone());
            } else {
                self.evidence.append(EvidenceEntry::card(
                    card_id,
                    "card.failed",
                    "fail",
                    json!({ "workflow": wf.id, "summary": attempt.summary }),
                ))?;
                self.checkpoint
                    .transition_card(card_id, CardStatus::Failed)?;
                if ctx.is_cancelled() {
                    return self.abort_workflow(run, wf, mem::take(steps), last_done.as_deref());
                }
                let reason = PhasegateError::CardExecutionFailure {
                    card: card_id.clone(),
                    reason: attempt.summary,
                }
                .to_string();
                return self.fail_workflow(run, wf, mem::take(steps), reason);
            }
        }

        if ctx.is_cancelled() {
            return self.abort_workflow(run, wf, mem::take(steps), last_done.as_deref());
        }

        self.enter(run, RunState::RunChecks, &wf.id);
        steps.push(format!("{}-checks", wf.id));
        let mut failures = Vec::new();
        for guard in &wf.checks {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.checks.run_check(guard)))
                .unwrap_or_else(|_| GuardResult::unavailable(guard, "check runner panicked"));
            self.evidence.append(guard_entry(&wf.id, &result))?;
            if !result.passed() {
                failures.push(format!(
                    "{guard}: {}",
                    preview_items(&result.violations, 3, 120)
                ));
            }
        }
        if !failures.is_empty() {
            let reason = format!("checks failed: {}", failures.join("; "));
            return self.fail_workflow(run, wf, mem::take(steps), reason);
        }

        self.enter(run, RunState::Checkpoint, &wf.id);
        self.checkpoint.complete_workflow(&wf.id)?;
        self.evidence.append(EvidenceEntry {
            subject: wf.id.clone(),
            subject_kind: SubjectKind::Workflow,
            action: "workflow.completed".to_string(),
            verdict: "pass".to_string(),
            actor: "orchestrator".to_string(),
            detail: json!({ "cards": wf.cards, "checks": wf.checks }),
        })?;
        run.journal
            .note("workflow.done", &wf.id, "done", JsonValue::Null);
        Ok(WorkflowRun {
            workflow: wf.id.clone(),
            status: WorkflowStatus::Done,
            reason: None,
            steps: mem::take(steps),
        })
    }

    fn fail_workflow(
        &self,
        run: &Run,
        wf: &WorkflowPlan,
        steps: Vec<String>,
        reason: String,
    ) -> Result<WorkflowRun, PhasegateError> {
        self.checkpoint.fail_workflow(&wf.id, &reason)?;
        self.evidence.append(EvidenceEntry {
            subject: wf.id.clone(),
            subject_kind: SubjectKind::Workflow,
            action: "workflow.failed".to_string(),
            verdict: "fail".to_string(),
            actor: "orchestrator".to_string(),
            detail: json!({ "reason": reason }),
        })?;
        run.journal
            .note("workflow.failed", &wf.id, "failed", json!({ "reason": reason }));
        tracing::warn!(workflow = %wf.id, %reason, "workflow failed");
        Ok(WorkflowRun {
            workflow: wf.id.clone(),
            status: WorkflowStatus::Failed,
            reason: Some(reason),
            steps,
        })
    }

    fn abort_workflow(
        &self,
        run: &Run,
        wf: &WorkflowPlan,
        steps: Vec<String>,
        last_done: Option<&str>,
    ) -> Result<WorkflowRun, PhasegateError> {
        let reason = match last_done {
            Some(card) => format!("aborted after card '{card}'"),
            None => "aborted before any card completed".to_string(),
        };
        self.fail_workflow(run, wf, steps, reason)
    }

    fn unmet_dependency(&self, card: &TaskCard) -> Result<Option<String>, PhasegateError> {
        for dep in &card.dependencies {
            if self.plan.external_ports.contains(dep) {
                continue;
            }
            if self.checkpoint.card_status(dep)? != CardStatus::Done {
                return Ok(Some(dep.clone()));
            }
        }
        Ok(None)
    }

    /// Executor, then acceptance command. Panics are contained to the card.
    fn attempt_card(&self, card: &TaskCard, ctx: &ExecutionContext) -> CardAttempt {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            let outcome = self.executors.dispatch(card, ctx);
            if !outcome.success {
                return CardAttempt::failed(format!("executor: {}", outcome.summary));
            }
            if ctx.is_cancelled() {
                return CardAttempt::failed("cancelled".to_string());
            }
            if card.acceptance_command.trim().is_empty() {
                return CardAttempt::failed("no acceptance command".to_string());
            }
            let env = vec![
                ("PHASEGATE_CARD_ID".to_string(), card.id.clone()),
                ("PHASEGATE_WORKFLOW".to_string(), ctx.workflow.clone()),
            ];
            let acceptance = run_shell(
                &card.acceptance_command,
                &ctx.project_root,
                &env,
                ctx.timeout,
                Some(ctx.cancel.as_ref()),
            );
            if acceptance.succeeded() {
                CardAttempt {
                    success: true,
                    summary: outcome.summary,
                }
            } else {
                CardAttempt::failed(format!("acceptance: {}", acceptance.describe()))
            }
        }));
        attempt.unwrap_or_else(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            CardAttempt::failed(format!("executor panicked: {msg}"))
        })
    }

    /// Current phase gate, evaluated without running any workflow.
    pub fn evaluate_gate(&self) -> Result<GateReport, PhasegateError> {
        let cp = self.checkpoint.snapshot()?;
        let report = GateEvaluator::new(&self.plan, self.checks.as_ref(), &self.settings.gate)
            .evaluate(&cp.phase, &cp.controlled_pending)?;
        if let Some(dir) = &self.settings.reports_dir {
            report.write(dir)?;
        }
        Ok(report)
    }

    pub fn verify_evidence(&self) -> Result<IntegrityReport, PhasegateError> {
        let cp = self.checkpoint.snapshot()?;
        self.evidence.integrity_check(&cp.card_status)
    }

    pub fn dry_run(&self) -> Result<PlanView, PhasegateError> {
        let cp = self.checkpoint.snapshot()?;
        let mut workflows = Vec::new();
        let mut next_wave = Vec::new();
        let mut pending_cards = Vec::new();
        for wf in self.execution.workflows() {
            let state = if cp.is_workflow_done(&wf.id) {
                "done"
            } else if cp.failed_workflows.contains_key(&wf.id) {
                "failed"
            } else if self.execution.is_workflow_blocked(&wf.id) {
                "blocked"
            } else if self.is_ready(wf, &cp) {
                "ready"
            } else {
                "waiting"
            };
            if state == "ready" && wf.phase == cp.phase && !cp.is_phase_complete(&cp.phase) {
                next_wave.push(wf.id.clone());
            }
            let cards: Vec<CardView> = wf
                .cards
                .iter()
                .map(|id| CardView {
                    id: id.clone(),
                    status: cp.card_status(id),
                })
                .collect();
            if matches!(state, "ready" | "waiting") {
                pending_cards.extend(
                    cards
                        .iter()
                        .filter(|c| !c.status.is_terminal())
                        .map(|c| c.id.clone()),
                );
            }
            workflows.push(WorkflowView {
                id: wf.id.clone(),
                phase: wf.phase.clone(),
                state: state.to_string(),
                depends_on: wf.depends_on.iter().cloned().collect(),
                cards,
                checks: wf.checks.clone(),
            });
        }
        Ok(PlanView {
            phase: cp.phase.clone(),
            completed_phases: cp.completed_phases.clone(),
            workflows,
            next_wave,
            pending_cards,
            controlled_pending: cp.controlled_pending.clone(),
            blocked_cards: self.execution.blocked_cards.clone(),
            blocked_workflows: self.execution.blocked_workflows.clone(),
            unknown_dependencies: self.execution.unknown_dependencies.clone(),
            unassigned_cards: self.execution.unassigned_cards.clone(),
        })
    }
}

struct CardAttempt {
    success: bool,
    summary: String,
}

impl CardAttempt {
    fn failed(summary: String) -> Self {
        Self {
            success: false,
            summary,
        }
    }
}

fn guard_entry(scope: &str, result: &GuardResult) -> EvidenceEntry {
    EvidenceEntry {
        subject: result.guard.clone(),
        subject_kind: SubjectKind::Guard,
        action: "guard.checked".to_string(),
        verdict: result.status.as_str().to_string(),
        actor: "guard".to_string(),
        detail: json!({
            "scope": scope,
            "violations": result.violations,
            "count": result.count,
            "exit_code": result.exit_code,
            "duration_ms": result.duration_ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_terminal_state() {
        assert_eq!(Terminal::Done.exit_code(), 0);
        assert_eq!(Terminal::Failed.exit_code(), 1);
        assert_eq!(Terminal::Blocked.exit_code(), 2);
        assert_eq!(Terminal::Blocked.as_str(), "BLOCKED");
    }

    #[test]
    fn settings_never_allow_an_empty_pool() {
        let mut config = Config::default();
        config.orchestrator.max_concurrency = 0;
        let settings = OrchestratorSettings::from_config(&config, Path::new("."));
        assert_eq!(settings.max_concurrency, 1);
    }
}
