//! Phasegate: a phase-gated build-and-audit control plane.
//!
//! A project declares **task cards** (one TOML document each under `cards/`)
//! and a **plan manifest** (`phasegate.toml`) grouping cards into workflows,
//! workflows into phases, and binding each phase to hard and soft gate
//! criteria backed by external guard commands.
//!
//! # Execution model
//!
//! - The resolver orders cards, workflows and phases deterministically and
//!   refuses cycles.
//! - The orchestrator runs ready workflows on a bounded pool, dispatching each
//!   card to the executor registered for its capability and then running its
//!   acceptance command.
//! - Every step is persisted to `.phasegate/checkpoint.json` before the next
//!   one starts, so `phasegate resume` never repeats finished work.
//! - At phase exit the gate evaluator turns guard results into a go/no-go
//!   verdict. Soft failures are carried forward with a deadline.
//! - Every completed card, guard run and gate verdict lands in the hash-chained
//!   evidence ledger (`.phasegate/evidence.events.jsonl`).
//!
//! # Guard contract
//!
//! A guard is any command printing `{"status": "pass"|"fail", "violations": [...], "count": N}`.
//! It passes only on exit 0 with a well-formed, self-consistent pass payload.
//!
//! # Examples
//!
//! ```bash
//! phasegate validate          # card schema findings
//! phasegate dry-run           # execution order, nothing runs
//! phasegate resume            # run until DONE, BLOCKED or FAILED
//! phasegate run W3            # one workflow
//! phasegate gate --format json
//! phasegate evidence verify
//! ```
//!
//! Exit codes: 0 DONE, 1 FAILED, 2 BLOCKED, 3 fatal (cycle, corrupt
//! checkpoint, configuration).

pub mod core;

mod cli;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use serde_json::json;

use crate::cli::{Cli, Command, EvidenceCommand, OutputFormat};
use crate::core::checkpoint::archive_checkpoint;
use crate::core::config::Config;
use crate::core::evidence::archive_damaged_ledger;
use crate::core::gate::GateReport;
use crate::core::orchestrator::{Orchestrator, PlanView, RunReport, WorkflowStatus};
use crate::core::output::{preview_items, progress_bar, state_label};
use crate::core::plan::Plan;
use crate::core::resolver;
use crate::core::store::{Store, find_project_root};
use crate::core::taskcard::{CardStore, Severity};
use crate::core::time::command_envelope;

use std::path::PathBuf;

/// Environment variable holding the `tracing` filter directive.
pub const LOG_ENV: &str = "PHASEGATE_LOG";
pub const EXIT_FATAL: i32 = 3;

const DEFAULT_MANIFEST: &str = "phasegate.toml";

fn project_root(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => {
            let cwd = std::env::current_dir()?;
            Ok(find_project_root(&cwd, DEFAULT_MANIFEST)?)
        }
    }
}

fn emit_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse arguments, execute one command and return the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let root = project_root(cli.dir)?;
    let store = Store::new(&root);
    let config = Config::load(&store.config_path()).context("loading .phasegate/config.toml")?;
    let json_out = cli.format == OutputFormat::Json;
    tracing::debug!(root = %root.display(), "project resolved");

    match cli.command {
        Command::Reset => {
            let archived = archive_checkpoint(&store.checkpoint_path(), &store.archive_dir())?;
            let ledger = archive_damaged_ledger(&store.evidence_path(), &store.archive_dir())?;
            if json_out {
                emit_json(&command_envelope(
                    "reset",
                    "ok",
                    json!({
                        "archived": archived.as_ref().map(|p| p.display().to_string()),
                        "archived_ledger": ledger.as_ref().map(|p| p.display().to_string()),
                    }),
                ))?;
            } else {
                match archived {
                    Some(path) => println!(
                        "{} checkpoint archived to {}",
                        "▸".bright_yellow(),
                        path.display()
                    ),
                    None => println!("{} no checkpoint to reset", "▸".dimmed()),
                }
                if let Some(path) = ledger {
                    println!(
                        "{} unreadable evidence ledger archived to {}",
                        "▸".bright_yellow(),
                        path.display()
                    );
                }
            }
            Ok(0)
        }
        Command::Validate => {
            let plan = Plan::load(&root.join(&config.orchestrator.plan))?;
            let cards = CardStore::load_dir(&root.join(&config.orchestrator.cards_dir))?;
            let execution = resolver::resolve(&plan, &cards)?;
            let counts = cards.severity_counts();
            let blocks = counts.get(&Severity::Block).copied().unwrap_or(0);
            if json_out {
                emit_json(&command_envelope(
                    "validate",
                    if blocks == 0 { "ok" } else { "blocked" },
                    json!({
                        "cards": cards.len(),
                        "findings": cards.findings(),
                        "counts": {
                            "block": blocks,
                            "warning": counts.get(&Severity::Warning).copied().unwrap_or(0),
                            "info": counts.get(&Severity::Info).copied().unwrap_or(0),
                        },
                        "blocked_cards": execution.blocked_cards,
                        "unassigned_cards": execution.unassigned_cards,
                    }),
                ))?;
            } else {
                print_validation(&cards, &execution);
            }
            Ok(if blocks == 0 { 0 } else { 2 })
        }
        command => {
            let orchestrator = Orchestrator::from_project(&store, &config)?;
            dispatch(&orchestrator, command, json_out)
        }
    }
}

fn dispatch(orch: &Orchestrator, command: Command, json_out: bool) -> anyhow::Result<i32> {
    match command {
        Command::Status | Command::DryRun => {
            let dry_run = matches!(command, Command::DryRun);
            let view = orch.dry_run()?;
            if json_out {
                let cmd = if dry_run { "dry-run" } else { "status" };
                emit_json(&command_envelope(cmd, "ok", serde_json::to_value(&view)?))?;
            } else if dry_run {
                print_dry_run(&view);
            } else {
                print_status(&view);
            }
            Ok(0)
        }
        Command::Resume => {
            let report = orch.resume()?;
            finish_run("resume", &report, json_out)
        }
        Command::Run { workflow } => {
            let report = orch
                .run_workflow(&workflow)
                .with_context(|| format!("running workflow '{workflow}'"))?;
            finish_run("run", &report, json_out)
        }
        Command::Gate => {
            let report = orch.evaluate_gate()?;
            if json_out {
                emit_json(&command_envelope(
                    "gate",
                    if report.go_no_go { "go" } else { "no-go" },
                    serde_json::to_value(&report)?,
                ))?;
            } else {
                print_gate(&report);
            }
            Ok(if report.go_no_go { 0 } else { 2 })
        }
        Command::Evidence(evidence) => match evidence.command {
            EvidenceCommand::Verify => {
                let report = orch.verify_evidence()?;
                if let (false, Some(fragment)) = (json_out, &report.repaired_tail) {
                    println!("{} torn trailing record moved to {}", "▸".bright_yellow(), fragment);
                }
                if json_out {
                    emit_json(&command_envelope(
                        "evidence.verify",
                        if report.ok() { "ok" } else { "violations" },
                        serde_json::to_value(&report)?,
                    ))?;
                } else if report.ok() {
                    println!(
                        "{} {} record(s), {} done card(s) evidenced",
                        state_label("pass"),
                        report.records,
                        report.done_cards
                    );
                } else {
                    println!("{}", state_label("fail"));
                    for v in report.violations() {
                        println!("  {} {}", "✗".red(), v);
                    }
                }
                Ok(if report.ok() { 0 } else { 1 })
            }
        },
        Command::Validate | Command::Reset => {
            anyhow::bail!("command does not need an orchestrator")
        }
    }
}

fn finish_run(cmd: &str, report: &RunReport, json_out: bool) -> anyhow::Result<i32> {
    if json_out {
        emit_json(&command_envelope(
            cmd,
            report.terminal.as_str(),
            serde_json::to_value(report)?,
        ))?;
    } else {
        print_run(report);
    }
    Ok(report.terminal.exit_code())
}

fn print_validation(cards: &CardStore, execution: &resolver::ExecutionPlan) {
    for validated in cards.iter() {
        let blocking = validated.blocking_count();
        let label = if blocking == 0 { "pass" } else { "blocked" };
        println!("{} {}", state_label(label), validated.card.id.bright_white());
        for f in &validated.findings {
            let sev = match f.severity {
                Severity::Block => "BLOCK".red().bold(),
                Severity::Warning => "WARNING".yellow(),
                Severity::Info => "INFO".dimmed(),
            };
            println!("    {} {}: {}", sev, f.field, f.message);
        }
    }
    for card in &execution.unassigned_cards {
        println!("{} card '{}' is not listed by any workflow", "▸".dimmed(), card);
    }
    let counts = cards.severity_counts();
    println!(
        "\n{} card(s): {} block, {} warning, {} info",
        cards.len(),
        counts.get(&Severity::Block).copied().unwrap_or(0),
        counts.get(&Severity::Warning).copied().unwrap_or(0),
        counts.get(&Severity::Info).copied().unwrap_or(0)
    );
}

fn print_status(view: &PlanView) {
    let done = view.workflows.iter().filter(|w| w.state == "done").count();
    println!(
        "{} {}  {}",
        "phase".bold(),
        view.phase.bright_white(),
        progress_bar(done, view.workflows.len(), 20)
    );
    for wf in &view.workflows {
        let cards_done = wf.cards.iter().filter(|c| c.status.as_str() == "done").count();
        println!(
            "  {:<12} {:<8} {} cards {}/{}",
            state_label(&wf.state),
            wf.id,
            wf.phase.dimmed(),
            cards_done,
            wf.cards.len()
        );
    }
    if !view.controlled_pending.is_empty() {
        println!("{}", "controlled pending".bold());
        for item in &view.controlled_pending {
            println!(
                "  {} from {} due by {}",
                item.criterion, item.phase, item.deadline
            );
        }
    }
}

fn print_dry_run(view: &PlanView) {
    println!("{} {}", "phase".bold(), view.phase.bright_white());
    for (idx, wf) in view.workflows.iter().enumerate() {
        let cards: Vec<String> = wf.cards.iter().map(|c| c.id.clone()).collect();
        println!(
            "  {:>3}. {:<8} {:<12} [{}]",
            idx + 1,
            wf.id,
            state_label(&wf.state),
            cards.join(", ")
        );
    }
    println!("next wave: {}", view.next_wave.join(", "));
    println!("pending cards: {}", preview_items(&view.pending_cards, 20, 40));
    for (card, reasons) in &view.blocked_cards {
        println!("  {} {}: {}", state_label("blocked"), card, reasons.join("; "));
    }
}

fn print_gate(report: &GateReport) {
    let verdict = if report.go_no_go { "go" } else { "no-go" };
    println!(
        "{} {}  hard {}/{}  soft {}/{}",
        report.phase.bright_white(),
        state_label(verdict),
        report.hard.pass,
        report.hard.total,
        report.soft.pass,
        report.soft.total
    );
    for item in &report.blocking_items {
        println!("  {} {}: {}", "✗".red(), item.id, item.reason);
    }
    for item in &report.controlled_pending {
        let overdue = report.overdue.contains(&item.criterion);
        println!(
            "  {} {} due by {}{}",
            "~".yellow(),
            item.criterion,
            item.deadline,
            if overdue { " (OVERDUE)" } else { "" }
        );
    }
    if !report.unbound_nodes.is_empty() {
        println!("  unbound nodes: {}", report.unbound_nodes.join(", "));
    }
    if !report.dangling_node_refs.is_empty() {
        println!("  dangling node refs: {}", report.dangling_node_refs.join(", "));
    }
}

fn print_run(report: &RunReport) {
    println!("run {}", report.run_id.dimmed());
    for phase in &report.phases {
        println!(
            "{} {}",
            phase.phase.bright_white(),
            state_label(&phase.terminal.as_str().to_ascii_lowercase())
        );
        for wf in &phase.workflows {
            let label = match wf.status {
                WorkflowStatus::Done => "done",
                WorkflowStatus::Failed => "failed",
                WorkflowStatus::Blocked => "blocked",
            };
            println!(
                "  {:<12} {} {}",
                state_label(label),
                wf.workflow,
                wf.steps.join(" → ").dimmed()
            );
        }
    }
    for reason in &report.reasons {
        println!("  {} {}", "▸".bright_yellow(), reason);
    }
    println!("{}", state_label(&report.terminal.as_str().to_ascii_lowercase()));
}
