//! Task executors, keyed by card capability.
//!
//! An executor does the real work behind a card and reports success or
//! failure. The orchestrator never trusts that report alone: the card's
//! acceptance command still has to pass before the card is done.

use crate::core::config::{Config, ExecutorConfig};
use crate::core::guard::{ProcessOutcome, run_bounded};
use crate::core::output::compact_line;
use crate::core::taskcard::TaskCard;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Per-dispatch context. `cancel` is shared by every unit of one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub project_root: PathBuf,
    pub workflow: String,
    pub cancel: Arc<AtomicBool>,
    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub summary: String,
}

impl ExecutionOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

pub trait TaskExecutor: Send + Sync {
    fn execute(&self, card: &TaskCard, ctx: &ExecutionContext) -> ExecutionOutcome;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandExecutor`] per `[executors.<capability>]` table.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (capability, exec) in &config.executors {
            registry.register(capability, Arc::new(CommandExecutor::new(exec.clone())));
        }
        registry
    }

    pub fn register(&mut self, capability: &str, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(capability.to_string(), executor);
    }

    /// Route a card to its capability. No registered executor is a failure.
    pub fn dispatch(&self, card: &TaskCard, ctx: &ExecutionContext) -> ExecutionOutcome {
        match self.executors.get(&card.capability) {
            Some(exec) => exec.execute(card, ctx),
            None => ExecutionOutcome::failed(format!(
                "no executor registered for capability '{}'",
                card.capability
            )),
        }
    }
}

/// Runs a configured command for each card. The card is described through
/// `PHASEGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, card: &TaskCard, ctx: &ExecutionContext) -> ExecutionOutcome {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .current_dir(&ctx.project_root)
            .env("PHASEGATE_CARD_ID", &card.id)
            .env("PHASEGATE_CARD_GOAL", &card.goal)
            .env("PHASEGATE_CARD_CAPABILITY", &card.capability)
            .env("PHASEGATE_WORKFLOW", &ctx.workflow);
        if let Some(source) = &card.source {
            cmd.env("PHASEGATE_CARD_SOURCE", source);
        }
        let timeout = self
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(ctx.timeout);

        let outcome = run_bounded(cmd, timeout, Some(ctx.cancel.as_ref()));
        match &outcome {
            ProcessOutcome::Exited {
                code: Some(0),
                stdout,
                ..
            } => {
                let text = String::from_utf8_lossy(stdout);
                let last = text.lines().rev().find(|l| !l.trim().is_empty());
                ExecutionOutcome::ok(compact_line(last.unwrap_or("executor exited 0"), 200))
            }
            other => ExecutionOutcome::failed(other.describe()),
        }
    }
}
