//! Gate Evaluator.
//!
//! Pure with respect to the run: it only asks a [`CheckRunner`] for results and
//! folds them into a [`GateReport`]. Hard criteria decide the verdict; soft
//! failures are carried forward as controlled-pending items until their
//! deadline phase.

use crate::core::config::{EscalationPolicy, GateConfig};
use crate::core::error::PhasegateError;
use crate::core::guard::{CheckRunner, GuardResult};
use crate::core::output::preview_items;
use crate::core::plan::{GateCriterion, Plan};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A failing soft criterion awaiting resolution by its deadline phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlledPending {
    pub criterion: String,
    /// Phase whose gate first recorded the failure.
    pub phase: String,
    pub check: String,
    pub deadline: String,
    pub violations: Vec<String>,
    pub since: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BlockingKind {
    HardCriterion,
    OverdueSoftItem,
    UnboundNode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockingItem {
    pub kind: BlockingKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tally {
    pub pass: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateReport {
    pub phase: String,
    pub go_no_go: bool,
    pub hard: Tally,
    pub soft: Tally,
    pub blocking_items: Vec<BlockingItem>,
    pub unbound_nodes: Vec<String>,
    /// Still-unresolved soft items, carried into the next phase.
    pub controlled_pending: Vec<ControlledPending>,
    /// Criterion ids of pending items past their deadline.
    pub overdue: Vec<String>,
    /// `criterion -> node` pairs naming nodes the plan does not declare.
    pub dangling_node_refs: Vec<String>,
    /// Criterion ids of carried items that now pass.
    pub resolved: Vec<String>,
    pub guard_results: Vec<GuardResult>,
    pub evaluated_at: String,
}

impl GateReport {
    pub fn report_path(reports_dir: &Path, phase: &str) -> PathBuf {
        reports_dir.join(format!("{phase}.gate.json"))
    }

    pub fn write(&self, reports_dir: &Path) -> Result<PathBuf, PhasegateError> {
        fs::create_dir_all(reports_dir).map_err(PhasegateError::IoError)?;
        let path = Self::report_path(reports_dir, &self.phase);
        fs::write(&path, serde_json::to_vec_pretty(self)?).map_err(PhasegateError::IoError)?;
        Ok(path)
    }

    pub fn blocking_summary(&self) -> Vec<String> {
        self.blocking_items
            .iter()
            .map(|b| format!("{}: {}", b.id, b.reason))
            .collect()
    }
}

pub struct GateEvaluator<'a> {
    plan: &'a Plan,
    runner: &'a dyn CheckRunner,
    config: &'a GateConfig,
}

impl<'a> GateEvaluator<'a> {
    pub fn new(plan: &'a Plan, runner: &'a dyn CheckRunner, config: &'a GateConfig) -> Self {
        Self {
            plan,
            runner,
            config,
        }
    }

    /// Evaluate the exit gate of `phase_id`, re-checking items carried from earlier phases.
    pub fn evaluate(
        &self,
        phase_id: &str,
        carried: &[ControlledPending],
    ) -> Result<GateReport, PhasegateError> {
        let phase = self
            .plan
            .phase(phase_id)
            .ok_or_else(|| PhasegateError::NotFound(format!("phase '{phase_id}'")))?;
        let phase_idx = self.plan.phase_index(phase_id).unwrap_or(0);
        let now = time::now_epoch_z();

        let mut guard_results = Vec::new();
        let mut blocking_items = Vec::new();
        let mut pending = Vec::new();
        let mut resolved = Vec::new();

        let mut hard = Tally {
            pass: 0,
            total: phase.hard_criteria.len(),
        };
        for crit in &phase.hard_criteria {
            let result = self.runner.run_check(&crit.check);
            if result.passed() {
                hard.pass += 1;
            } else {
                blocking_items.push(BlockingItem {
                    kind: BlockingKind::HardCriterion,
                    id: crit.id.clone(),
                    reason: failure_reason(crit, &result),
                });
            }
            guard_results.push(result);
        }

        let mut soft = Tally {
            pass: 0,
            total: phase.soft_criteria.len(),
        };
        let evaluated_here: BTreeSet<&str> =
            phase.soft_criteria.iter().map(|c| c.id.as_str()).collect();
        for crit in &phase.soft_criteria {
            let result = self.runner.run_check(&crit.check);
            if result.passed() {
                soft.pass += 1;
            } else {
                let since = carried
                    .iter()
                    .find(|c| c.criterion == crit.id)
                    .map(|c| c.since.clone())
                    .unwrap_or_else(|| now.clone());
                pending.push(ControlledPending {
                    criterion: crit.id.clone(),
                    phase: crit.phase.clone(),
                    check: crit.check.clone(),
                    deadline: self.plan.deadline_for(crit),
                    violations: result.violations.clone(),
                    since,
                });
            }
            guard_results.push(result);
        }

        for item in carried {
            if evaluated_here.contains(item.criterion.as_str()) {
                continue;
            }
            let result = self.runner.run_check(&item.check);
            if result.passed() {
                resolved.push(item.criterion.clone());
            } else {
                pending.push(ControlledPending {
                    violations: result.violations.clone(),
                    ..item.clone()
                });
            }
            guard_results.push(result);
        }

        let mut overdue = Vec::new();
        for item in &pending {
            let past_deadline = self
                .plan
                .phase_index(&item.deadline)
                .is_none_or(|d| d <= phase_idx);
            if !past_deadline {
                continue;
            }
            overdue.push(item.criterion.clone());
            if self.config.escalation == EscalationPolicy::HardBlock {
                blocking_items.push(BlockingItem {
                    kind: BlockingKind::OverdueSoftItem,
                    id: item.criterion.clone(),
                    reason: format!(
                        "soft item from phase '{}' unresolved past deadline '{}'",
                        item.phase, item.deadline
                    ),
                });
            }
        }

        let (unbound_nodes, dangling_node_refs) = node_bindings(self.plan);
        if self.config.unbound_nodes_block {
            for node in &unbound_nodes {
                blocking_items.push(BlockingItem {
                    kind: BlockingKind::UnboundNode,
                    id: node.clone(),
                    reason: "no criterion verifies this cross-layer node".to_string(),
                });
            }
        }

        tracing::debug!(
            phase = phase_id,
            hard_pass = hard.pass,
            hard_total = hard.total,
            pending = pending.len(),
            blocking = blocking_items.len(),
            "gate evaluated"
        );

        Ok(GateReport {
            phase: phase_id.to_string(),
            go_no_go: blocking_items.is_empty(),
            hard,
            soft,
            blocking_items,
            unbound_nodes,
            controlled_pending: pending,
            overdue,
            dangling_node_refs,
            resolved,
            guard_results,
            evaluated_at: now,
        })
    }
}

fn failure_reason(crit: &GateCriterion, result: &GuardResult) -> String {
    let detail = preview_items(&result.violations, 3, 120);
    if detail.is_empty() {
        format!("check '{}' failed", crit.check)
    } else {
        format!("check '{}' failed: {}", crit.check, detail)
    }
}

/// Declared nodes nobody references, and references to nodes nobody declared.
pub fn node_bindings(plan: &Plan) -> (Vec<String>, Vec<String>) {
    let declared: BTreeSet<&str> = plan.nodes.iter().map(|n| n.id.as_str()).collect();
    let referenced: BTreeSet<&str> = plan
        .criteria
        .iter()
        .filter_map(|c| c.node.as_deref())
        .collect();

    let unbound = plan
        .nodes
        .iter()
        .filter(|n| !referenced.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();
    let dangling = plan
        .criteria
        .iter()
        .filter_map(|c| {
            let node = c.node.as_deref()?;
            (!declared.contains(node)).then(|| format!("{} -> {}", c.id, node))
        })
        .collect();
    (unbound, dangling)
}
