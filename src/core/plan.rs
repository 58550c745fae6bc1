//! Plan manifest: phases, workflows, guards, gate criteria and cross-layer nodes.
//!
//! The manifest (`phasegate.toml`) is structural. Problems in it (duplicate ids,
//! references to undeclared phases or guards) are configuration errors and stop
//! the run before anything executes. Missing task cards are not manifest errors;
//! the resolver turns them into blocked work.

use crate::core::error::PhasegateError;
use crate::core::guard::GuardSpec;
use crate::core::taskcard::is_valid_id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDecl {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    pub phase: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub cards: Vec<String>,
    /// Guard names that must pass before the workflow counts as done.
    #[serde(default)]
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCriterion {
    pub id: String,
    pub phase: String,
    pub kind: CriterionKind,
    /// Guard name evaluated for this criterion.
    pub check: String,
    /// Cross-layer node this criterion verifies.
    #[serde(default)]
    pub node: Option<String>,
    /// Phase by whose exit a failing soft criterion must be resolved.
    #[serde(default)]
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossLayerNode {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub layers: Vec<String>,
}

/// A phase with its workflows and criteria resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub id: String,
    pub workflows: Vec<String>,
    pub hard_criteria: Vec<GateCriterion>,
    pub soft_criteria: Vec<GateCriterion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Ids a card may depend on that live outside this plan.
    #[serde(default)]
    pub external_ports: BTreeSet<String>,
    #[serde(default, rename = "phase")]
    pub phases: Vec<PhaseDecl>,
    #[serde(default, rename = "workflow")]
    pub workflows: Vec<Workflow>,
    #[serde(default, rename = "guard")]
    pub guards: Vec<GuardSpec>,
    #[serde(default, rename = "criterion")]
    pub criteria: Vec<GateCriterion>,
    #[serde(default, rename = "node")]
    pub nodes: Vec<CrossLayerNode>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self, PhasegateError> {
        if !path.exists() {
            return Err(PhasegateError::NotFound(format!(
                "plan manifest not found at {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path).map_err(PhasegateError::IoError)?;
        let plan = Self::from_toml(&content).map_err(|e| match e {
            PhasegateError::ValidationError(msg) => {
                PhasegateError::ValidationError(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        Ok(plan)
    }

    pub fn from_toml(content: &str) -> Result<Self, PhasegateError> {
        let plan: Plan = toml::from_str(content)
            .map_err(|e| PhasegateError::ValidationError(format!("invalid plan manifest: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PhasegateError> {
        let mut problems = Vec::new();

        let mut check_ids = |kind: &str, ids: Vec<&str>| {
            let mut seen = BTreeSet::new();
            for id in ids {
                if !is_valid_id(id) {
                    problems.push(format!("{kind} id '{id}' is not a valid identifier"));
                }
                if !seen.insert(id) {
                    problems.push(format!("duplicate {kind} id '{id}'"));
                }
            }
        };
        check_ids("phase", self.phases.iter().map(|p| p.id.as_str()).collect());
        check_ids("workflow", self.workflows.iter().map(|w| w.id.as_str()).collect());
        check_ids("guard", self.guards.iter().map(|g| g.name.as_str()).collect());
        check_ids("criterion", self.criteria.iter().map(|c| c.id.as_str()).collect());
        check_ids("node", self.nodes.iter().map(|n| n.id.as_str()).collect());

        let mut card_owner: BTreeMap<&str, &str> = BTreeMap::new();
        for wf in &self.workflows {
            if self.phase_index(&wf.phase).is_none() {
                problems.push(format!(
                    "workflow '{}' names undeclared phase '{}'",
                    wf.id, wf.phase
                ));
            }
            for check in &wf.checks {
                if self.guard(check).is_none() {
                    problems.push(format!(
                        "workflow '{}' binds undeclared guard '{}'",
                        wf.id, check
                    ));
                }
            }
            for card in &wf.cards {
                if let Some(previous) = card_owner.insert(card, &wf.id) {
                    problems.push(format!(
                        "card '{}' is listed by both '{}' and '{}'",
                        card, previous, wf.id
                    ));
                }
            }
        }

        for crit in &self.criteria {
            if self.phase_index(&crit.phase).is_none() {
                problems.push(format!(
                    "criterion '{}' names undeclared phase '{}'",
                    crit.id, crit.phase
                ));
            }
            if self.guard(&crit.check).is_none() {
                problems.push(format!(
                    "criterion '{}' checks undeclared guard '{}'",
                    crit.id, crit.check
                ));
            }
            if let Some(deadline) = &crit.deadline {
                if crit.kind == CriterionKind::Hard {
                    problems.push(format!(
                        "criterion '{}' is hard; deadlines apply to soft criteria only",
                        crit.id
                    ));
                }
                match (self.phase_index(deadline), self.phase_index(&crit.phase)) {
                    (None, _) => problems.push(format!(
                        "criterion '{}' has undeclared deadline phase '{}'",
                        crit.id, deadline
                    )),
                    (Some(d), Some(p)) if d < p => problems.push(format!(
                        "criterion '{}' deadline '{}' precedes its own phase",
                        crit.id, deadline
                    )),
                    _ => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PhasegateError::ValidationError(problems.join("; ")))
        }
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    pub fn first_phase(&self) -> Option<&str> {
        self.phases.first().map(|p| p.id.as_str())
    }

    pub fn next_phase(&self, id: &str) -> Option<&str> {
        let idx = self.phase_index(id)?;
        self.phases.get(idx + 1).map(|p| p.id.as_str())
    }

    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.id == id)
    }

    pub fn workflows_in<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a Workflow> + 'a {
        self.workflows.iter().filter(move |w| w.phase == phase)
    }

    pub fn guard(&self, name: &str) -> Option<&GuardSpec> {
        self.guards.iter().find(|g| g.name == name)
    }

    /// Deadline phase of a soft criterion: declared, else the next phase, else its own.
    pub fn deadline_for(&self, crit: &GateCriterion) -> String {
        crit.deadline
            .clone()
            .or_else(|| self.next_phase(&crit.phase).map(str::to_string))
            .unwrap_or_else(|| crit.phase.clone())
    }

    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.phase_index(id)?;
        let (hard, soft): (Vec<_>, Vec<_>) = self
            .criteria
            .iter()
            .filter(|c| c.phase == id)
            .cloned()
            .partition(|c| c.kind == CriterionKind::Hard);
        Some(Phase {
            id: id.to_string(),
            workflows: self.workflows_in(id).map(|w| w.id.clone()).collect(),
            hard_criteria: hard,
            soft_criteria: soft,
        })
    }
}
