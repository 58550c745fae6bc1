//! Dependency Resolver.
//!
//! Builds one graph over cards, workflows and phases and derives the
//! deterministic execution order. Edges point from a node to what it depends on:
//!
//! - card -> dependency card
//! - workflow -> dependency workflow (declared, or implied by a cross-workflow card dependency)
//! - workflow -> each of its cards
//! - phase -> each of its workflows
//! - workflow -> previous phase, phase -> previous phase
//!
//! A cycle anywhere is fatal. Unknown references are not: they block the
//! referencing card or workflow and everything downstream of it.

use crate::core::error::PhasegateError;
use crate::core::plan::Plan;
use crate::core::taskcard::CardStore;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Card(String),
    Workflow(String),
    Phase(String),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Card(id) => write!(f, "card:{id}"),
            NodeRef::Workflow(id) => write!(f, "workflow:{id}"),
            NodeRef::Phase(id) => write!(f, "phase:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnknownDependency {
    pub from: String,
    pub missing: String,
}

impl From<UnknownDependency> for PhasegateError {
    fn from(dep: UnknownDependency) -> Self {
        PhasegateError::UnknownDependency {
            from: dep.from,
            missing: dep.missing,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkflowPlan {
    pub id: String,
    pub phase: String,
    /// Declared dependencies plus those implied by cross-workflow card dependencies.
    pub depends_on: BTreeSet<String>,
    /// Cards in execution order. Only cards present in the card store.
    pub cards: Vec<String>,
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhasePlan {
    pub phase: String,
    pub workflows: Vec<WorkflowPlan>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub phases: Vec<PhasePlan>,
    /// Cards excluded from scheduling, with reasons.
    pub blocked_cards: BTreeMap<String, Vec<String>>,
    /// Workflows that cannot complete, with reasons.
    pub blocked_workflows: BTreeMap<String, Vec<String>>,
    pub unknown_dependencies: Vec<UnknownDependency>,
    /// Cards in the store that no workflow lists.
    pub unassigned_cards: Vec<String>,
}

impl ExecutionPlan {
    pub fn phase(&self, id: &str) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.phase == id)
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowPlan> {
        self.workflows().find(|w| w.id == id)
    }

    /// Every workflow, phase by phase, in execution order.
    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowPlan> {
        self.phases.iter().flat_map(|p| p.workflows.iter())
    }

    /// Every scheduled card in execution order.
    pub fn card_order(&self) -> Vec<String> {
        self.workflows().flat_map(|w| w.cards.iter().cloned()).collect()
    }

    pub fn is_card_blocked(&self, id: &str) -> bool {
        self.blocked_cards.contains_key(id)
    }

    pub fn is_workflow_blocked(&self, id: &str) -> bool {
        self.blocked_workflows.contains_key(id)
    }
}

#[derive(Default)]
struct Graph {
    deps: FxHashMap<NodeRef, BTreeSet<NodeRef>>,
}

impl Graph {
    fn add_node(&mut self, node: NodeRef) {
        self.deps.entry(node).or_default();
    }

    fn add_edge(&mut self, from: NodeRef, to: NodeRef) {
        self.deps.entry(to.clone()).or_default();
        self.deps.entry(from).or_default().insert(to);
    }

    /// Kahn's algorithm with a sorted ready set. Returns the order, or the
    /// nodes that could not be ordered.
    fn toposort(&self) -> Result<Vec<NodeRef>, BTreeSet<NodeRef>> {
        let mut remaining: FxHashMap<&NodeRef, usize> =
            self.deps.iter().map(|(n, d)| (n, d.len())).collect();
        let mut dependents: FxHashMap<&NodeRef, Vec<&NodeRef>> = FxHashMap::default();
        for (node, deps) in &self.deps {
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: BTreeSet<&NodeRef> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.deps.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.clone());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            Err(remaining.keys().map(|n| (*n).clone()).collect())
        }
    }

    /// Walk unresolved dependencies from the smallest stuck node until a node
    /// repeats. Every stuck node has at least one stuck dependency, so the
    /// walk always closes a cycle.
    fn find_cycle(&self, stuck: &BTreeSet<NodeRef>) -> Vec<NodeRef> {
        let Some(start) = stuck.first() else {
            return Vec::new();
        };
        let mut path: Vec<NodeRef> = Vec::new();
        let mut position: FxHashMap<NodeRef, usize> = FxHashMap::default();
        let mut current = start.clone();
        loop {
            if let Some(&at) = position.get(&current) {
                let mut cycle = path[at..].to_vec();
                cycle.push(current);
                return cycle;
            }
            position.insert(current.clone(), path.len());
            path.push(current.clone());
            let next = self
                .deps
                .get(&current)
                .and_then(|deps| deps.iter().find(|d| stuck.contains(*d)));
            match next {
                Some(next) => current = next.clone(),
                None => return path,
            }
        }
    }
}

/// Order `items` so each comes after its dependencies, ties broken by id.
/// Dependencies outside `items` are treated as already satisfied.
fn stable_order(items: &[String], deps_of: impl Fn(&str) -> Vec<String>) -> Vec<String> {
    let members: FxHashSet<&str> = items.iter().map(String::as_str).collect();
    let mut pending: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for item in items {
        let inner: Vec<String> = deps_of(item)
            .into_iter()
            .filter(|d| members.contains(d.as_str()) && d != item)
            .collect();
        pending.insert(item.clone(), inner.len());
        for dep in inner {
            dependents.entry(dep).or_default().push(item.clone());
        }
    }
    let mut ready: BTreeSet<String> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(items.len());
    while let Some(id) = ready.pop_first() {
        pending.remove(&id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent.clone());
                }
            }
        }
        order.push(id);
    }
    order
}

fn push_reason(map: &mut BTreeMap<String, Vec<String>>, id: &str, reason: String) {
    let reasons = map.entry(id.to_string()).or_default();
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

/// Resolve the plan into a deterministic execution order.
pub fn resolve(plan: &Plan, cards: &CardStore) -> Result<ExecutionPlan, PhasegateError> {
    let mut graph = Graph::default();
    let mut result = ExecutionPlan::default();

    // card id -> owning workflow, for cards that exist in the store
    let mut owner: FxHashMap<&str, &str> = FxHashMap::default();
    for wf in &plan.workflows {
        for card in &wf.cards {
            if cards.contains(card) {
                owner.insert(card.as_str(), wf.id.as_str());
            } else {
                result.unknown_dependencies.push(UnknownDependency {
                    from: wf.id.clone(),
                    missing: card.clone(),
                });
                push_reason(
                    &mut result.blocked_workflows,
                    &wf.id,
                    format!("card '{card}' has no task card document"),
                );
            }
        }
    }
    result.unassigned_cards = cards
        .iter()
        .map(|v| v.card.id.clone())
        .filter(|id| !owner.contains_key(id.as_str()))
        .collect();

    for (idx, phase) in plan.phases.iter().enumerate() {
        graph.add_node(NodeRef::Phase(phase.id.clone()));
        if idx > 0 {
            graph.add_edge(
                NodeRef::Phase(phase.id.clone()),
                NodeRef::Phase(plan.phases[idx - 1].id.clone()),
            );
        }
    }

    let mut effective_deps: FxHashMap<&str, BTreeSet<String>> = FxHashMap::default();
    for wf in &plan.workflows {
        let wf_node = NodeRef::Workflow(wf.id.clone());
        graph.add_node(wf_node.clone());
        graph.add_edge(NodeRef::Phase(wf.phase.clone()), wf_node.clone());
        if let Some(idx) = plan.phase_index(&wf.phase) {
            if idx > 0 {
                graph.add_edge(
                    wf_node.clone(),
                    NodeRef::Phase(plan.phases[idx - 1].id.clone()),
                );
            }
        }

        let deps = effective_deps.entry(wf.id.as_str()).or_default();
        for dep in &wf.depends_on {
            if plan.workflow(dep).is_some() {
                graph.add_edge(wf_node.clone(), NodeRef::Workflow(dep.clone()));
                deps.insert(dep.clone());
            } else {
                result.unknown_dependencies.push(UnknownDependency {
                    from: wf.id.clone(),
                    missing: dep.clone(),
                });
                push_reason(
                    &mut result.blocked_workflows,
                    &wf.id,
                    format!("depends on unknown workflow '{dep}'"),
                );
            }
        }

        for card_id in wf.cards.iter().filter(|c| owner.contains_key(c.as_str())) {
            let card_node = NodeRef::Card(card_id.clone());
            graph.add_edge(wf_node.clone(), card_node.clone());
            let Some(card) = cards.card(card_id) else {
                continue;
            };
            for dep in &card.dependencies {
                if let Some(dep_owner) = owner.get(dep.as_str()) {
                    graph.add_edge(card_node.clone(), NodeRef::Card(dep.clone()));
                    if *dep_owner != wf.id {
                        graph.add_edge(wf_node.clone(), NodeRef::Workflow(dep_owner.to_string()));
                        deps.insert(dep_owner.to_string());
                    }
                } else if plan.external_ports.contains(dep) {
                    // satisfied outside this plan
                } else {
                    let missing = UnknownDependency {
                        from: card_id.clone(),
                        missing: dep.clone(),
                    };
                    let reason = if cards.contains(dep) {
                        format!("depends on '{dep}', which no workflow schedules")
                    } else {
                        PhasegateError::from(missing.clone()).to_string()
                    };
                    result.unknown_dependencies.push(missing);
                    push_reason(&mut result.blocked_cards, card_id, reason);
                }
            }
        }
    }

    let order = match graph.toposort() {
        Ok(order) => order,
        Err(stuck) => {
            let cycle = graph.find_cycle(&stuck);
            return Err(PhasegateError::CycleDetected {
                cycle: cycle.iter().map(ToString::to_string).collect(),
            });
        }
    };

    for validated in cards.iter() {
        let blocking = validated.blocking_count();
        if blocking > 0 && owner.contains_key(validated.card.id.as_str()) {
            push_reason(
                &mut result.blocked_cards,
                &validated.card.id,
                PhasegateError::SchemaViolation {
                    card: validated.card.id.clone(),
                    blocking,
                }
                .to_string(),
            );
        }
    }

    // Propagate blocks downstream, in dependency order.
    for node in &order {
        if let NodeRef::Card(id) = node {
            let Some(card) = cards.card(id) else { continue };
            let blocked_deps: Vec<String> = card
                .dependencies
                .iter()
                .filter(|d| result.blocked_cards.contains_key(d.as_str()))
                .cloned()
                .collect();
            for dep in blocked_deps {
                push_reason(
                    &mut result.blocked_cards,
                    id,
                    format!("dependency '{dep}' is blocked"),
                );
            }
        }
    }

    for phase in &plan.phases {
        let ids: Vec<String> = plan.workflows_in(&phase.id).map(|w| w.id.clone()).collect();
        let ordered = stable_order(&ids, |id| {
            effective_deps
                .get(id)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default()
        });
        let mut workflows = Vec::with_capacity(ordered.len());
        for id in ordered {
            let Some(wf) = plan.workflow(&id) else { continue };
            let listed: Vec<String> = wf
                .cards
                .iter()
                .filter(|c| owner.contains_key(c.as_str()))
                .cloned()
                .collect();
            let card_order = stable_order(&listed, |card| {
                cards
                    .card(card)
                    .map(|c| c.dependencies.iter().cloned().collect())
                    .unwrap_or_default()
            });
            workflows.push(WorkflowPlan {
                id: wf.id.clone(),
                phase: wf.phase.clone(),
                depends_on: effective_deps.get(wf.id.as_str()).cloned().unwrap_or_default(),
                cards: card_order,
                checks: wf.checks.clone(),
            });
        }
        result.phases.push(PhasePlan {
            phase: phase.id.clone(),
            workflows,
        });
    }

    // A workflow is blocked by its own blocked cards and by blocked upstream workflows.
    let flattened: Vec<(String, Vec<String>, BTreeSet<String>)> = result
        .workflows()
        .map(|w| (w.id.clone(), w.cards.clone(), w.depends_on.clone()))
        .collect();
    for (id, wf_cards, depends_on) in flattened {
        for card in wf_cards.iter().filter(|c| result.blocked_cards.contains_key(*c)) {
            push_reason(
                &mut result.blocked_workflows,
                &id,
                format!("card '{card}' is blocked"),
            );
        }
        for dep in depends_on {
            if result.blocked_workflows.contains_key(&dep) {
                push_reason(
                    &mut result.blocked_workflows,
                    &id,
                    format!("upstream workflow '{dep}' is blocked"),
                );
            }
        }
    }

    result.unknown_dependencies.sort();
    result.unknown_dependencies.dedup();
    Ok(result)
}
