//! Pure structural validation of journey graphs.
//!
//! Runs at authoring time; nothing that passes here should be able to fail
//! structurally during execution. Catalog existence checks go through the
//! collaborator's `CatalogLookup` rather than an embedded template store.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use waypoint_core::collaborators::CatalogLookup;

use crate::types::{JourneyGraph, NodeKind, Predicate, WaitSpec};

/// A single problem found in a graph. `node_id` is absent for graph-level
/// issues (no entry node, cycles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub node_id: Option<Uuid>,
    pub message: String,
}

impl ValidationIssue {
    fn graph(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            message: message.into(),
        }
    }

    fn node(node_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id),
            message: message.into(),
        }
    }
}

/// Validate a journey graph against the structural rules and the
/// collaborator catalog. Collects all issues instead of stopping at the
/// first one.
pub fn validate(
    graph: &JourneyGraph,
    catalog: &dyn CatalogLookup,
) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if graph.nodes.is_empty() {
        return Err(vec![ValidationIssue::graph("graph has no nodes")]);
    }

    let ids: HashSet<Uuid> = graph.nodes.iter().map(|n| n.id).collect();
    if ids.len() != graph.nodes.len() {
        issues.push(ValidationIssue::graph("duplicate node ids"));
    }

    // Every edge must point at a known node.
    for edge in graph.edges() {
        if !ids.contains(&edge.to) {
            issues.push(ValidationIssue::node(
                edge.from,
                format!("edge targets unknown node {}", edge.to),
            ));
        }
    }

    // Exactly one entry node, reachable from every trigger by definition.
    let entry = match graph.entry_node() {
        Some(entry) => Some(entry.id),
        None => {
            issues.push(ValidationIssue::graph(
                "graph must have exactly one entry node",
            ));
            None
        }
    };

    // Kahn's algorithm: any nodes left over sit on a cycle.
    let mut indegree: HashMap<Uuid, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for edge in graph.edges() {
        if let Some(count) = indegree.get_mut(&edge.to) {
            *count += 1;
        }
    }
    let mut queue: VecDeque<Uuid> = indegree
        .iter()
        .filter(|(_, c)| **c == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for edge in graph.edges().iter().filter(|e| e.from == id) {
            if let Some(count) = indegree.get_mut(&edge.to) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(edge.to);
                }
            }
        }
    }
    if visited != ids.len() {
        issues.push(ValidationIssue::graph("graph contains a cycle"));
    }

    // Reachability from the entry node.
    if let Some(entry) = entry {
        let mut reachable = HashSet::new();
        let mut stack = vec![entry];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            for edge in graph.edges().iter().filter(|e| e.from == id) {
                stack.push(edge.to);
            }
        }
        for node in &graph.nodes {
            if !reachable.contains(&node.id) {
                issues.push(ValidationIssue::node(
                    node.id,
                    "node is unreachable from the entry node",
                ));
            }
        }
    }

    // Per-node config checks.
    for node in &graph.nodes {
        match &node.kind {
            NodeKind::SendMessage(config) => {
                if config.template_id.is_empty() {
                    issues.push(ValidationIssue::node(node.id, "template_id must not be empty"));
                } else if !catalog.template_exists(&config.template_id) {
                    issues.push(ValidationIssue::node(
                        node.id,
                        format!("unknown template '{}'", config.template_id),
                    ));
                }
            }
            NodeKind::CollectForm(config) => {
                if config.form_id.is_empty() {
                    issues.push(ValidationIssue::node(node.id, "form_id must not be empty"));
                } else if !catalog.form_exists(&config.form_id) {
                    issues.push(ValidationIssue::node(
                        node.id,
                        format!("unknown form '{}'", config.form_id),
                    ));
                }
                if config.resume_event.is_empty() {
                    issues.push(ValidationIssue::node(node.id, "resume_event must not be empty"));
                }
            }
            NodeKind::Wait(spec) => {
                if let WaitSpec::Duration { secs: 0 } = spec {
                    issues.push(ValidationIssue::node(node.id, "wait duration must be positive"));
                }
            }
            NodeKind::Branch(branch) => {
                if node.next.is_some() {
                    issues.push(ValidationIssue::node(
                        node.id,
                        "branch nodes route via arms, not a linear successor",
                    ));
                }
                if branch.arms.is_empty() && branch.default_target.is_none() {
                    issues.push(ValidationIssue::node(node.id, "branch has no outgoing edges"));
                }
                let exhaustive = branch.default_target.is_some()
                    || branch
                        .arms
                        .iter()
                        .any(|arm| matches!(arm.predicate, Predicate::Always));
                if !exhaustive {
                    issues.push(ValidationIssue::node(
                        node.id,
                        "branch needs a default edge or an 'always' arm",
                    ));
                }
            }
            NodeKind::ExternalAction(config) => {
                if config.action.is_empty() {
                    issues.push(ValidationIssue::node(node.id, "action must not be empty"));
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
