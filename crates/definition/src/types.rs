use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A versioned journey definition describing a multi-step automated flow.
///
/// A version is immutable once any live execution references it; edits go
/// through the store and always produce a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDefinition {
    pub id: Uuid,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub status: DefinitionStatus,
    pub trigger_specs: Vec<TriggerSpec>,
    pub graph: JourneyGraph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a journey definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// What starts an execution of this journey for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerSpec {
    /// Start on receipt of a matching domain event.
    Event { event_type: String },
    /// Start at `anchor_date + offset_days` (negative = before the anchor).
    /// Applies to enrolled executions that carry an anchor date.
    AnchorOffset { offset_days: i64 },
}

/// The node graph of a journey. Directed, acyclic, single entry node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyGraph {
    pub nodes: Vec<JourneyNode>,
}

/// A single node within a journey graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyNode {
    pub id: Uuid,
    pub kind: NodeKind,
    /// Successor for linear nodes. Branch nodes route via their arms instead.
    pub next: Option<Uuid>,
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    SendMessage(MessageConfig),
    CollectForm(FormConfig),
    Wait(WaitSpec),
    Branch(BranchConfig),
    ExternalAction(ExternalActionConfig),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::SendMessage(_) => "send_message",
            NodeKind::CollectForm(_) => "collect_form",
            NodeKind::Wait(_) => "wait",
            NodeKind::Branch(_) => "branch",
            NodeKind::ExternalAction(_) => "external_action",
        }
    }
}

/// Configuration for a send_message node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    pub template_id: String,
    pub channel: MessageChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
    Push,
}

/// Configuration for a collect_form node. The execution parks until the
/// resume event arrives for its subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormConfig {
    pub form_id: String,
    #[serde(default = "default_resume_event")]
    pub resume_event: String,
}

fn default_resume_event() -> String {
    "form_submitted".to_string()
}

/// How long a wait node delays the next step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum WaitSpec {
    /// Fixed delay from the moment the wait node runs.
    Duration { secs: u64 },
    /// Absolute point relative to the execution's anchor date
    /// (negative = before the anchor).
    AnchorOffset { days: i64 },
}

/// Configuration for a branch node. Arms are evaluated in order; the first
/// matching arm wins. A default target (or an `always` arm) makes the
/// branch exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub arms: Vec<BranchArm>,
    pub default_target: Option<Uuid>,
}

/// One predicate-guarded outgoing edge of a branch node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    pub predicate: Predicate,
    pub target: Uuid,
}

/// Predicates evaluated against subject attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Predicate {
    Always,
    AttributeExists { key: String },
    AttributeAbsent { key: String },
    AttributeEquals { key: String, value: serde_json::Value },
}

impl Predicate {
    /// Evaluate against a subject attribute object. Non-object attribute
    /// payloads match nothing except `Always`.
    pub fn evaluate(&self, attributes: &serde_json::Value) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::AttributeExists { key } => attributes
                .as_object()
                .is_some_and(|obj| obj.contains_key(key)),
            Predicate::AttributeAbsent { key } => attributes
                .as_object()
                .is_none_or(|obj| !obj.contains_key(key)),
            Predicate::AttributeEquals { key, value } => attributes
                .as_object()
                .and_then(|obj| obj.get(key))
                .is_some_and(|v| v == value),
        }
    }
}

/// Configuration for an external_action node (CRM update, webhook, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalActionConfig {
    pub action: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A directed edge, as produced by `JourneyGraph::edges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: Uuid,
    pub to: Uuid,
}

impl JourneyGraph {
    pub fn node(&self, id: Uuid) -> Option<&JourneyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All directed edges: linear successors plus branch arms and defaults.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for node in &self.nodes {
            if let Some(next) = node.next {
                edges.push(Edge {
                    from: node.id,
                    to: next,
                });
            }
            if let NodeKind::Branch(branch) = &node.kind {
                for arm in &branch.arms {
                    edges.push(Edge {
                        from: node.id,
                        to: arm.target,
                    });
                }
                if let Some(default) = branch.default_target {
                    edges.push(Edge {
                        from: node.id,
                        to: default,
                    });
                }
            }
        }
        edges
    }

    /// The unique node with no incoming edges, if there is exactly one.
    pub fn entry_node(&self) -> Option<&JourneyNode> {
        let edges = self.edges();
        let mut entries = self
            .nodes
            .iter()
            .filter(|n| !edges.iter().any(|e| e.to == n.id));
        match (entries.next(), entries.next()) {
            (Some(entry), None) => Some(entry),
            _ => None,
        }
    }
}

impl JourneyDefinition {
    /// Whether any event trigger spec matches the given event type.
    pub fn matches_event(&self, event_type: &str) -> bool {
        self.trigger_specs.iter().any(|spec| {
            matches!(spec, TriggerSpec::Event { event_type: t } if t == event_type)
        })
    }

    /// Anchor offset (days) of the earliest date-offset trigger, if any.
    pub fn anchor_trigger_offset(&self) -> Option<i64> {
        self.trigger_specs
            .iter()
            .filter_map(|spec| match spec {
                TriggerSpec::AnchorOffset { offset_days } => Some(*offset_days),
                _ => None,
            })
            .min()
    }
}
