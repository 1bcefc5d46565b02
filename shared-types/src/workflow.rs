//! Static workflow definitions: the graph a run is drawn on and the canned
//! scenarios used for scripted replay.
//!
//! Definitions are shared across runs and never carry per-run state. Node
//! status and connection style are always derived by the visualizer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::trace::StepStatus;

// ============================================================================
// Graph
// ============================================================================

/// Semantic role of a node in a workflow graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Intake,
    Classification,
    Guardrail,
    Routing,
    ModelInvocation,
    ExternalCall,
    Retrieval,
    HumanApproval,
    DataStore,
    Output,
}

/// Derived visual status of a node for one reconciliation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Dormant,
    Upcoming,
    Active,
    Completed,
    Chosen,
    Skipped,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Dormant => "dormant",
            NodeStatus::Upcoming => "upcoming",
            NodeStatus::Active => "active",
            NodeStatus::Completed => "completed",
            NodeStatus::Chosen => "chosen",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Error => "error",
        }
    }

    /// Finished executing, whether or not it was the deciding choice.
    pub fn is_done(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Chosen)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
pub struct NodePosition {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
pub struct WorkflowNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub position: NodePosition,
    pub kind: NodeKind,
}

/// Directed edge. Identity is the `(from, to)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub dashed: bool,
}

impl Connection {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            dashed: false,
        }
    }

    pub fn dashed(mut self) -> Self {
        self.dashed = true;
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// How a workflow's runs reach the visualizer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Canned scenario replayed on a timer.
    #[default]
    Scripted,
    /// Snapshots polled from the proxy; everything fetched is visible.
    LivePoll,
    /// Query submitted as a stream; steps revealed against a wall-clock cutoff.
    LiveStream,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Scripted => "scripted",
            SyncMode::LivePoll => "live-poll",
            SyncMode::LiveStream => "live-stream",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scripted" => Ok(SyncMode::Scripted),
            "live-poll" | "poll" => Ok(SyncMode::LivePoll),
            "live-stream" | "stream" => Ok(SyncMode::LiveStream),
            other => Err(format!("unknown sync mode: {other}")),
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    System,
    Assistant,
    Error,
}

/// One pre-authored step of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioEvent {
    pub id: String,
    pub step_type: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Offset from the start of the scenario.
    pub timing_ms: u64,
    /// Nodes this event touches.
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default = "default_event_status")]
    pub status: StepStatus,
}

fn default_event_status() -> StepStatus {
    StepStatus::Completed
}

impl ScenarioEvent {
    pub fn new(
        id: impl Into<String>,
        step_type: impl Into<String>,
        label: impl Into<String>,
        timing_ms: u64,
        node_ids: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            label: label.into(),
            description: None,
            timing_ms,
            node_ids: node_ids.iter().map(|id| (*id).to_string()).collect(),
            status: StepStatus::Completed,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptedMessage {
    pub role: ChatRole,
    pub text: String,
    pub timing_ms: u64,
}

impl ScriptedMessage {
    pub fn new(role: ChatRole, text: impl Into<String>, timing_ms: u64) -> Self {
        Self {
            role,
            text: text.into(),
            timing_ms,
        }
    }
}

/// A canned run: ordered events plus the chat transcript narrating them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub input: String,
    /// Nodes this scenario's branch uses. Everything else is drawn skipped.
    #[serde(default)]
    pub active_nodes: Vec<String>,
    /// The run's terminal decision (selected model, approved path, ...).
    #[serde(default)]
    pub chosen_nodes: Vec<String>,
    pub events: Vec<ScenarioEvent>,
    #[serde(default)]
    pub chat: Vec<ScriptedMessage>,
}

// ============================================================================
// Definition
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sync_mode: SyncMode,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// `step_type` -> node id. Unmapped step types are legal.
    #[serde(default)]
    pub step_map: BTreeMap<String, String>,
    /// Run-level `selected_choice` -> node id.
    #[serde(default)]
    pub choice_map: BTreeMap<String, String>,
    /// Step types reported once per item as `<type>_<n>`; never seeded.
    #[serde(default)]
    pub repeating_step_types: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_for_step_type(&self, step_type: &str) -> Option<&WorkflowNode> {
        self.step_map
            .get(step_type)
            .or_else(|| repeating_base(step_type).and_then(|base| self.step_map.get(base)))
            .and_then(|node_id| self.node(node_id))
    }

    pub fn node_for_choice(&self, choice: &str) -> Option<&WorkflowNode> {
        self.choice_map
            .get(choice)
            .and_then(|node_id| self.node(node_id))
    }

    pub fn scenario(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.id == id)
    }

    pub fn default_scenario(&self) -> Option<&Scenario> {
        self.scenarios.first()
    }

    /// Mapped step types in node declaration order, used to seed a new run.
    pub fn seed_step_types(&self) -> Vec<&str> {
        let mut seeds = Vec::new();
        for node in &self.nodes {
            for (step_type, node_id) in &self.step_map {
                if node_id == &node.id
                    && !seeds.contains(&step_type.as_str())
                    && !self.repeating_step_types.contains(step_type)
                {
                    seeds.push(step_type.as_str());
                }
            }
        }
        seeds
    }

    /// Connections whose endpoints both exist.
    pub fn valid_connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections
            .iter()
            .filter(|conn| self.node(&conn.from).is_some() && self.node(&conn.to).is_some())
    }
}

/// Repeating steps are reported as `<type>_<n>` (e.g. `analyzing_document_3`).
fn repeating_base(step_type: &str) -> Option<&str> {
    let (base, suffix) = step_type.rsplit_once('_')?;
    (!suffix.is_empty() && suffix.chars().all(|ch| ch.is_ascii_digit())).then_some(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "tiny".to_string(),
            title: "Tiny".to_string(),
            sync_mode: SyncMode::Scripted,
            nodes: vec![
                WorkflowNode {
                    id: "in".to_string(),
                    label: "In".to_string(),
                    icon: String::new(),
                    position: NodePosition::default(),
                    kind: NodeKind::Intake,
                },
                WorkflowNode {
                    id: "docs".to_string(),
                    label: "Docs".to_string(),
                    icon: String::new(),
                    position: NodePosition::default(),
                    kind: NodeKind::Retrieval,
                },
            ],
            connections: vec![Connection::new("in", "docs"), Connection::new("docs", "ghost")],
            step_map: BTreeMap::from([
                ("request".to_string(), "in".to_string()),
                ("analyzing_document".to_string(), "docs".to_string()),
            ]),
            choice_map: BTreeMap::new(),
            repeating_step_types: vec!["analyzing_document".to_string()],
            scenarios: Vec::new(),
        }
    }

    #[test]
    fn test_repeating_step_types_map_to_base() {
        let workflow = tiny();
        assert_eq!(
            workflow
                .node_for_step_type("analyzing_document_3")
                .map(|node| node.id.as_str()),
            Some("docs")
        );
        assert!(workflow.node_for_step_type("unmapped").is_none());
    }

    #[test]
    fn test_valid_connections_skip_unknown_nodes() {
        let workflow = tiny();
        assert_eq!(workflow.valid_connections().count(), 1);
    }

    #[test]
    fn test_seed_step_types_follow_node_order() {
        assert_eq!(tiny().seed_step_types(), vec!["request"]);
    }

    #[test]
    fn test_sync_mode_parses_short_names() {
        assert_eq!("poll".parse::<SyncMode>().unwrap(), SyncMode::LivePoll);
        assert_eq!("live-stream".parse::<SyncMode>().unwrap(), SyncMode::LiveStream);
        assert!("bogus".parse::<SyncMode>().is_err());
    }
}
