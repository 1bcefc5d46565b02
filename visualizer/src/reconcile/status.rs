//! Node status derivation.
//!
//! Priority, first match wins:
//! active > error > chosen > completed > skipped (explicit) > upcoming >
//! skipped (off-branch) > dormant.

use std::collections::{HashMap, HashSet};

use shared_types::{NodeStatus, ScenarioEvent, StepStatus, TraceStep, WorkflowDefinition};

/// The nodes one step or scenario event touches, and the status it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTouch {
    pub node_ids: Vec<String>,
    pub status: StepStatus,
}

impl StepTouch {
    pub fn from_event(event: &ScenarioEvent, status: StepStatus) -> Self {
        Self {
            node_ids: event.node_ids.clone(),
            status,
        }
    }

    /// Unmapped step types touch nothing.
    pub fn from_step(workflow: &WorkflowDefinition, step: &TraceStep) -> Self {
        Self {
            node_ids: workflow
                .node_for_step_type(&step.step_type)
                .map(|node| vec![node.id.clone()])
                .unwrap_or_default(),
            status: step.status,
        }
    }
}

pub struct StatusInput<'a> {
    pub workflow: &'a WorkflowDefinition,
    /// Nodes this run's branch uses. `None` until the branch is known.
    pub active_nodes: Option<&'a HashSet<String>>,
    /// The run's terminal decision.
    pub chosen_nodes: &'a HashSet<String>,
    /// Every step of the run, in cursor order.
    pub touches: &'a [StepTouch],
    /// How many touches have been reached. `touches[cursor - 1]` is current.
    pub cursor: usize,
}

#[derive(Default)]
struct NodeFacts {
    reached: bool,
    errored: bool,
    skipped: bool,
    pending: bool,
    later: bool,
}

/// One status per `workflow.nodes` entry, in declaration order.
///
/// Pure: identical input always yields an identical vector.
pub fn derive_node_statuses(input: &StatusInput<'_>) -> Vec<NodeStatus> {
    let cursor = input.cursor.min(input.touches.len());
    let (reached, later) = input.touches.split_at(cursor);

    let mut facts: HashMap<&str, NodeFacts> = HashMap::new();
    for touch in reached {
        for node_id in &touch.node_ids {
            let entry = facts.entry(node_id.as_str()).or_default();
            match touch.status {
                StepStatus::Running | StepStatus::Completed => entry.reached = true,
                StepStatus::Error => entry.errored = true,
                StepStatus::Skipped => entry.skipped = true,
                StepStatus::Pending => entry.pending = true,
            }
        }
    }
    for touch in later {
        for node_id in &touch.node_ids {
            facts.entry(node_id.as_str()).or_default().later = true;
        }
    }

    let current_running: HashSet<&str> = reached
        .last()
        .filter(|touch| touch.status == StepStatus::Running)
        .map(|touch| touch.node_ids.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let empty = NodeFacts::default();
    input
        .workflow
        .nodes
        .iter()
        .map(|node| {
            let id = node.id.as_str();
            let fact = facts.get(id).unwrap_or(&empty);
            let on_branch = input
                .active_nodes
                .map_or(true, |active| active.contains(id));

            if current_running.contains(id) {
                NodeStatus::Active
            } else if fact.errored {
                NodeStatus::Error
            } else if fact.reached && input.chosen_nodes.contains(id) {
                NodeStatus::Chosen
            } else if fact.reached {
                NodeStatus::Completed
            } else if fact.skipped {
                NodeStatus::Skipped
            } else if on_branch && (fact.later || fact.pending) {
                NodeStatus::Upcoming
            } else if !on_branch {
                NodeStatus::Skipped
            } else {
                NodeStatus::Dormant
            }
        })
        .collect()
}

/// Nodes reached by running or completed steps, in first-touch order, that
/// are still drawn as on the path.
pub fn highlighted_path(input: &StatusInput<'_>, statuses: &[NodeStatus]) -> Vec<String> {
    let status_of: HashMap<&str, NodeStatus> = input
        .workflow
        .nodes
        .iter()
        .map(|node| node.id.as_str())
        .zip(statuses.iter().copied())
        .collect();

    let mut path: Vec<String> = Vec::new();
    let cursor = input.cursor.min(input.touches.len());
    for touch in &input.touches[..cursor] {
        if !touch.status.is_reached() {
            continue;
        }
        for node_id in &touch.node_ids {
            let on_path = matches!(
                status_of.get(node_id.as_str()),
                Some(NodeStatus::Active | NodeStatus::Completed | NodeStatus::Chosen)
            );
            if on_path && !path.contains(node_id) {
                path.push(node_id.clone());
            }
        }
    }
    path
}
