use std::collections::HashMap;

use serde::Serialize;
use shared_types::{NodeStatus, WorkflowDefinition};

/// Visual style of one edge, derived from its endpoints.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStyle {
    Idle,
    Pending,
    Flowing,
    Traversed,
    Chosen,
    Bypassed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionView {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub dashed: bool,
    pub style: ConnectionStyle,
}

pub fn connection_style(from: NodeStatus, to: NodeStatus) -> ConnectionStyle {
    use NodeStatus::*;

    match (from, to) {
        (Error, _) | (_, Error) => ConnectionStyle::Failed,
        (Skipped, _) | (_, Skipped) => ConnectionStyle::Bypassed,
        (Completed | Chosen, Active) => ConnectionStyle::Flowing,
        (Completed | Chosen, Chosen) => ConnectionStyle::Chosen,
        (Completed | Chosen, Completed) => ConnectionStyle::Traversed,
        (Upcoming, _) | (_, Upcoming) => ConnectionStyle::Pending,
        _ => ConnectionStyle::Idle,
    }
}

/// Styles for every connection whose endpoints exist. `statuses` is aligned
/// with `workflow.nodes`.
pub fn derive_connections(
    workflow: &WorkflowDefinition,
    statuses: &[NodeStatus],
) -> Vec<ConnectionView> {
    let status_of: HashMap<&str, NodeStatus> = workflow
        .nodes
        .iter()
        .map(|node| node.id.as_str())
        .zip(statuses.iter().copied())
        .collect();

    workflow
        .connections
        .iter()
        .filter_map(|conn| {
            let from = *status_of.get(conn.from.as_str())?;
            let to = *status_of.get(conn.to.as_str())?;
            Some(ConnectionView {
                from: conn.from.clone(),
                to: conn.to.clone(),
                label: conn.label.clone(),
                dashed: conn.dashed,
                style: connection_style(from, to),
            })
        })
        .collect()
}
