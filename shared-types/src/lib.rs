//! Types shared between the trace proxy and the visualizer
//!
//! - `trace`: snapshots and steps as the proxy serves them (JSON over HTTP)
//! - `workflow`: static graphs, scenarios and the derived node vocabulary
//! - `catalog`: the workflows that ship with the tool
//!
//! Wire types also export TypeScript bindings via ts-rs.

pub mod catalog;
pub mod trace;
pub mod workflow;

pub use catalog::{builtin, builtin_workflows};
pub use trace::{
    parse_timestamp, run_finished, ChatTurn, ProxyErrorBody, RunAck, RunRequest, RunState,
    StepStatus, TraceSnapshot, TraceStep,
};
pub use workflow::{
    ChatRole, Connection, NodeKind, NodePosition, NodeStatus, Scenario, ScenarioEvent,
    ScriptedMessage, SyncMode, WorkflowDefinition, WorkflowNode,
};

#[cfg(test)]
mod tests {
    use super::*;
    use ts_rs::{Config, TS};

    #[test]
    fn test_node_status_serialization() {
        let json = serde_json::to_string(&NodeStatus::Chosen).unwrap();
        assert_eq!(json, "\"chosen\"");
    }

    #[test]
    fn test_node_kind_serialization() {
        let json = serde_json::to_string(&NodeKind::HumanApproval).unwrap();
        assert_eq!(json, "\"human-approval\"");
    }

    #[test]
    fn export_types() {
        // The export_to attribute in each type's #[ts] macro specifies the output file
        let config = Config::default();
        StepStatus::export(&config).unwrap();
        TraceStep::export(&config).unwrap();
        RunState::export(&config).unwrap();
        TraceSnapshot::export(&config).unwrap();
        NodeKind::export(&config).unwrap();
        NodeStatus::export(&config).unwrap();
        NodePosition::export(&config).unwrap();
        WorkflowNode::export(&config).unwrap();
        Connection::export(&config).unwrap();
        SyncMode::export(&config).unwrap();
        ChatRole::export(&config).unwrap();
    }
}
