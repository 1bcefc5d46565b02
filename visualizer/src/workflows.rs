//! Workflow lookup: built-in catalog plus optional definition files.
//!
//! A TOML file holds `[[workflow]]` tables. A JSON file holds either one
//! definition or an array of them.

use std::path::Path;

use serde::Deserialize;
use shared_types::WorkflowDefinition;

use crate::error::VisualizerError;

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    #[serde(default, rename = "workflow")]
    workflows: Vec<WorkflowDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonWorkflows {
    Many(Vec<WorkflowDefinition>),
    One(Box<WorkflowDefinition>),
}

pub fn load_workflow_file(path: &Path) -> Result<Vec<WorkflowDefinition>, VisualizerError> {
    let raw = std::fs::read_to_string(path).map_err(|source| VisualizerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |message: String| VisualizerError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let workflows = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => match serde_json::from_str::<JsonWorkflows>(&raw)
            .map_err(|e| parse_error(e.to_string()))?
        {
            JsonWorkflows::Many(workflows) => workflows,
            JsonWorkflows::One(workflow) => vec![*workflow],
        },
        _ => {
            toml::from_str::<WorkflowFile>(&raw)
                .map_err(|e| parse_error(e.to_string()))?
                .workflows
        }
    };

    if workflows.is_empty() {
        return Err(parse_error("no workflow definitions found".to_string()));
    }
    tracing::info!(path = %path.display(), count = workflows.len(), "Loaded workflow definitions");
    Ok(workflows)
}

/// Find `id` in `file` first, then in the built-in catalog.
pub fn resolve_workflow(
    id: &str,
    file: Option<&Path>,
) -> Result<WorkflowDefinition, VisualizerError> {
    if let Some(path) = file {
        if let Some(found) = load_workflow_file(path)?
            .into_iter()
            .find(|workflow| workflow.id == id)
        {
            return Ok(found);
        }
    }
    shared_types::builtin(id).ok_or_else(|| VisualizerError::UnknownWorkflow(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{NodeKind, SyncMode};
    use std::io::Write;

    const TOML_WORKFLOW: &str = r#"
[[workflow]]
id = "triage"
title = "Ticket triage"
sync_mode = "live-poll"

[[workflow.nodes]]
id = "inbox"
label = "Inbox"
kind = "intake"

[[workflow.nodes]]
id = "gate"
label = "Manager sign-off"
kind = "human-approval"
position = { x = 200.0, y = 40.0 }

[[workflow.connections]]
from = "inbox"
to = "gate"
dashed = true

[workflow.step_map]
received = "inbox"
sign_off = "gate"
"#;

    #[test]
    fn test_loads_toml_definitions() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(TOML_WORKFLOW.as_bytes()).unwrap();

        let workflows = load_workflow_file(file.path()).unwrap();
        assert_eq!(workflows.len(), 1);
        let triage = &workflows[0];
        assert_eq!(triage.sync_mode, SyncMode::LivePoll);
        assert_eq!(triage.nodes[1].kind, NodeKind::HumanApproval);
        assert!(triage.connections[0].dashed);
        assert_eq!(
            triage.node_for_step_type("sign_off").map(|n| n.id.as_str()),
            Some("gate")
        );
    }

    #[test]
    fn test_loads_single_json_definition() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let json = serde_json::json!({
            "id": "tiny",
            "title": "Tiny",
            "nodes": [{ "id": "a", "label": "A", "kind": "output" }]
        });
        file.write_all(json.to_string().as_bytes()).unwrap();

        let workflows = load_workflow_file(file.path()).unwrap();
        assert_eq!(workflows[0].sync_mode, SyncMode::Scripted);
        assert!(workflows[0].connections.is_empty());
    }

    #[test]
    fn test_resolve_falls_back_to_catalog() {
        let workflow = resolve_workflow("llm-router", None).unwrap();
        assert_eq!(workflow.sync_mode, SyncMode::LivePoll);
        assert!(matches!(
            resolve_workflow("missing", None),
            Err(VisualizerError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[[workflow]]\nid = 3").unwrap();
        assert!(matches!(
            load_workflow_file(file.path()),
            Err(VisualizerError::Parse { .. })
        ));
    }
}
