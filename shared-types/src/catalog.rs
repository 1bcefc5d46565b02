//! Built-in workflow definitions.
//!
//! These are load-time configuration, not wire data: the proxy seeds new runs
//! from them and the visualizer draws runs on them.

use std::collections::BTreeMap;

use crate::trace::StepStatus;
use crate::workflow::{
    ChatRole, Connection, NodeKind, NodePosition, Scenario, ScenarioEvent, ScriptedMessage,
    SyncMode, WorkflowDefinition, WorkflowNode,
};

pub const LLM_ROUTER: &str = "llm-router";
pub const RAG_PIPELINE: &str = "rag-pipeline";
pub const SUPPORT_AGENT: &str = "support-agent";

pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    vec![llm_router(), rag_pipeline(), support_agent()]
}

pub fn builtin(id: &str) -> Option<WorkflowDefinition> {
    match id {
        LLM_ROUTER => Some(llm_router()),
        RAG_PIPELINE => Some(rag_pipeline()),
        SUPPORT_AGENT => Some(support_agent()),
        _ => None,
    }
}

fn node(id: &str, label: &str, icon: &str, x: f32, y: f32, kind: NodeKind) -> WorkflowNode {
    WorkflowNode {
        id: id.to_string(),
        label: label.to_string(),
        icon: icon.to_string(),
        position: NodePosition { x, y },
        kind,
    }
}

fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

// ============================================================================
// LLM router
// ============================================================================

pub fn llm_router() -> WorkflowDefinition {
    WorkflowDefinition {
        id: LLM_ROUTER.to_string(),
        title: "LLM Router".to_string(),
        sync_mode: SyncMode::LivePoll,
        nodes: vec![
            node("request", "User Request", "message", 80.0, 200.0, NodeKind::Intake),
            node(
                "classifier",
                "Task Classifier",
                "tags",
                260.0,
                200.0,
                NodeKind::Classification,
            ),
            node("router", "Router Policy", "split", 440.0, 200.0, NodeKind::Routing),
            node(
                "model-small",
                "Llama 3.1 8B",
                "cpu",
                640.0,
                80.0,
                NodeKind::ModelInvocation,
            ),
            node(
                "model-large",
                "Llama 3.1 70B",
                "cpu",
                640.0,
                200.0,
                NodeKind::ModelInvocation,
            ),
            node(
                "model-code",
                "Qwen 2.5 Coder",
                "code",
                640.0,
                320.0,
                NodeKind::ModelInvocation,
            ),
            node("response", "Response", "send", 840.0, 200.0, NodeKind::Output),
        ],
        connections: vec![
            Connection::new("request", "classifier"),
            Connection::new("classifier", "router"),
            Connection::new("router", "model-small").labeled("simple"),
            Connection::new("router", "model-large").labeled("complex"),
            Connection::new("router", "model-code").labeled("code"),
            Connection::new("model-small", "response"),
            Connection::new("model-large", "response"),
            Connection::new("model-code", "response"),
        ],
        step_map: mapping(&[
            ("request_received", "request"),
            ("task_classification", "classifier"),
            ("routing_decision", "router"),
            ("model_small", "model-small"),
            ("model_large", "model-large"),
            ("model_code", "model-code"),
            ("response", "response"),
        ]),
        choice_map: mapping(&[
            ("small", "model-small"),
            ("large", "model-large"),
            ("code", "model-code"),
            ("meta/llama-3.1-8b-instruct", "model-small"),
            ("meta/llama-3.1-70b-instruct", "model-large"),
            ("qwen/qwen2.5-coder-32b-instruct", "model-code"),
        ]),
        repeating_step_types: Vec::new(),
        scenarios: vec![
            Scenario {
                id: "complex-reasoning".to_string(),
                title: "Complex reasoning question".to_string(),
                input: "Compare optimistic and pessimistic locking for a ledger service."
                    .to_string(),
                active_nodes: ids(&["request", "classifier", "router", "model-large", "response"]),
                chosen_nodes: ids(&["model-large"]),
                events: vec![
                    ScenarioEvent::new("r1", "request_received", "Request received", 0, &["request"]),
                    ScenarioEvent::new(
                        "r2",
                        "task_classification",
                        "Classifying task",
                        120,
                        &["classifier"],
                    )
                    .with_description("Task type: open-ended reasoning, complexity high"),
                    ScenarioEvent::new("r3", "routing_decision", "Routing", 260, &["router"])
                        .with_description("Policy `task_router` selected llama-3.1-70b"),
                    ScenarioEvent::new("r4", "model_large", "Generating", 420, &["model-large"]),
                    ScenarioEvent::new("r5", "response", "Response ready", 1650, &["response"]),
                ],
                chat: vec![
                    ScriptedMessage::new(
                        ChatRole::User,
                        "Compare optimistic and pessimistic locking for a ledger service.",
                        0,
                    ),
                    ScriptedMessage::new(ChatRole::System, "Classified as complex reasoning", 120),
                    ScriptedMessage::new(ChatRole::System, "Routed to Llama 3.1 70B", 260),
                    ScriptedMessage::new(
                        ChatRole::Assistant,
                        "Pessimistic locking serialises writers up front; optimistic locking \
                         detects conflicts at commit. For a ledger with hot accounts, prefer \
                         pessimistic row locks on the account balance.",
                        1650,
                    ),
                ],
            },
            Scenario {
                id: "code-question".to_string(),
                title: "Coding question".to_string(),
                input: "Write a Rust function that reverses a linked list.".to_string(),
                active_nodes: ids(&["request", "classifier", "router", "model-code", "response"]),
                chosen_nodes: ids(&["model-code"]),
                events: vec![
                    ScenarioEvent::new("c1", "request_received", "Request received", 0, &["request"]),
                    ScenarioEvent::new(
                        "c2",
                        "task_classification",
                        "Classifying task",
                        90,
                        &["classifier"],
                    )
                    .with_description("Task type: code generation"),
                    ScenarioEvent::new("c3", "routing_decision", "Routing", 180, &["router"]),
                    ScenarioEvent::new("c4", "model_code", "Generating", 300, &["model-code"]),
                    ScenarioEvent::new("c5", "response", "Response ready", 1200, &["response"]),
                ],
                chat: vec![
                    ScriptedMessage::new(
                        ChatRole::User,
                        "Write a Rust function that reverses a linked list.",
                        0,
                    ),
                    ScriptedMessage::new(ChatRole::System, "Routed to Qwen 2.5 Coder", 180),
                    ScriptedMessage::new(
                        ChatRole::Assistant,
                        "Walk the list once, re-pointing each `next` at the previous node.",
                        1200,
                    ),
                ],
            },
        ],
    }
}

// ============================================================================
// RAG pipeline
// ============================================================================

pub fn rag_pipeline() -> WorkflowDefinition {
    WorkflowDefinition {
        id: RAG_PIPELINE.to_string(),
        title: "RAG Pipeline".to_string(),
        sync_mode: SyncMode::LiveStream,
        nodes: vec![
            node("query", "User Query", "message", 60.0, 220.0, NodeKind::Intake),
            node(
                "input-guard",
                "Input Guardrails",
                "shield",
                200.0,
                220.0,
                NodeKind::Guardrail,
            ),
            node(
                "analyzer",
                "Query Analysis",
                "search",
                340.0,
                220.0,
                NodeKind::Classification,
            ),
            node(
                "web-search",
                "Web Search",
                "globe",
                480.0,
                80.0,
                NodeKind::ExternalCall,
            ),
            node(
                "augment",
                "Query Augmentation",
                "sparkles",
                480.0,
                220.0,
                NodeKind::ModelInvocation,
            ),
            node(
                "retriever",
                "Vector Retrieval",
                "database",
                620.0,
                220.0,
                NodeKind::Retrieval,
            ),
            node("reranker", "Reranker", "sort", 760.0, 220.0, NodeKind::Retrieval),
            node(
                "context",
                "Context Builder",
                "layers",
                900.0,
                220.0,
                NodeKind::DataStore,
            ),
            node(
                "llm",
                "Answer Generation",
                "cpu",
                1040.0,
                220.0,
                NodeKind::ModelInvocation,
            ),
            node(
                "output-guard",
                "Output Guardrails",
                "shield-check",
                1180.0,
                220.0,
                NodeKind::Guardrail,
            ),
            node("answer", "Answer", "send", 1320.0, 220.0, NodeKind::Output),
            node(
                "suggestions",
                "Follow-up Suggestions",
                "lightbulb",
                1320.0,
                360.0,
                NodeKind::ModelInvocation,
            ),
        ],
        connections: vec![
            Connection::new("query", "input-guard"),
            Connection::new("input-guard", "analyzer"),
            Connection::new("analyzer", "augment"),
            Connection::new("analyzer", "web-search").dashed(),
            Connection::new("web-search", "context").dashed(),
            Connection::new("augment", "retriever"),
            Connection::new("retriever", "reranker"),
            Connection::new("reranker", "context"),
            Connection::new("context", "llm"),
            Connection::new("llm", "output-guard"),
            Connection::new("output-guard", "answer"),
            Connection::new("answer", "suggestions").dashed(),
        ],
        step_map: mapping(&[
            ("query_received", "query"),
            ("checking", "input-guard"),
            ("analyzing", "analyzer"),
            ("web_search", "web-search"),
            ("augmenting", "augment"),
            ("retrieved", "retriever"),
            ("reranking", "reranker"),
            ("building", "context"),
            ("analyzing_document", "context"),
            ("generating", "llm"),
            ("validating", "output-guard"),
            ("answer", "answer"),
            ("suggestions", "suggestions"),
        ]),
        choice_map: mapping(&[("knowledge_base", "retriever"), ("web_search", "web-search")]),
        repeating_step_types: ids(&["analyzing_document"]),
        scenarios: vec![Scenario {
            id: "knowledge-base-answer".to_string(),
            title: "Answer from the knowledge base".to_string(),
            input: "What does the warranty cover for water damage?".to_string(),
            active_nodes: ids(&[
                "query",
                "input-guard",
                "analyzer",
                "augment",
                "retriever",
                "reranker",
                "context",
                "llm",
                "output-guard",
                "answer",
                "suggestions",
            ]),
            chosen_nodes: ids(&["retriever"]),
            events: vec![
                ScenarioEvent::new("query_received", "query_received", "Query received", 0, &["query"]),
                ScenarioEvent::new("checking", "checking", "Checking input safety", 150, &["input-guard"])
                    .with_description("No policy violations detected"),
                ScenarioEvent::new("analyzing", "analyzing", "Analyzing your request", 600, &["analyzer"])
                    .with_description("Knowledge base lookup is sufficient; web search not needed"),
                ScenarioEvent::new(
                    "augmenting",
                    "augmenting",
                    "Augmenting your query",
                    1100,
                    &["augment"],
                ),
                ScenarioEvent::new("retrieved", "retrieved", "Retrieved 8 documents", 1900, &["retriever"]),
                ScenarioEvent::new("reranking", "reranking", "Reranking documents", 2600, &["reranker"])
                    .with_description("Kept the 3 most relevant documents"),
                ScenarioEvent::new("building", "building", "Building context", 3100, &["context"]),
                ScenarioEvent::new(
                    "analyzing_document_1",
                    "analyzing_document",
                    "Analyzing document: Warranty Terms",
                    3300,
                    &["context"],
                ),
                ScenarioEvent::new(
                    "analyzing_document_2",
                    "analyzing_document",
                    "Analyzing document: Claims FAQ",
                    3450,
                    &["context"],
                ),
                ScenarioEvent::new("generating", "generating", "Generating response", 3900, &["llm"]),
                ScenarioEvent::new(
                    "validating",
                    "validating",
                    "Validating response",
                    6200,
                    &["output-guard"],
                ),
                ScenarioEvent::new("answer", "answer", "Answer delivered", 6600, &["answer"]),
                ScenarioEvent::new(
                    "suggestions",
                    "suggestions",
                    "Generating follow-up questions",
                    7100,
                    &["suggestions"],
                ),
            ],
            chat: vec![
                ScriptedMessage::new(
                    ChatRole::User,
                    "What does the warranty cover for water damage?",
                    0,
                ),
                ScriptedMessage::new(ChatRole::System, "Input passed guardrails", 150),
                ScriptedMessage::new(ChatRole::System, "Retrieved 8 documents, kept 3", 2600),
                ScriptedMessage::new(
                    ChatRole::Assistant,
                    "Accidental water damage is covered for 12 months when the device was \
                     used within its rated water resistance.",
                    6600,
                ),
            ],
        }],
    }
}

// ============================================================================
// Support agent
// ============================================================================

pub fn support_agent() -> WorkflowDefinition {
    WorkflowDefinition {
        id: SUPPORT_AGENT.to_string(),
        title: "Customer Support Agent".to_string(),
        sync_mode: SyncMode::Scripted,
        nodes: vec![
            node("message", "Customer Message", "message", 60.0, 200.0, NodeKind::Intake),
            node(
                "intent",
                "Intent Detection",
                "tags",
                220.0,
                200.0,
                NodeKind::Classification,
            ),
            node("kb", "Knowledge Base", "book", 400.0, 100.0, NodeKind::Retrieval),
            node("crm", "Order History", "database", 400.0, 300.0, NodeKind::DataStore),
            node("policy", "Refund Policy", "scale", 560.0, 300.0, NodeKind::Routing),
            node(
                "draft",
                "Draft Reply",
                "pen",
                720.0,
                200.0,
                NodeKind::ModelInvocation,
            ),
            node(
                "approval",
                "Agent Approval",
                "user-check",
                880.0,
                300.0,
                NodeKind::HumanApproval,
            ),
            node("send", "Send Reply", "send", 1040.0, 200.0, NodeKind::Output),
            node(
                "escalate",
                "Escalate to Human",
                "alert",
                1040.0,
                380.0,
                NodeKind::Output,
            ),
        ],
        connections: vec![
            Connection::new("message", "intent"),
            Connection::new("intent", "kb"),
            Connection::new("intent", "crm"),
            Connection::new("crm", "policy"),
            Connection::new("kb", "draft"),
            Connection::new("policy", "draft"),
            Connection::new("draft", "approval"),
            Connection::new("draft", "send").dashed().labeled("auto"),
            Connection::new("approval", "send").labeled("approve"),
            Connection::new("approval", "escalate").dashed().labeled("deny"),
        ],
        step_map: mapping(&[
            ("message_received", "message"),
            ("intent_detection", "intent"),
            ("kb_lookup", "kb"),
            ("order_lookup", "crm"),
            ("policy_check", "policy"),
            ("draft_reply", "draft"),
            ("approval", "approval"),
            ("send_reply", "send"),
            ("escalation", "escalate"),
        ]),
        choice_map: mapping(&[("approved", "send"), ("escalated", "escalate")]),
        repeating_step_types: Vec::new(),
        scenarios: vec![
            Scenario {
                id: "refund-request".to_string(),
                title: "Refund needing approval".to_string(),
                input: "My blender arrived cracked, can I get a refund? Order #4471.".to_string(),
                active_nodes: ids(&[
                    "message", "intent", "crm", "policy", "draft", "approval", "send",
                ]),
                chosen_nodes: ids(&["send"]),
                events: vec![
                    ScenarioEvent::new("a1", "message_received", "Message received", 0, &["message"]),
                    ScenarioEvent::new("a2", "intent_detection", "Detecting intent", 400, &["intent"])
                        .with_description("Intent: refund request"),
                    ScenarioEvent::new("a3", "order_lookup", "Looking up order #4471", 900, &["crm"]),
                    ScenarioEvent::new("a4", "policy_check", "Checking refund policy", 1500, &["policy"])
                        .with_description("Damaged on arrival, within 30 days: eligible"),
                    ScenarioEvent::new("a5", "draft_reply", "Drafting reply", 2300, &["draft"]),
                    ScenarioEvent::new(
                        "a6",
                        "approval",
                        "Waiting for agent approval",
                        3200,
                        &["approval"],
                    )
                    .with_status(StepStatus::Running),
                    ScenarioEvent::new("a7", "send_reply", "Reply sent", 3600, &["send"]),
                ],
                chat: vec![
                    ScriptedMessage::new(
                        ChatRole::User,
                        "My blender arrived cracked, can I get a refund? Order #4471.",
                        0,
                    ),
                    ScriptedMessage::new(ChatRole::System, "Intent: refund request", 400),
                    ScriptedMessage::new(ChatRole::System, "Refund is eligible under policy", 1500),
                    ScriptedMessage::new(ChatRole::System, "Refund needs agent approval", 3200),
                    ScriptedMessage::new(
                        ChatRole::Assistant,
                        "Sorry about that! A full refund for order #4471 is on its way.",
                        3600,
                    ),
                ],
            },
            Scenario {
                id: "shipping-faq".to_string(),
                title: "Shipping question".to_string(),
                input: "How long does standard shipping take?".to_string(),
                active_nodes: ids(&["message", "intent", "kb", "draft", "send"]),
                chosen_nodes: ids(&["send"]),
                events: vec![
                    ScenarioEvent::new("f1", "message_received", "Message received", 0, &["message"]),
                    ScenarioEvent::new("f2", "intent_detection", "Detecting intent", 300, &["intent"])
                        .with_description("Intent: shipping question"),
                    ScenarioEvent::new("f3", "kb_lookup", "Searching help center", 800, &["kb"]),
                    ScenarioEvent::new("f4", "draft_reply", "Drafting reply", 1600, &["draft"]),
                    ScenarioEvent::new("f5", "send_reply", "Reply sent", 2400, &["send"]),
                ],
                chat: vec![
                    ScriptedMessage::new(ChatRole::User, "How long does standard shipping take?", 0),
                    ScriptedMessage::new(
                        ChatRole::Assistant,
                        "Standard shipping takes 3 to 5 business days.",
                        2400,
                    ),
                ],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_workflows_are_consistent() {
        for workflow in builtin_workflows() {
            for (step_type, node_id) in &workflow.step_map {
                assert!(
                    workflow.node(node_id).is_some(),
                    "{}: step type {step_type} maps to missing node {node_id}",
                    workflow.id
                );
            }
            assert_eq!(
                workflow.valid_connections().count(),
                workflow.connections.len(),
                "{}: dangling connection",
                workflow.id
            );
            assert!(!workflow.scenarios.is_empty(), "{}: no scenario", workflow.id);
            for scenario in &workflow.scenarios {
                let mut last = 0;
                for event in &scenario.events {
                    assert!(event.timing_ms >= last, "{}: events out of order", scenario.id);
                    last = event.timing_ms;
                    for node_id in &event.node_ids {
                        assert!(workflow.node(node_id).is_some());
                    }
                }
            }
        }
    }

    #[test]
    fn test_builtin_lookup_by_id() {
        assert_eq!(builtin(RAG_PIPELINE).unwrap().sync_mode, SyncMode::LiveStream);
        assert!(builtin("nope").is_none());
    }
}
