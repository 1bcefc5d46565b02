//! Chat transcript derivation.
//!
//! A transcript holds one user entry, one system line per step type and at
//! most one terminal entry, which is always last.

use serde::Serialize;
use shared_types::{ChatRole, Scenario, StepStatus, TraceStep};

const TERMINAL_ID: &str = "terminal";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatEntry {
    pub id: String,
    pub role: ChatRole,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTranscript {
    entries: Vec<ChatEntry>,
}

impl ChatTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move `id` to the end (just before the terminal entry).
    pub fn upsert(&mut self, id: impl Into<String>, role: ChatRole, text: impl Into<String>) {
        let id = id.into();
        self.entries.retain(|entry| entry.id != id);
        let entry = ChatEntry {
            id,
            role,
            text: text.into(),
        };
        match self.entries.iter().position(|entry| entry.id == TERMINAL_ID) {
            Some(index) => self.entries.insert(index, entry),
            None => self.entries.push(entry),
        }
    }

    /// Replace the terminal outcome. Removed and re-inserted, never duplicated.
    pub fn set_terminal(&mut self, role: ChatRole, text: impl Into<String>) {
        self.clear_terminal();
        self.entries.push(ChatEntry {
            id: TERMINAL_ID.to_string(),
            role,
            text: text.into(),
        });
    }

    pub fn clear_terminal(&mut self) {
        self.entries.retain(|entry| entry.id != TERMINAL_ID);
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ChatEntry> {
        self.entries
    }
}

fn system_line(step: &TraceStep) -> String {
    match &step.description {
        Some(description) => format!("{} ({}): {}", step.label, step.status, description),
        None => format!("{} ({})", step.label, step.status),
    }
}

/// Chat for a live run. Every arrived step contributes, grouped by
/// `step_type` at the position of the type's last occurrence. Pending seed
/// steps have not arrived and contribute nothing.
pub fn derive_live_chat(
    user_input: Option<&str>,
    steps: &[TraceStep],
    final_output: Option<&str>,
    error: Option<&str>,
) -> Vec<ChatEntry> {
    let mut transcript = ChatTranscript::new();
    if let Some(input) = user_input.filter(|text| !text.is_empty()) {
        transcript.upsert("user", ChatRole::User, input);
    }
    for step in steps
        .iter()
        .filter(|step| step.status != StepStatus::Pending)
    {
        transcript.upsert(
            format!("system:{}", step.step_type),
            ChatRole::System,
            system_line(step),
        );
    }
    match (error, final_output.filter(|text| !text.is_empty())) {
        (Some(error), _) => transcript.set_terminal(ChatRole::Error, error),
        (None, Some(output)) => transcript.set_terminal(ChatRole::Assistant, output),
        (None, None) => {}
    }
    transcript.into_entries()
}

/// Scripted chat gated by the same relative-time cutoff as the graph.
pub fn scripted_chat_visible(scenario: &Scenario, cutoff_ms: Option<u64>) -> Vec<ChatEntry> {
    let Some(cutoff_ms) = cutoff_ms else {
        return Vec::new();
    };
    scenario
        .chat
        .iter()
        .enumerate()
        .filter(|(_, message)| message.timing_ms <= cutoff_ms)
        .map(|(index, message)| ChatEntry {
            id: format!("chat-{index}"),
            role: message.role,
            text: message.text.clone(),
        })
        .collect()
}
