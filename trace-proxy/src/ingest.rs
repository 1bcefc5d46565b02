//! Turning upstream output into snapshot mutations.
//!
//! Upstreams speak the chunked protocol of the original chat backend: one
//! JSON object per SSE `data:` line, tagged by `type`. Non-streaming upstreams
//! return a single JSON result instead.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{
    parse_timestamp, RunState, StepStatus, TraceSnapshot, TraceStep, WorkflowDefinition,
};

/// One streamed upstream event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Progress notice; carries no trace data.
    Status(serde_json::Value),
    CotStep(StepUpdate),
    /// A slice of the final answer.
    Content(String),
    Sources(Vec<serde_json::Value>),
    /// The routing decision, matched against the workflow's choice map.
    Route(String),
    Suggestions(Vec<serde_json::Value>),
    Error(String),
    Done,
}

/// A step as reported by the upstream. Everything but the type is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StepUpdate {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id: Some(id.into()),
            step_type: step_type.into(),
            label: None,
            description: None,
            status,
            timestamp: None,
            metadata: BTreeMap::new(),
        }
    }

    fn reported_at(&self) -> Option<DateTime<Utc>> {
        // Python's str(datetime) separates date and time with a space.
        self.timestamp
            .as_deref()
            .and_then(|raw| parse_timestamp(raw).or_else(|| parse_timestamp(&raw.replacen(' ', "T", 1))))
    }
}

/// Whether ingestion should keep reading after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

impl StreamChunk {
    /// Error and done close the run; nothing after them is applied.
    pub fn ends_run(&self) -> bool {
        matches!(self, StreamChunk::Error(_) | StreamChunk::Done)
    }
}

/// A new run for `workflow` with every mapped step type seeded `pending`.
/// Repeating step types are left out; their instances arrive numbered.
pub fn seed_snapshot(
    workflow: &WorkflowDefinition,
    input: &str,
    now: DateTime<Utc>,
) -> TraceSnapshot {
    let mut snapshot = TraceSnapshot::new(uuid::Uuid::new_v4().to_string(), now);
    snapshot.workflow = Some(workflow.id.clone());
    snapshot.user_query = Some(input.to_string());
    snapshot.state = Some(RunState::Running);

    for step_type in workflow.seed_step_types() {
        let label = workflow
            .node_for_step_type(step_type)
            .map(|node| node.label.clone())
            .unwrap_or_else(|| step_type.to_string());
        snapshot.upsert_step(
            TraceStep::new(step_type, step_type, StepStatus::Pending, now).with_label(label),
        );
    }
    snapshot
}

/// Upsert a reported step.
///
/// A step leaving `pending` is stamped with the report time. Later updates
/// keep that start time so the timeline does not reorder, and a terminal
/// update records the elapsed duration.
pub fn apply_step(snapshot: &mut TraceSnapshot, update: StepUpdate, now: DateTime<Utc>) {
    let id = update.id.clone().unwrap_or_else(|| update.step_type.clone());
    let reported = update.reported_at().unwrap_or(now);
    let previous = snapshot.step(&id).cloned();

    let started = match &previous {
        Some(existing) if existing.status != StepStatus::Pending => existing.timestamp,
        _ => reported,
    };
    let label = update
        .label
        .or_else(|| previous.as_ref().map(|existing| existing.label.clone()))
        .unwrap_or_else(|| update.step_type.clone());

    let mut step = TraceStep::new(id, update.step_type, update.status, started).with_label(label);
    step.description = update
        .description
        .or_else(|| previous.as_ref().and_then(|existing| existing.description.clone()));
    step.metadata = previous.map(|existing| existing.metadata).unwrap_or_default();
    step.metadata.extend(update.metadata);
    if update.status.is_terminal() {
        step.duration_ms = Some((reported - started).num_milliseconds().max(0) as f64);
    }

    snapshot.upsert_step(step);
    if reported > snapshot.last_updated {
        snapshot.last_updated = reported;
    }
}

pub fn apply_chunk(snapshot: &mut TraceSnapshot, chunk: StreamChunk, now: DateTime<Utc>) -> Flow {
    match chunk {
        StreamChunk::Status(status) => {
            tracing::trace!(run_id = %snapshot.run_id, %status, "Upstream status");
        }
        StreamChunk::CotStep(update) => apply_step(snapshot, update, now),
        StreamChunk::Content(text) => {
            snapshot
                .final_output
                .get_or_insert_with(String::new)
                .push_str(&text);
        }
        StreamChunk::Sources(items) => snapshot.retrieved_items = items,
        StreamChunk::Route(choice) => snapshot.selected_choice = Some(choice),
        StreamChunk::Suggestions(items) => {
            if let Some(step) = snapshot
                .steps
                .iter_mut()
                .rev()
                .find(|step| step.step_type == "suggestions")
            {
                step.metadata
                    .insert("suggestions".to_string(), serde_json::Value::Array(items));
            }
        }
        StreamChunk::Error(message) => {
            snapshot.fail(message, now);
            return Flow::Finished;
        }
        StreamChunk::Done => {
            snapshot.finish(now);
            return Flow::Finished;
        }
    }
    if now > snapshot.last_updated {
        snapshot.last_updated = now;
    }
    Flow::Continue
}

/// Result body of a non-streaming upstream. Accepts the chat backend's shape
/// and an OpenAI-style completion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamResult {
    #[serde(default, alias = "response", alias = "assistant_response")]
    pub final_output: Option<String>,
    #[serde(default, alias = "cot_steps")]
    pub steps: Vec<StepUpdate>,
    #[serde(default, alias = "route")]
    pub selected_choice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

pub fn apply_result(snapshot: &mut TraceSnapshot, result: UpstreamResult, now: DateTime<Utc>) {
    for update in result.steps {
        apply_step(snapshot, update, now);
    }
    if !result.sources.is_empty() {
        snapshot.retrieved_items = result.sources;
    }
    if let Some(choice) = result.selected_choice.or(result.model) {
        snapshot.selected_choice = Some(choice);
    }

    let output = result.final_output.or_else(|| {
        result
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
    });
    match output {
        Some(text) => {
            // Anything still running finished with the answer.
            for step in snapshot
                .steps
                .iter_mut()
                .filter(|step| step.status == StepStatus::Running)
            {
                step.status = StepStatus::Completed;
            }
            snapshot.final_output = Some(text);
            snapshot.finish(now);
        }
        None => snapshot.fail("upstream returned no output", now),
    }
}

/// Incremental `text/event-stream` decoder yielding each event's data.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((end, separator)) = event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&block[..end])) {
                events.push(data);
            }
        }
        events
    }

    /// Data of a trailing event the upstream closed without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&rest))
    }
}

fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn event_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Parse one event's data. `[DONE]` is the OpenAI-style terminator.
pub fn parse_chunk(data: &str) -> Result<StreamChunk, serde_json::Error> {
    if data.trim() == "[DONE]" {
        return Ok(StreamChunk::Done);
    }
    serde_json::from_str(data)
}

/// Wire form of a chunk for the client relay.
pub fn sse_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}
