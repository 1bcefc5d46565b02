//! Trace snapshots as reported by the upstream proxy.
//!
//! A snapshot is the backend's view of one execution: a run id, a growing list
//! of steps and a handful of run-level results. The same run is re-sent many
//! times while it executes, so everything here is keyed for update-in-place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

// ============================================================================
// Steps
// ============================================================================

/// Lifecycle of a single trace step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    #[serde(alias = "active", alias = "in_progress")]
    Running,
    #[serde(alias = "complete", alias = "done")]
    Completed,
    #[serde(alias = "failed")]
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }

    /// The step has been reached: it is executing or has finished.
    pub fn is_reached(&self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::Completed)
    }

    /// The step will not change any further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Error | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend-reported step. `id` is unique within a run and stable across
/// repeated fetches of that run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
pub struct TraceStep {
    pub id: String,
    pub step_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(deserialize_with = "timestamp_from_any")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TraceStep {
    pub fn new(
        id: impl Into<String>,
        step_type: impl Into<String>,
        status: StepStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let step_type = step_type.into();
        Self {
            id: id.into(),
            label: step_type.clone(),
            step_type,
            status,
            timestamp,
            duration_ms: None,
            metadata: BTreeMap::new(),
            description: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Milliseconds between `epoch` and this step's timestamp.
    pub fn offset_ms(&self, epoch: DateTime<Utc>) -> i64 {
        (self.timestamp - epoch).num_milliseconds()
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Where the producer says a run stands. Set by the proxy from the moment a
/// run is seeded; producers that do not report it leave it out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

/// The latest known state of one run.
///
/// Lifecycle: created when a run is submitted (usually seeded with pending
/// steps), mutated in place while results arrive, and superseded the moment a
/// newer `run_id` appears. Steps are append/update-only within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/generated.ts")]
pub struct TraceSnapshot {
    #[serde(alias = "message_id", deserialize_with = "run_id_from_any")]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    #[serde(default, alias = "cot_steps")]
    pub steps: Vec<TraceStep>,
    #[serde(deserialize_with = "timestamp_from_any")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "timestamp_from_any")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_choice: Option<String>,
    #[serde(default, alias = "sources", deserialize_with = "items_from_any")]
    #[ts(type = "Array<unknown>")]
    pub retrieved_items: Vec<serde_json::Value>,
    #[serde(
        default,
        alias = "assistant_response",
        skip_serializing_if = "Option::is_none"
    )]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
}

impl TraceSnapshot {
    pub fn new(run_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow: None,
            user_query: None,
            steps: Vec::new(),
            created_at,
            last_updated: created_at,
            selected_choice: None,
            retrieved_items: Vec::new(),
            final_output: None,
            error: None,
            state: None,
        }
    }

    /// A fresh run with a generated id, stamped now.
    pub fn start(workflow: impl Into<String>, user_query: impl Into<String>) -> Self {
        let mut snapshot = Self::new(uuid::Uuid::new_v4().to_string(), Utc::now());
        snapshot.workflow = Some(workflow.into());
        snapshot.user_query = Some(user_query.into());
        snapshot.state = Some(RunState::Running);
        snapshot
    }

    /// Update the step with the same id in place, or append it.
    pub fn upsert_step(&mut self, step: TraceStep) {
        if step.timestamp > self.last_updated {
            self.last_updated = step.timestamp;
        }
        match self.steps.iter_mut().find(|existing| existing.id == step.id) {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }

    pub fn step(&self, id: &str) -> Option<&TraceStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count()
    }

    /// Label of the step currently executing, if any.
    pub fn active_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|step| step.status == StepStatus::Running)
            .map(|step| step.label.as_str())
    }

    /// The run has a terminal outcome. See [`run_finished`].
    pub fn is_finished(&self) -> bool {
        run_finished(
            self.state,
            self.error.as_deref(),
            self.final_output.as_deref(),
            &self.steps,
        )
    }

    /// Mark the run completed. Later chunks no longer change its outcome.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.state = Some(RunState::Completed);
        self.last_updated = at.max(self.last_updated);
    }

    /// Record an upstream failure: the run's error and every step still
    /// executing flips to `error`.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.error = Some(message.into());
        self.state = Some(RunState::Failed);
        for step in self
            .steps
            .iter_mut()
            .filter(|step| step.status == StepStatus::Running)
        {
            step.status = StepStatus::Error;
        }
        self.last_updated = at;
    }
}

/// Whether a run is over.
///
/// An error always ends it. A reported state decides otherwise, since an
/// answer streams in while later steps are still to run. Without one, the run
/// is over once it has an answer and no step is pending or running.
pub fn run_finished(
    state: Option<RunState>,
    error: Option<&str>,
    final_output: Option<&str>,
    steps: &[TraceStep],
) -> bool {
    if error.is_some() {
        return true;
    }
    match state {
        Some(RunState::Running) => false,
        Some(RunState::Completed | RunState::Failed) => true,
        None => {
            final_output.is_some_and(|text| !text.is_empty())
                && steps
                    .iter()
                    .all(|step| !matches!(step.status, StepStatus::Pending | StepStatus::Running))
        }
    }
}

fn run_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(raw) => Ok(raw),
        serde_json::Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "run id must be a string or number, got {other}"
        ))),
    }
}

/// RFC 3339, or a naive ISO timestamp which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn timestamp_from_any<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

// The original backend reports `sources` as a count on some routes and as a
// list on others; a bare number carries no items.
fn items_from_any<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

// ============================================================================
// Proxy requests / responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Body of `POST {base}/run`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatTurn>>,
    #[serde(default)]
    pub stream: bool,
}

impl RunRequest {
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            query: Some(text.into()),
            ..Self::default()
        }
    }

    /// The user's input: the explicit query, else the last user message.
    pub fn input_text(&self) -> Option<&str> {
        let from_query = self
            .query
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());
        from_query.or_else(|| {
            self.messages.as_ref().and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|turn| turn.role == "user")
                    .map(|turn| turn.content.trim())
                    .filter(|text| !text.is_empty())
            })
        })
    }
}

/// Plain acknowledgement of a submitted run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunAck {
    pub run_id: String,
    pub status: String,
}

/// Error shape returned by the proxy for any status >= 400.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_status_accepts_backend_spellings() {
        let active: StepStatus = serde_json::from_str("\"active\"").unwrap();
        let complete: StepStatus = serde_json::from_str("\"complete\"").unwrap();
        let failed: StepStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(active, StepStatus::Running);
        assert_eq!(complete, StepStatus::Completed);
        assert_eq!(failed, StepStatus::Error);
        assert_eq!(serde_json::to_string(&active).unwrap(), "\"running\"");
    }

    #[test]
    fn test_snapshot_accepts_cache_shape() {
        let raw = serde_json::json!({
            "message_id": 1712345678901234_i64,
            "user_query": "What is RAG?",
            "assistant_response": "Retrieval-augmented generation.",
            "cot_steps": [{
                "id": "checking",
                "step_type": "checking",
                "label": "Checking input",
                "status": "complete",
                "timestamp": "2024-04-05T10:00:00Z",
                "duration_ms": null,
                "metadata": {}
            }],
            "sources_count": 2,
            "created_at": "2024-04-05T10:00:00Z",
            "last_updated": "2024-04-05T10:00:01Z"
        });

        let snapshot: TraceSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snapshot.run_id, "1712345678901234");
        assert_eq!(snapshot.steps.len(), 1);
        assert_eq!(snapshot.steps[0].status, StepStatus::Completed);
        assert_eq!(
            snapshot.final_output.as_deref(),
            Some("Retrieval-augmented generation.")
        );
        assert!(snapshot.is_finished());
    }

    #[test]
    fn test_parse_timestamp_accepts_naive_iso() {
        let naive = parse_timestamp("2024-04-05T10:00:00.250000").unwrap();
        let zoned = parse_timestamp("2024-04-05T10:00:00.250Z").unwrap();
        assert_eq!(naive, zoned);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_upsert_step_updates_in_place() {
        let mut snapshot = TraceSnapshot::new("r1", at(0));
        snapshot.upsert_step(TraceStep::new("s1", "intake", StepStatus::Running, at(10)));
        snapshot.upsert_step(TraceStep::new("s2", "classify", StepStatus::Pending, at(20)));
        snapshot.upsert_step(TraceStep::new("s1", "intake", StepStatus::Completed, at(30)));

        assert_eq!(snapshot.steps.len(), 2);
        assert_eq!(snapshot.steps[0].id, "s1");
        assert_eq!(snapshot.steps[0].status, StepStatus::Completed);
        assert_eq!(snapshot.completed_steps(), 1);
        assert_eq!(snapshot.last_updated, at(30));
    }

    #[test]
    fn test_fail_marks_running_steps() {
        let mut snapshot = TraceSnapshot::new("r1", at(0));
        snapshot.upsert_step(TraceStep::new("s1", "intake", StepStatus::Completed, at(10)));
        snapshot.upsert_step(TraceStep::new("s2", "generate", StepStatus::Running, at(20)));
        snapshot.fail("model timed out", at(40));

        assert_eq!(snapshot.step("s1").unwrap().status, StepStatus::Completed);
        assert_eq!(snapshot.step("s2").unwrap().status, StepStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("model timed out"));
        assert!(snapshot.active_step().is_none());
    }

    #[test]
    fn test_streamed_answer_does_not_finish_a_running_run() {
        let mut snapshot = TraceSnapshot::start("rag-pipeline", "What is covered?");
        snapshot.upsert_step(TraceStep::new("generating", "generating", StepStatus::Completed, at(10)));
        snapshot.upsert_step(TraceStep::new("suggestions", "suggestions", StepStatus::Pending, at(10)));
        snapshot.final_output = Some("The a".to_string());
        assert_eq!(snapshot.state, Some(RunState::Running));
        assert!(!snapshot.is_finished());

        snapshot.finish(at(50));
        assert!(snapshot.is_finished());
        assert_eq!(snapshot.last_updated, at(50));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "completed");
    }

    #[test]
    fn test_unreported_state_waits_for_open_steps() {
        let mut snapshot = TraceSnapshot::new("r1", at(0));
        snapshot.upsert_step(TraceStep::new("generating", "generating", StepStatus::Completed, at(10)));
        snapshot.upsert_step(TraceStep::new("suggestions", "suggestions", StepStatus::Running, at(20)));
        snapshot.final_output = Some("Partial".to_string());
        assert!(!snapshot.is_finished());

        snapshot.upsert_step(TraceStep::new("suggestions", "suggestions", StepStatus::Completed, at(30)));
        assert!(snapshot.is_finished());

        let mut failed = TraceSnapshot::start("rag-pipeline", "q");
        failed.fail("upstream closed the stream before finishing", at(5));
        assert_eq!(failed.state, Some(RunState::Failed));
        assert!(failed.is_finished());
    }

    #[test]
    fn test_run_request_input_text() {
        let request = RunRequest {
            query: None,
            messages: Some(vec![
                ChatTurn {
                    role: "user".to_string(),
                    content: "first".to_string(),
                },
                ChatTurn {
                    role: "assistant".to_string(),
                    content: "reply".to_string(),
                },
                ChatTurn {
                    role: "user".to_string(),
                    content: " second ".to_string(),
                },
            ]),
            stream: false,
        };
        assert_eq!(request.input_text(), Some("second"));
        assert_eq!(RunRequest::query("  ").input_text(), None);
    }
}
