//! Run ingestion: forwarding to a configured upstream, or replaying the
//! workflow's first scenario as a simulated one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use shared_types::{ChatRole, RunRequest, StepStatus, TraceSnapshot, WorkflowDefinition};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::ingest::{
    apply_chunk, apply_result, apply_step, parse_chunk, sse_frame, Flow, SseDecoder, StepUpdate,
    StreamChunk, UpstreamResult,
};
use crate::store::{SnapshotStore, SnapshotUpdate};

#[derive(Debug, thiserror::Error)]
enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed upstream result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Writes one run into the store and mirrors what it writes to a streaming
/// client, if there is one. Every write is guarded by the run id.
pub struct RunWriter {
    store: Arc<dyn SnapshotStore>,
    workflow: String,
    run_id: String,
    relay: Option<mpsc::Sender<String>>,
}

impl RunWriter {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        workflow: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            workflow: workflow.into(),
            run_id: run_id.into(),
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: mpsc::Sender<String>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn write(&self, update: SnapshotUpdate) -> Result<TraceSnapshot, StoreError> {
        self.store
            .update_run(&self.workflow, &self.run_id, update)
            .await
    }

    async fn relay(&mut self, payload: &str) {
        let Some(relay) = &self.relay else {
            return;
        };
        if relay.send(sse_frame(payload)).await.is_err() {
            tracing::debug!(run_id = %self.run_id, "Stream client went away; ingestion continues");
            self.relay = None;
        }
    }

    async fn apply(&self, chunk: StreamChunk) -> Result<Flow, StoreError> {
        let flow = if chunk.ends_run() {
            Flow::Finished
        } else {
            Flow::Continue
        };
        self.write(Box::new(move |snapshot| {
            apply_chunk(snapshot, chunk, Utc::now());
        }))
        .await?;
        Ok(flow)
    }

    /// Apply a chunk produced here and relay its wire form.
    pub async fn send(&mut self, chunk: StreamChunk) -> Result<Flow, StoreError> {
        let payload = match serde_json::to_string(&chunk) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode chunk for relay");
                None
            }
        };
        let flow = self.apply(chunk).await?;
        if let Some(payload) = payload {
            self.relay(&payload).await;
        }
        Ok(flow)
    }

    /// Apply one upstream event and relay it verbatim.
    async fn data(&mut self, data: String) -> Result<Flow, StoreError> {
        let chunk = match parse_chunk(&data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(run_id = %self.run_id, error = %e, "Skipping unrecognised upstream event");
                return Ok(Flow::Continue);
            }
        };
        let flow = self.apply(chunk).await?;
        self.relay(&data).await;
        Ok(flow)
    }

    async fn complete_step(&self, step_type: String) -> Result<(), StoreError> {
        self.write(Box::new(move |snapshot| {
            let update = StepUpdate::new(step_type.clone(), step_type, StepStatus::Completed);
            apply_step(snapshot, update, Utc::now());
        }))
        .await
        .map(|_| ())
    }

    async fn result(&mut self, result: UpstreamResult) -> Result<(), StoreError> {
        let snapshot = self
            .write(Box::new(move |snapshot| {
                apply_result(snapshot, result, Utc::now());
            }))
            .await?;
        let closing = match (snapshot.error, snapshot.final_output) {
            (Some(error), _) => vec![StreamChunk::Error(error)],
            (None, output) => vec![StreamChunk::Content(output.unwrap_or_default()), StreamChunk::Done],
        };
        for chunk in closing {
            if let Ok(payload) = serde_json::to_string(&chunk) {
                self.relay(&payload).await;
            }
        }
        Ok(())
    }

    /// Close a stream that ended without `done` or `error`.
    async fn close_stream(&mut self) -> Result<(), StoreError> {
        let snapshot = self
            .write(Box::new(|snapshot| {
                if !snapshot.is_finished() {
                    snapshot.fail("upstream closed the stream before finishing", Utc::now());
                }
            }))
            .await?;
        if let Some(error) = snapshot.error {
            if let Ok(payload) = serde_json::to_string(&StreamChunk::Error(error)) {
                self.relay(&payload).await;
            }
        }
        Ok(())
    }

    /// Record an ingestion failure. A superseded run is left alone.
    pub async fn fail(&mut self, message: String) {
        match self.send(StreamChunk::Error(message)).await {
            Ok(_) => {}
            Err(StoreError::Superseded { .. }) => {
                tracing::debug!(run_id = %self.run_id, "Run superseded before its failure was recorded");
            }
            Err(e) => tracing::warn!(run_id = %self.run_id, error = %e, "Failed to record run failure"),
        }
    }
}

/// Where a run's trace comes from.
#[derive(Debug, Clone)]
pub enum Ingestion {
    Upstream { client: reqwest::Client, url: String },
    Replay { speed: f64 },
}

impl Ingestion {
    pub async fn run(self, workflow: WorkflowDefinition, request: RunRequest, mut writer: RunWriter) {
        let started = writer
            .send(StreamChunk::Status(serde_json::json!({
                "state": "starting",
                "run_id": writer.run_id(),
            })))
            .await;
        if let Err(e) = started {
            tracing::debug!(run_id = %writer.run_id(), error = %e, "Run replaced before ingestion started");
            return;
        }

        let outcome = match self {
            Ingestion::Upstream { client, url } => {
                forward(&client, &url, &workflow, request, &mut writer).await
            }
            Ingestion::Replay { speed } => replay(&workflow, speed, &mut writer).await,
        };

        match outcome {
            Ok(()) => {
                tracing::info!(workflow = %workflow.id, run_id = %writer.run_id(), "Run ingestion finished");
            }
            Err(IngestError::Store(StoreError::Superseded { current, .. })) => {
                tracing::info!(
                    workflow = %workflow.id,
                    run_id = %writer.run_id(),
                    current = %current,
                    "Run superseded; ingestion stopped"
                );
            }
            Err(e) => {
                tracing::warn!(workflow = %workflow.id, run_id = %writer.run_id(), error = %e, "Run ingestion failed");
                writer.fail(e.to_string()).await;
            }
        }
    }
}

async fn forward(
    client: &reqwest::Client,
    url: &str,
    workflow: &WorkflowDefinition,
    request: RunRequest,
    writer: &mut RunWriter,
) -> Result<(), IngestError> {
    let request = RunRequest {
        stream: true,
        ..request
    };
    let response = client
        .post(url)
        .header(ACCEPT, "text/event-stream, application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(IngestError::Status { status, body });
    }

    // The upstream accepted the request: the entry step is done.
    if let Some(entry) = workflow.seed_step_types().first() {
        writer.complete_step((*entry).to_string()).await?;
    }

    let is_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));

    if !is_stream {
        let body = response.bytes().await?;
        let result: UpstreamResult = serde_json::from_slice(&body)?;
        writer.result(result).await?;
        return Ok(());
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(bytes) = body.next().await {
        for data in decoder.push(&bytes?) {
            if writer.data(data).await? == Flow::Finished {
                return Ok(());
            }
        }
    }
    if let Some(data) = decoder.finish() {
        if writer.data(data).await? == Flow::Finished {
            return Ok(());
        }
    }
    writer.close_stream().await?;
    Ok(())
}

/// Replay the workflow's first scenario: each event starts `running` at its
/// scenario time and finishes when the next one starts.
async fn replay(
    workflow: &WorkflowDefinition,
    speed: f64,
    writer: &mut RunWriter,
) -> Result<(), IngestError> {
    let Some(scenario) = workflow.default_scenario() else {
        writer
            .send(StreamChunk::Error(format!(
                "workflow {} has no scenario to replay",
                workflow.id
            )))
            .await?;
        return Ok(());
    };
    tracing::debug!(workflow = %workflow.id, scenario = %scenario.id, speed, "Replaying scenario");

    let mut elapsed_ms = 0u64;
    let mut in_flight: Option<StepUpdate> = None;
    for event in &scenario.events {
        pause(event.timing_ms.saturating_sub(elapsed_ms), speed).await;
        elapsed_ms = event.timing_ms;
        if let Some(done) = in_flight.take() {
            writer.send(StreamChunk::CotStep(done)).await?;
        }

        let id = if workflow.repeating_step_types.contains(&event.step_type) {
            event.id.clone()
        } else {
            event.step_type.clone()
        };
        let mut update = StepUpdate::new(id, event.step_type.clone(), StepStatus::Running);
        update.label = Some(event.label.clone());
        update.description = event.description.clone();
        writer.send(StreamChunk::CotStep(update.clone())).await?;

        // A gate reported as running is approved in a replay.
        update.status = match event.status {
            StepStatus::Running | StepStatus::Pending => StepStatus::Completed,
            other => other,
        };
        in_flight = Some(update);
    }
    if let Some(done) = in_flight {
        writer.send(StreamChunk::CotStep(done)).await?;
    }

    let choice = scenario.chosen_nodes.iter().find_map(|node_id| {
        workflow
            .choice_map
            .iter()
            .find(|(_, target)| *target == node_id)
            .map(|(choice, _)| choice.clone())
    });
    if let Some(choice) = choice {
        writer.send(StreamChunk::Route(choice)).await?;
    }

    let answer = scenario
        .chat
        .iter()
        .rev()
        .find(|message| message.role == ChatRole::Assistant)
        .map(|message| message.text.clone())
        .unwrap_or_else(|| format!("{} complete", scenario.title));
    writer.send(StreamChunk::Content(answer)).await?;
    writer.send(StreamChunk::Done).await?;
    Ok(())
}

async fn pause(scenario_ms: u64, speed: f64) {
    if scenario_ms == 0 {
        return;
    }
    let scaled = (scenario_ms as f64 / speed).round() as u64;
    tokio::time::sleep(Duration::from_millis(scaled)).await;
}
