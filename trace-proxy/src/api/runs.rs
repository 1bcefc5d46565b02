use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::StreamExt;
use shared_types::{RunAck, RunRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::ApiState;
use crate::error::ProxyError;
use crate::ingest::seed_snapshot;
use crate::upstream::RunWriter;

/// Frames buffered for a slow stream client before ingestion waits on it.
const RELAY_BUFFER: usize = 64;

/// `GET /api/{workflow}/latest`: the current run, or `null` before the first.
pub async fn get_latest(
    State(state): State<ApiState>,
    Path(workflow): Path<String>,
) -> Result<Response, ProxyError> {
    state.workflow(&workflow)?;
    let snapshot = state.store.get(&workflow).await;
    Ok(([(CACHE_CONTROL, "no-store")], Json(snapshot)).into_response())
}

/// `GET /api/latest`: the most recently written run of any workflow.
pub async fn get_latest_any(State(state): State<ApiState>) -> Response {
    let snapshot = state.store.latest().await;
    ([(CACHE_CONTROL, "no-store")], Json(snapshot)).into_response()
}

/// `POST /api/{workflow}/run`
///
/// Seeds a fresh snapshot that replaces the workflow's current run, then
/// ingests the run in the background. A streaming client receives the chunks
/// as they are applied; everyone else gets `202` and polls `latest`.
pub async fn start_run(
    State(state): State<ApiState>,
    Path(workflow_id): Path<String>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let workflow = state.workflow(&workflow_id)?.clone();
    let Json(request) = body.map_err(|rejection| ProxyError::InvalidBody(rejection.body_text()))?;
    let input = request.input_text().ok_or(ProxyError::MissingInput)?.to_string();

    let snapshot = seed_snapshot(&workflow, &input, Utc::now());
    let run_id = snapshot.run_id.clone();
    state.store.set(&workflow_id, snapshot).await;

    let ingestion = state.ingestion(&workflow_id);
    tracing::info!(
        workflow = %workflow_id,
        run_id = %run_id,
        upstream = matches!(ingestion, crate::upstream::Ingestion::Upstream { .. }),
        stream = request.stream,
        "Run started"
    );

    let writer = RunWriter::new(state.store.clone(), workflow_id, run_id.clone());
    if !request.stream {
        tokio::spawn(ingestion.run(workflow, request, writer));
        let ack = RunAck {
            run_id,
            status: "accepted".to_string(),
        };
        return Ok((StatusCode::ACCEPTED, Json(ack)).into_response());
    }

    let (tx, rx) = mpsc::channel::<String>(RELAY_BUFFER);
    tokio::spawn(ingestion.run(workflow, request, writer.with_relay(tx)));
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok((
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}
