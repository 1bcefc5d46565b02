//! HTTP routes: per-workflow latest snapshot and run submission.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use shared_types::WorkflowDefinition;

pub mod runs;

use crate::config::Config;
use crate::error::ProxyError;
use crate::store::SnapshotStore;
use crate::upstream::Ingestion;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn SnapshotStore>,
    pub workflows: Arc<BTreeMap<String, WorkflowDefinition>>,
    /// Workflow id -> upstream run endpoint.
    pub upstreams: Arc<BTreeMap<String, String>>,
    pub client: reqwest::Client,
    pub replay_speed: f64,
}

impl ApiState {
    /// State serving the built-in workflows, all replayed at scenario pace.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        let workflows = shared_types::builtin_workflows()
            .into_iter()
            .map(|workflow| (workflow.id.clone(), workflow))
            .collect();
        Self {
            store,
            workflows: Arc::new(workflows),
            upstreams: Arc::new(BTreeMap::new()),
            client: reqwest::Client::new(),
            replay_speed: 1.0,
        }
    }

    pub fn from_config(store: Arc<dyn SnapshotStore>, config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        let state = Self {
            client,
            upstreams: Arc::new(config.upstreams.clone()),
            replay_speed: config.replay_speed,
            ..Self::new(store)
        };
        for workflow in state.upstreams.keys() {
            if !state.workflows.contains_key(workflow) {
                tracing::warn!(workflow = %workflow, "Upstream configured for an unknown workflow");
            }
        }
        Ok(state)
    }

    pub fn with_upstream(mut self, workflow: impl Into<String>, url: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.upstreams).insert(workflow.into(), url.into());
        self
    }

    pub fn with_replay_speed(mut self, speed: f64) -> Self {
        self.replay_speed = speed;
        self
    }

    pub fn workflow(&self, id: &str) -> Result<&WorkflowDefinition, ProxyError> {
        self.workflows
            .get(id)
            .ok_or_else(|| ProxyError::UnknownWorkflow(id.to_string()))
    }

    fn ingestion(&self, workflow: &str) -> Ingestion {
        match self.upstreams.get(workflow) {
            Some(url) => Ingestion::Upstream {
                client: self.client.clone(),
                url: url.clone(),
            },
            None => Ingestion::Replay {
                speed: self.replay_speed,
            },
        }
    }
}

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/latest", get(runs::get_latest_any))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/{workflow}/latest", get(runs::get_latest))
        .route("/api/{workflow}/run", post(runs::start_run))
}

pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "trace-proxy",
            "version": env!("CARGO_PKG_VERSION"),
            "workflows": state.workflows.keys().collect::<Vec<_>>(),
        })),
    )
}

async fn cache_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "cache_stats": state.store.stats().await }))
}
