//! Headless runner: drives one engine and logs every state it publishes.

use std::rc::Rc;
use std::time::Duration;

use shared_types::SyncMode;
use tracing_subscriber::EnvFilter;
use visualizer::config::VisualizerConfig;
use visualizer::engine::{build_engine, EngineOptions, EngineSlot, ReconciliationState};
use visualizer::transport::{HttpSnapshotSource, SnapshotSource};
use visualizer::workflows::resolve_workflow;

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
                Err(e) => tracing::warn!(
                    path = %candidate.display(),
                    error = %e,
                    "Failed to load .env file"
                ),
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }
    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}

fn log_state(state: &ReconciliationState, emit_json: bool) {
    if emit_json {
        match serde_json::to_string(state) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize state"),
        }
        return;
    }

    let nodes = state
        .nodes
        .iter()
        .map(|node| format!("{}={}", node.id, node.status))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(
        revision = state.revision,
        run_id = state.run_id.as_deref().unwrap_or("-"),
        cursor = state.cursor,
        total = state.total,
        playing = state.is_playing,
        current = state.current_event.as_ref().map(|e| e.label.as_str()).unwrap_or("-"),
        awaiting = state.awaiting_approval.as_deref().unwrap_or("-"),
        "{nodes}"
    );
    if let Some(entry) = state.chat.last() {
        tracing::debug!(role = ?entry.role, "{}", entry.text);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    load_env_file();
    let config = VisualizerConfig::from_env()?;
    let workflow = Rc::new(resolve_workflow(
        &config.workflow,
        config.workflow_file.as_deref(),
    )?);
    tracing::info!(workflow = %workflow.id, mode = %workflow.sync_mode, "Starting trace-viz");

    let source = config.base_url.as_ref().map(|base| {
        tracing::info!(base_url = %base, "Using proxy snapshot source");
        Rc::new(HttpSnapshotSource::new(base.clone())) as Rc<dyn SnapshotSource>
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let mut slot = EngineSlot::new();
            let engine = slot.replace(build_engine(
                workflow,
                EngineOptions {
                    scenario: config.scenario.clone(),
                    mode: config.mode,
                    source,
                    timing: config.timing.clone(),
                    speed: config.speed,
                    ..EngineOptions::default()
                },
            )?);

            let emit_json = config.emit_json;
            engine.subscribe(Rc::new(move |state: &ReconciliationState| {
                log_state(state, emit_json)
            }));
            let submitted = match config.query.as_deref() {
                Some(query) if engine.mode() == SyncMode::LiveStream => {
                    engine.submit_query(query);
                    true
                }
                _ => {
                    engine.start();
                    false
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {
                        let state = engine.state();
                        if state.awaiting_approval.is_some() && config.auto_approve {
                            tracing::info!(node = ?state.awaiting_approval, "Auto-approving");
                            engine.confirm();
                        }
                        // Poll mode keeps watching for the next run.
                        if state.finished && (state.mode != SyncMode::LivePoll || submitted) {
                            tracing::info!(revision = state.revision, "Run finished");
                            break;
                        }
                    }
                }
            }
            slot.clear();
            Ok::<_, anyhow::Error>(())
        })
        .await
}
