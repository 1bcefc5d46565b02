use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trace_proxy::config::Config;
use trace_proxy::{ApiState, InMemorySnapshotStore};

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    // Walk up so running from `trace-proxy/` still finds the workspace `.env`.
    for dir in cwd.ancestors() {
        let candidate = dir.join(".env");
        if !candidate.exists() {
            continue;
        }
        match dotenvy::from_path(&candidate) {
            Ok(()) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
            Err(e) => tracing::warn!(
                path = %candidate.display(),
                error = %e,
                "Failed to load .env file"
            ),
        }
        return;
    }
    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    if origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trace_proxy=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    load_env_file();
    let config = Config::from_env()?;

    let store = Arc::new(InMemorySnapshotStore::new());
    let state = ApiState::from_config(store, &config)?;
    for (workflow, url) in state.upstreams.iter() {
        tracing::info!(workflow = %workflow, upstream = %url, "Forwarding runs upstream");
    }
    tracing::info!(
        replay_speed = config.replay_speed,
        "Workflows without an upstream replay their first scenario"
    );

    let app = trace_proxy::app(state)
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "trace-proxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}
