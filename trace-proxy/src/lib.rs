//! Trace proxy - records workflow runs as pollable trace snapshots
//!
//! Each run is forwarded to a configured upstream (or replayed from the
//! workflow's first scenario) and folded step by step into the latest
//! snapshot for its workflow, which the visualizer polls.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod store;
pub mod upstream;

pub use api::{router, ApiState};
pub use error::{ProxyError, StoreError};
pub use store::{InMemorySnapshotStore, SnapshotStore, StoreStats};

/// The API router bound to its state, without the CORS and trace layers.
pub fn app(state: ApiState) -> axum::Router {
    router().with_state(state)
}
