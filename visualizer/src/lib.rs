//! Blueprint visualizer - trace-to-visual-state reconciliation
//!
//! Turns a workflow definition plus a run's trace (a canned scenario, polled
//! snapshots, or a streamed query) into node statuses, connection styles, a
//! timeline and a chat transcript that a presentation layer can draw.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod transport;
pub mod workflows;

pub use engine::{
    build_engine, EngineOptions, EngineSlot, ReconciliationState, VisualizerEngine,
};
pub use error::{TransportError, VisualizerError};
