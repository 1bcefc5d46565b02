//! Pure derivation from trace data to visual state.
//!
//! Nothing in here owns state or timers; the engines call these functions on
//! every reconciliation pass.

mod chat;
mod connections;
mod status;
mod timeline;

use std::time::Duration;

use crate::config::TimingConfig;

pub use chat::{derive_live_chat, scripted_chat_visible, ChatEntry, ChatTranscript};
pub use connections::{connection_style, derive_connections, ConnectionStyle, ConnectionView};
pub use status::{derive_node_statuses, highlighted_path, StatusInput, StepTouch};
pub use timeline::{
    cutoff_visible, merge_steps, sort_steps, synthesize_running, timeline_entries,
    TimelineEntry, RUNNING_SUFFIX,
};

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 8.0;

/// Clamp a requested playback speed. Non-finite input is rejected.
pub fn clamp_speed(speed: f64) -> Option<f64> {
    speed
        .is_finite()
        .then(|| speed.clamp(MIN_SPEED, MAX_SPEED))
}

/// Delay before advancing from an event at `prev_ms` to one at `next_ms`.
pub fn step_delay(prev_ms: u64, next_ms: u64, speed: f64, timing: &TimingConfig) -> Duration {
    let speed = clamp_speed(speed).unwrap_or(1.0);
    let scaled_ms = next_ms.saturating_sub(prev_ms) as f64 * timing.slowdown / speed;
    Duration::from_millis(scaled_ms.round() as u64).max(timing.step_floor)
}
