//! Timeline entries: which steps are visible and in what order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_types::{NodeKind, ScenarioEvent, StepStatus, TraceStep, WorkflowDefinition};

/// Suffix of the entry synthesized for a step that is still executing.
pub const RUNNING_SUFFIX: &str = ":running";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelineEntry {
    pub id: String,
    pub step_type: String,
    pub label: String,
    pub description: Option<String>,
    pub status: StepStatus,
    /// Milliseconds since the run epoch.
    pub offset_ms: i64,
    pub node_id: Option<String>,
    /// Kind of the mapped node, for presentation-side grouping.
    pub category: Option<NodeKind>,
    /// Not reported by the backend; inferred from a gap between two steps.
    pub synthetic: bool,
}

impl TimelineEntry {
    pub fn from_step(
        workflow: &WorkflowDefinition,
        step: &TraceStep,
        epoch: DateTime<Utc>,
    ) -> Self {
        let node = workflow.node_for_step_type(&step.step_type);
        Self {
            id: step.id.clone(),
            step_type: step.step_type.clone(),
            label: step.label.clone(),
            description: step.description.clone(),
            status: step.status,
            offset_ms: step.offset_ms(epoch),
            node_id: node.map(|node| node.id.clone()),
            category: node.map(|node| node.kind),
            synthetic: step.id.ends_with(RUNNING_SUFFIX),
        }
    }

    pub fn from_event(
        workflow: &WorkflowDefinition,
        event: &ScenarioEvent,
        status: StepStatus,
    ) -> Self {
        let node = event
            .node_ids
            .first()
            .and_then(|id| workflow.node(id))
            .or_else(|| workflow.node_for_step_type(&event.step_type));
        Self {
            id: event.id.clone(),
            step_type: event.step_type.clone(),
            label: event.label.clone(),
            description: event.description.clone(),
            status,
            offset_ms: event.timing_ms as i64,
            node_id: node.map(|node| node.id.clone()),
            category: node.map(|node| node.kind),
            synthetic: false,
        }
    }
}

/// Upsert `incoming` into `steps` by id. The last write for an id wins and
/// keeps the position where that id was first seen. Steps absent from
/// `incoming` are kept.
pub fn merge_steps(steps: &mut Vec<TraceStep>, incoming: &[TraceStep]) {
    for step in incoming {
        match steps.iter_mut().find(|existing| existing.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
    }
}

/// Timestamp ascending; ties keep their current (first-seen) order.
pub fn sort_steps(steps: &mut [TraceStep]) {
    steps.sort_by_key(|step| step.timestamp);
}

pub fn timeline_entries(
    workflow: &WorkflowDefinition,
    steps: &[TraceStep],
    epoch: DateTime<Utc>,
) -> Vec<TimelineEntry> {
    steps
        .iter()
        .map(|step| TimelineEntry::from_step(workflow, step, epoch))
        .collect()
}

/// Number of leading steps revealed at `now`: those whose offset from
/// `epoch` does not exceed the elapsed time. `steps` must be sorted.
pub fn cutoff_visible(steps: &[TraceStep], epoch: DateTime<Utc>, now: DateTime<Utc>) -> usize {
    let elapsed = (now - epoch).num_milliseconds();
    steps
        .iter()
        .take_while(|step| step.offset_ms(epoch) <= elapsed)
        .count()
}

/// A "still running" stand-in for the last revealed step when the next step
/// is hidden behind the cutoff and lands more than `gap_ms` later.
pub fn synthesize_running(
    steps: &[TraceStep],
    visible: usize,
    gap_ms: i64,
) -> Option<TraceStep> {
    let last = steps.get(visible.checked_sub(1)?)?;
    let next = steps.get(visible)?;
    if last.status != StepStatus::Completed {
        return None;
    }
    if (next.timestamp - last.timestamp).num_milliseconds() <= gap_ms {
        return None;
    }

    let mut running = last.clone();
    running.id = format!("{}{RUNNING_SUFFIX}", last.id);
    running.status = StepStatus::Running;
    running.duration_ms = None;
    Some(running)
}
