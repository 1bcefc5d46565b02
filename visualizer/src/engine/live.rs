//! Poll-driven live engine and the run accumulator shared with the stream
//! engine.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use chrono::{DateTime, Utc};
use shared_types::{
    run_finished, RunState, StepStatus, SyncMode, TraceSnapshot, TraceStep, WorkflowDefinition,
};

use super::{
    render_graph, Delivery, Hub, ReconciliationState, Subscriber, SubscriptionId,
    VisualizerEngine,
};
use crate::config::TimingConfig;
use crate::error::TransportError;
use crate::reconcile::{
    derive_live_chat, merge_steps, sort_steps, timeline_entries, StatusInput, StepTouch,
};
use crate::transport::{
    ErrorCallback, RunChange, RunTracker, SnapshotCallback, SnapshotSource, TraceTransport,
};

// ============================================================================
// Run accumulation
// ============================================================================

/// Everything seen so far for one run. Steps only ever grow or update.
#[derive(Debug, Clone)]
pub(crate) struct LiveRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub user_query: Option<String>,
    /// Sorted by timestamp, stable on first-seen order.
    pub steps: Vec<TraceStep>,
    pub selected_choice: Option<String>,
    pub final_output: Option<String>,
    pub error: Option<String>,
    pub state: Option<RunState>,
}

impl LiveRun {
    fn new(snapshot: &TraceSnapshot) -> Self {
        Self {
            run_id: snapshot.run_id.clone(),
            created_at: snapshot.created_at,
            user_query: None,
            steps: Vec::new(),
            selected_choice: None,
            final_output: None,
            error: None,
            state: None,
        }
    }

    fn absorb(&mut self, snapshot: TraceSnapshot) {
        merge_steps(&mut self.steps, &snapshot.steps);
        if snapshot.user_query.is_some() {
            self.user_query = snapshot.user_query;
        }
        if snapshot.selected_choice.is_some() {
            self.selected_choice = snapshot.selected_choice;
        }
        if snapshot.final_output.is_some() {
            self.final_output = snapshot.final_output;
        }
        if snapshot.error.is_some() {
            self.error = snapshot.error;
        }
        if snapshot.state.is_some() {
            self.state = snapshot.state;
        }
        if self.error.is_some() {
            for step in &mut self.steps {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Error;
                }
            }
        }
        sort_steps(&mut self.steps);
    }

    pub fn is_finished(&self) -> bool {
        run_finished(
            self.state,
            self.error.as_deref(),
            self.final_output.as_deref(),
            &self.steps,
        )
    }
}

/// Run tracking plus the accumulated current run.
#[derive(Debug, Default)]
pub(crate) struct LiveSession {
    tracker: RunTracker,
    run: Option<LiveRun>,
}

impl LiveSession {
    /// Apply a snapshot. Returns false when it was discarded.
    pub fn absorb(&mut self, workflow: &WorkflowDefinition, snapshot: TraceSnapshot) -> bool {
        if let Some(other) = snapshot.workflow.as_deref().filter(|id| *id != workflow.id) {
            tracing::debug!(workflow = %workflow.id, snapshot_workflow = other, "Ignoring snapshot for another workflow");
            return false;
        }

        match self.tracker.observe(&snapshot) {
            RunChange::Stale => {
                tracing::debug!(run_id = %snapshot.run_id, "Discarding snapshot from a superseded run");
                false
            }
            RunChange::New => {
                tracing::info!(
                    run_id = %snapshot.run_id,
                    previous = self.run.as_ref().map(|run| run.run_id.as_str()).unwrap_or(""),
                    "New run observed; resetting"
                );
                let mut run = LiveRun::new(&snapshot);
                run.absorb(snapshot);
                self.run = Some(run);
                true
            }
            RunChange::Same => match self.run.as_mut() {
                Some(run) => {
                    run.absorb(snapshot);
                    true
                }
                None => false,
            },
        }
    }

    pub fn run(&self) -> Option<&LiveRun> {
        self.run.as_ref()
    }
}

/// Derive a live state. `steps` is the full ordered step list (possibly with
/// a synthesized entry) and the first `cursor` of them are visible.
pub(crate) fn render_run(
    workflow: &WorkflowDefinition,
    mode: SyncMode,
    run: Option<&LiveRun>,
    steps: &[TraceStep],
    cursor: usize,
    is_playing: bool,
) -> ReconciliationState {
    let mut state = ReconciliationState::initial(workflow, mode);
    state.is_playing = is_playing;
    let Some(run) = run else {
        return state;
    };

    let touches: Vec<StepTouch> = steps
        .iter()
        .map(|step| StepTouch::from_step(workflow, step))
        .collect();

    // The branch is only known once the run has an outcome.
    let active_nodes: Option<HashSet<String>> = run.is_finished().then(|| {
        run.steps
            .iter()
            .filter(|step| step.status != StepStatus::Pending)
            .filter_map(|step| workflow.node_for_step_type(&step.step_type))
            .map(|node| node.id.clone())
            .collect()
    });
    let chosen_nodes: HashSet<String> = run
        .selected_choice
        .as_deref()
        .and_then(|choice| workflow.node_for_choice(choice))
        .map(|node| node.id.clone())
        .into_iter()
        .collect();

    let cursor = cursor.min(steps.len());
    let input = StatusInput {
        workflow,
        active_nodes: active_nodes.as_ref(),
        chosen_nodes: &chosen_nodes,
        touches: &touches,
        cursor,
    };
    let graph = render_graph(&input, None);
    let timeline = timeline_entries(workflow, &steps[..cursor], run.created_at);

    state.run_id = Some(run.run_id.clone());
    state.cursor = cursor;
    state.total = run.steps.len();
    state.nodes = graph.nodes;
    state.connections = graph.connections;
    state.highlighted_path = graph.highlighted_path;
    state.visible_step_ids = timeline.iter().map(|entry| entry.id.clone()).collect();
    state.current_event = timeline.last().cloned();
    state.timeline = timeline;
    state.chat = derive_live_chat(
        run.user_query.as_deref(),
        &run.steps,
        run.final_output.as_deref(),
        run.error.as_deref(),
    );
    state.finished = run.is_finished() && cursor >= steps.len();
    state
}

pub(crate) fn log_transport_error(workflow_id: String) -> ErrorCallback {
    Rc::new(move |error: &TransportError| {
        tracing::warn!(workflow = %workflow_id, error = %error, "Trace transport error; keeping current state");
    })
}

// ============================================================================
// Poll engine
// ============================================================================

/// Shows everything the latest snapshot holds, accumulated per run.
pub struct PollEngine {
    inner: Rc<RefCell<PollInner>>,
    transport: TraceTransport,
}

struct PollInner {
    workflow: Rc<WorkflowDefinition>,
    session: LiveSession,
    polling: bool,
    hub: Hub,
}

impl PollInner {
    fn build_state(&self) -> ReconciliationState {
        let steps = self
            .session
            .run()
            .map(|run| run.steps.as_slice())
            .unwrap_or_default();
        render_run(
            &self.workflow,
            SyncMode::LivePoll,
            self.session.run(),
            steps,
            steps.len(),
            self.polling,
        )
    }

    fn refresh(&mut self) -> Option<Delivery> {
        let state = self.build_state();
        self.hub.publish_if_changed(state)
    }
}

fn apply_snapshot(inner: &Rc<RefCell<PollInner>>, snapshot: TraceSnapshot) {
    let delivery = {
        let mut inner = inner.borrow_mut();
        let workflow = inner.workflow.clone();
        if !inner.session.absorb(&workflow, snapshot) {
            return;
        }
        inner.refresh()
    };
    if let Some(delivery) = delivery {
        delivery.send();
    }
}

fn snapshot_callback(weak: Weak<RefCell<PollInner>>) -> SnapshotCallback {
    Rc::new(move |snapshot: TraceSnapshot, is_new_run: bool| {
        if let Some(inner) = weak.upgrade() {
            tracing::trace!(run_id = %snapshot.run_id, is_new_run, "Snapshot polled");
            apply_snapshot(&inner, snapshot);
        }
    })
}

impl PollEngine {
    pub fn new(
        workflow: Rc<WorkflowDefinition>,
        source: Rc<dyn SnapshotSource>,
        timing: TimingConfig,
    ) -> Self {
        let initial = ReconciliationState::initial(&workflow, SyncMode::LivePoll);
        Self {
            inner: Rc::new(RefCell::new(PollInner {
                workflow,
                session: LiveSession::default(),
                polling: false,
                hub: Hub::new(initial),
            })),
            transport: TraceTransport::new(source, timing.poll_interval),
        }
    }

    /// Apply a snapshot directly, as if it had been polled.
    pub fn ingest(&self, snapshot: TraceSnapshot) {
        apply_snapshot(&self.inner, snapshot);
    }

    pub fn is_polling(&self) -> bool {
        self.transport.is_polling()
    }

    fn set_polling(&self, polling: bool) {
        let delivery = {
            let mut inner = self.inner.borrow_mut();
            inner.polling = polling;
            inner.refresh()
        };
        if let Some(delivery) = delivery {
            delivery.send();
        }
    }
}

impl VisualizerEngine for PollEngine {
    fn mode(&self) -> SyncMode {
        SyncMode::LivePoll
    }

    fn start(&self) {
        let workflow_id = self.inner.borrow().workflow.id.clone();
        self.transport.start_polling(
            snapshot_callback(Rc::downgrade(&self.inner)),
            log_transport_error(workflow_id),
        );
        self.set_polling(true);
    }

    fn stop(&self) {
        self.transport.stop_polling();
        self.set_polling(false);
    }

    fn state(&self) -> ReconciliationState {
        self.inner.borrow().hub.state().clone()
    }

    fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        self.inner.borrow_mut().hub.subscribe(subscriber)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.borrow_mut().hub.unsubscribe(id);
    }

    fn teardown(&self) {
        self.transport.shutdown();
        let mut inner = self.inner.borrow_mut();
        inner.polling = false;
        inner.hub.clear_subscribers();
    }
}
