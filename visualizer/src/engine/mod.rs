//! Reconciliation engines.
//!
//! Three variants share one state shape and one control surface:
//!
//! - [`ScriptedEngine`]: replays a canned scenario on a self-rescheduling timer
//! - [`PollEngine`]: applies whatever the proxy's `latest` snapshot holds
//! - [`StreamEngine`]: submits a query and reveals steps against a wall-clock
//!   cutoff
//!
//! Engines are single-threaded (`Rc<RefCell<_>>`) and must run inside a tokio
//! `LocalSet`. Every public operation mutates state, rebuilds the view model,
//! releases the borrow, then notifies subscribers once.

mod live;
mod scripted;
mod stream;

use std::collections::HashSet;
use std::rc::Rc;

use serde::Serialize;
use shared_types::{
    NodeKind, NodePosition, NodeStatus, SyncMode, WorkflowDefinition, WorkflowNode,
};

use crate::clock::{Clock, SystemClock};
use crate::config::TimingConfig;
use crate::error::VisualizerError;
use crate::reconcile::{
    derive_connections, derive_node_statuses, highlighted_path, ChatEntry, ConnectionView,
    StatusInput, TimelineEntry,
};
use crate::transport::SnapshotSource;

pub use live::PollEngine;
pub use scripted::ScriptedEngine;
pub use stream::StreamEngine;

// ============================================================================
// View model
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Confirm,
    Deny,
}

/// A workflow node plus its derived status. Built fresh every pass; the
/// definition itself is never touched.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeView {
    pub id: String,
    pub label: String,
    pub icon: String,
    pub position: NodePosition,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Non-empty only on a human-approval node that is active or chosen.
    pub approval_actions: Vec<ApprovalAction>,
}

impl NodeView {
    fn new(node: &WorkflowNode, status: NodeStatus, awaiting: bool) -> Self {
        let overlay = awaiting
            && node.kind == NodeKind::HumanApproval
            && matches!(status, NodeStatus::Active | NodeStatus::Chosen);
        Self {
            id: node.id.clone(),
            label: node.label.clone(),
            icon: node.icon.clone(),
            position: node.position,
            kind: node.kind,
            status,
            approval_actions: if overlay {
                vec![ApprovalAction::Confirm, ApprovalAction::Deny]
            } else {
                Vec::new()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconciliationState {
    pub workflow_id: String,
    pub mode: SyncMode,
    pub run_id: Option<String>,
    pub cursor: usize,
    pub total: usize,
    pub is_playing: bool,
    pub speed: f64,
    pub nodes: Vec<NodeView>,
    pub connections: Vec<ConnectionView>,
    pub timeline: Vec<TimelineEntry>,
    pub visible_step_ids: Vec<String>,
    pub chat: Vec<ChatEntry>,
    pub current_event: Option<TimelineEntry>,
    pub highlighted_path: Vec<String>,
    /// Node id of the human-approval gate the run is stalled on.
    pub awaiting_approval: Option<String>,
    pub finished: bool,
    /// Bumped on every notification.
    pub revision: u64,
}

impl ReconciliationState {
    pub fn initial(workflow: &WorkflowDefinition, mode: SyncMode) -> Self {
        let nodes = workflow
            .nodes
            .iter()
            .map(|node| NodeView::new(node, NodeStatus::Dormant, false))
            .collect::<Vec<_>>();
        let statuses = vec![NodeStatus::Dormant; nodes.len()];
        Self {
            workflow_id: workflow.id.clone(),
            mode,
            run_id: None,
            cursor: 0,
            total: 0,
            is_playing: false,
            speed: 1.0,
            nodes,
            connections: derive_connections(workflow, &statuses),
            timeline: Vec::new(),
            visible_step_ids: Vec::new(),
            chat: Vec::new(),
            current_event: None,
            highlighted_path: Vec::new(),
            awaiting_approval: None,
            finished: false,
            revision: 0,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.node(id).map(|node| node.status)
    }

    /// Same picture, ignoring the revision counter.
    pub fn same_view(&self, other: &ReconciliationState) -> bool {
        let mut other = other.clone();
        other.revision = self.revision;
        *self == other
    }
}

/// Graph portion of a state: node views, connection styles and the path.
pub(crate) struct GraphView {
    pub nodes: Vec<NodeView>,
    pub connections: Vec<ConnectionView>,
    pub highlighted_path: Vec<String>,
}

pub(crate) fn render_graph(input: &StatusInput<'_>, awaiting: Option<&str>) -> GraphView {
    let statuses = derive_node_statuses(input);
    let nodes = input
        .workflow
        .nodes
        .iter()
        .zip(statuses.iter().copied())
        .map(|(node, status)| NodeView::new(node, status, awaiting == Some(node.id.as_str())))
        .collect();
    GraphView {
        nodes,
        connections: derive_connections(input.workflow, &statuses),
        highlighted_path: highlighted_path(input, &statuses),
    }
}

pub(crate) fn id_set(ids: &[String]) -> HashSet<String> {
    ids.iter().cloned().collect()
}

// ============================================================================
// Subscriptions
// ============================================================================

pub type Subscriber = Rc<dyn Fn(&ReconciliationState)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Last published state plus the callbacks waiting for the next one.
pub(crate) struct Hub {
    state: ReconciliationState,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

/// A state ready to hand to subscribers once the engine borrow is released.
#[must_use]
pub(crate) struct Delivery {
    state: ReconciliationState,
    subscribers: Vec<Subscriber>,
}

impl Delivery {
    pub fn send(self) {
        for subscriber in &self.subscribers {
            subscriber(&self.state);
        }
    }
}

impl Hub {
    pub fn new(state: ReconciliationState) -> Self {
        Self {
            state,
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    /// Replace the current state without notifying anyone.
    pub fn seed(&mut self, state: ReconciliationState) {
        let revision = self.state.revision;
        self.state = ReconciliationState { revision, ..state };
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.push((id, subscriber));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|(existing, _)| *existing != id);
    }

    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }

    pub fn publish(&mut self, mut state: ReconciliationState) -> Delivery {
        state.revision = self.state.revision + 1;
        self.state = state.clone();
        Delivery {
            state,
            subscribers: self
                .subscribers
                .iter()
                .map(|(_, subscriber)| subscriber.clone())
                .collect(),
        }
    }

    /// Publish only when the picture differs from the last one.
    pub fn publish_if_changed(&mut self, state: ReconciliationState) -> Option<Delivery> {
        (!self.state.same_view(&state)).then(|| self.publish(state))
    }
}

// ============================================================================
// Control surface
// ============================================================================

fn unsupported(mode: SyncMode, operation: &str) {
    tracing::warn!(mode = %mode, operation, "Control not supported by this engine; ignoring");
}

pub trait VisualizerEngine {
    fn mode(&self) -> SyncMode;

    /// Begin driving the engine (timer or polling). Idempotent.
    fn start(&self);

    /// Stop driving the engine. Idempotent.
    fn stop(&self);

    /// The last notified state. Never fetches.
    fn state(&self) -> ReconciliationState;

    fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Cancel every timer, stop polling and drop all subscribers.
    fn teardown(&self);

    fn play(&self) {
        unsupported(self.mode(), "play");
    }

    fn pause(&self) {
        unsupported(self.mode(), "pause");
    }

    fn next(&self) {
        unsupported(self.mode(), "next");
    }

    fn reset(&self) {
        unsupported(self.mode(), "reset");
    }

    fn set_speed(&self, _speed: f64) {
        unsupported(self.mode(), "set_speed");
    }

    fn confirm(&self) {
        unsupported(self.mode(), "confirm");
    }

    fn deny(&self) {
        unsupported(self.mode(), "deny");
    }

    fn submit_query(&self, _input: &str) {
        unsupported(self.mode(), "submit_query");
    }
}

// ============================================================================
// Factory
// ============================================================================

pub struct EngineOptions {
    /// Scenario to replay; defaults to the workflow's first.
    pub scenario: Option<String>,
    /// Overrides the workflow's declared sync mode.
    pub mode: Option<SyncMode>,
    /// Where live engines read snapshots from.
    pub source: Option<Rc<dyn SnapshotSource>>,
    pub timing: TimingConfig,
    pub clock: Rc<dyn Clock>,
    pub speed: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            scenario: None,
            mode: None,
            source: None,
            timing: TimingConfig::default(),
            clock: Rc::new(SystemClock),
            speed: 1.0,
        }
    }
}

/// Pick the engine variant once, at construction.
///
/// A live mode without a snapshot source falls back to scripted replay.
pub fn build_engine(
    workflow: Rc<WorkflowDefinition>,
    options: EngineOptions,
) -> Result<Box<dyn VisualizerEngine>, VisualizerError> {
    let mode = if options.scenario.is_some() && options.mode.is_none() {
        SyncMode::Scripted
    } else {
        options.mode.unwrap_or(workflow.sync_mode)
    };

    let source = match (mode, options.source) {
        (SyncMode::Scripted, _) => None,
        (_, Some(source)) => Some(source),
        (_, None) => {
            tracing::warn!(
                workflow = %workflow.id,
                mode = %mode,
                "No snapshot source configured; falling back to scripted replay"
            );
            None
        }
    };

    let engine: Box<dyn VisualizerEngine> = match (mode, source) {
        (SyncMode::LivePoll, Some(source)) => {
            Box::new(PollEngine::new(workflow, source, options.timing))
        }
        (SyncMode::LiveStream, Some(source)) => Box::new(StreamEngine::new(
            workflow,
            source,
            options.timing,
            options.clock,
        )),
        _ => {
            let scenario = match options.scenario.as_deref() {
                Some(id) => workflow.scenario(id).cloned().ok_or_else(|| {
                    VisualizerError::UnknownScenario {
                        workflow: workflow.id.clone(),
                        scenario: id.to_string(),
                    }
                })?,
                None => workflow
                    .default_scenario()
                    .cloned()
                    .ok_or_else(|| VisualizerError::NoScenario(workflow.id.clone()))?,
            };
            Box::new(
                ScriptedEngine::new(workflow, scenario, options.timing).with_speed(options.speed),
            )
        }
    };
    Ok(engine)
}

/// Owns at most one engine. Replacing or clearing tears the old engine down
/// before anything else happens, so two engines never race.
#[derive(Default)]
pub struct EngineSlot {
    engine: Option<Box<dyn VisualizerEngine>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, engine: Box<dyn VisualizerEngine>) -> &dyn VisualizerEngine {
        self.clear();
        &**self.engine.insert(engine)
    }

    pub fn get(&self) -> Option<&dyn VisualizerEngine> {
        self.engine.as_deref()
    }

    pub fn clear(&mut self) {
        if let Some(old) = self.engine.take() {
            tracing::debug!(mode = %old.mode(), "Tearing down engine");
            old.teardown();
        }
    }
}

impl Drop for EngineSlot {
    fn drop(&mut self) {
        self.clear();
    }
}
