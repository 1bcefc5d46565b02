#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared_types::{
    Connection, NodeKind, NodePosition, RunAck, RunRequest, Scenario, ScenarioEvent, StepStatus,
    SyncMode, TraceSnapshot, TraceStep, WorkflowDefinition, WorkflowNode,
};
use visualizer::engine::{ReconciliationState, Subscriber};
use visualizer::transport::{RunSubmission, SnapshotSource};
use visualizer::TransportError;

pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

pub fn step(id: &str, step_type: &str, status: StepStatus, ms: i64) -> TraceStep {
    TraceStep::new(id, step_type, status, at(ms))
}

pub fn snapshot(run_id: &str, created_ms: i64, steps: Vec<TraceStep>) -> TraceSnapshot {
    let mut snapshot = TraceSnapshot::new(run_id, at(created_ms));
    for step in steps {
        snapshot.upsert_step(step);
    }
    snapshot
}

fn node(id: &str, kind: NodeKind) -> WorkflowNode {
    WorkflowNode {
        id: id.to_string(),
        label: id.to_string(),
        icon: String::new(),
        position: NodePosition::default(),
        kind,
    }
}

/// intake -> classify -> output, one step type per node.
pub fn three_node_workflow(mode: SyncMode) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "three".to_string(),
        title: "Three nodes".to_string(),
        sync_mode: mode,
        nodes: vec![
            node("intake", NodeKind::Intake),
            node("classify", NodeKind::Classification),
            node("output", NodeKind::Output),
        ],
        connections: vec![
            Connection::new("intake", "classify"),
            Connection::new("classify", "output"),
        ],
        step_map: BTreeMap::from([
            ("intake".to_string(), "intake".to_string()),
            ("classify".to_string(), "classify".to_string()),
            ("output".to_string(), "output".to_string()),
        ]),
        choice_map: BTreeMap::new(),
        repeating_step_types: Vec::new(),
        scenarios: vec![three_event_scenario()],
    }
}

/// `[intake@0, classify@100 running, output@300]`; `output` is off-branch.
pub fn three_event_scenario() -> Scenario {
    Scenario {
        id: "three-events".to_string(),
        title: "Three events".to_string(),
        input: "hello".to_string(),
        active_nodes: vec!["intake".to_string(), "classify".to_string()],
        chosen_nodes: Vec::new(),
        events: vec![
            ScenarioEvent::new("e1", "intake", "Intake", 0, &["intake"]),
            ScenarioEvent::new("e2", "classify", "Classify", 100, &["classify"])
                .with_status(StepStatus::Running),
            ScenarioEvent::new("e3", "output", "Output", 300, &["output"]),
        ],
        chat: Vec::new(),
    }
}

/// Collects every notified state.
pub fn recorder() -> (Subscriber, Rc<RefCell<Vec<ReconciliationState>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let subscriber: Subscriber = Rc::new(move |state: &ReconciliationState| {
        sink.borrow_mut().push(state.clone());
    });
    (subscriber, seen)
}

/// Scripted snapshot source. Replays queued responses, then repeats the last.
#[derive(Default)]
pub struct StubSource {
    responses: RefCell<VecDeque<Result<Option<TraceSnapshot>, TransportError>>>,
    last: RefCell<Option<Result<Option<TraceSnapshot>, TransportError>>>,
    pub fetches: Cell<usize>,
    pub submitted: RefCell<Vec<RunRequest>>,
}

impl StubSource {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn push(&self, response: Result<Option<TraceSnapshot>, TransportError>) {
        self.responses.borrow_mut().push_back(response);
    }

    pub fn push_snapshot(&self, snapshot: TraceSnapshot) {
        self.push(Ok(Some(snapshot)));
    }
}

#[async_trait(?Send)]
impl SnapshotSource for StubSource {
    async fn fetch_latest(&self) -> Result<Option<TraceSnapshot>, TransportError> {
        self.fetches.set(self.fetches.get() + 1);
        let next = self.responses.borrow_mut().pop_front();
        match next {
            Some(response) => {
                *self.last.borrow_mut() = Some(response.clone());
                response
            }
            None => self.last.borrow().clone().unwrap_or(Ok(None)),
        }
    }

    async fn submit_run(&self, request: &RunRequest) -> Result<RunSubmission, TransportError> {
        self.submitted.borrow_mut().push(request.clone());
        Ok(RunSubmission::Ack(Some(RunAck {
            run_id: "stub-run".to_string(),
            status: "accepted".to_string(),
        })))
    }
}
