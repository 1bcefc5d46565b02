//! Scripted replay of a canned scenario.
//!
//! `cursor` counts applied events; `events[cursor - 1]` is current. A tick
//! advances one event, then schedules the next tick after
//! [`step_delay`](crate::reconcile::step_delay). A running event on a
//! human-approval node stalls playback: no tick is scheduled until `confirm`
//! or `deny`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use shared_types::{NodeKind, Scenario, StepStatus, SyncMode, WorkflowDefinition};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    id_set, render_graph, Hub, ReconciliationState, Subscriber, SubscriptionId,
    VisualizerEngine,
};
use crate::config::TimingConfig;
use crate::reconcile::{
    clamp_speed, scripted_chat_visible, step_delay, StatusInput, StepTouch, TimelineEntry,
};

pub struct ScriptedEngine {
    inner: Rc<RefCell<ScriptedInner>>,
}

struct ScriptedInner {
    workflow: Rc<WorkflowDefinition>,
    scenario: Scenario,
    active_nodes: Option<HashSet<String>>,
    chosen_nodes: HashSet<String>,
    timing: TimingConfig,
    cursor: usize,
    is_playing: bool,
    speed: f64,
    /// Approval events confirmed this run; they report `completed`.
    approved: HashSet<usize>,
    /// Index of the approval event playback is stalled on.
    awaiting: Option<usize>,
    tick: Option<JoinHandle<()>>,
    /// When the pending tick fires.
    tick_deadline: Option<Instant>,
    hub: Hub,
}

impl ScriptedInner {
    fn total(&self) -> usize {
        self.scenario.events.len()
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.total()
    }

    fn finished(&self) -> bool {
        self.at_end() && self.awaiting.is_none()
    }

    fn event_status(&self, index: usize) -> StepStatus {
        if self.approved.contains(&index) {
            StepStatus::Completed
        } else {
            self.scenario.events[index].status
        }
    }

    fn approval_node(&self, index: usize) -> Option<&str> {
        self.scenario.events[index]
            .node_ids
            .iter()
            .find(|id| {
                self.workflow
                    .node(id)
                    .is_some_and(|node| node.kind == NodeKind::HumanApproval)
            })
            .map(String::as_str)
    }

    /// Apply the next event. Returns false at the end or while stalled.
    fn advance(&mut self) -> bool {
        if self.awaiting.is_some() || self.at_end() {
            return false;
        }
        let index = self.cursor;
        self.cursor += 1;

        if self.event_status(index) == StepStatus::Running {
            if let Some(node_id) = self.approval_node(index) {
                tracing::info!(
                    scenario = %self.scenario.id,
                    node = node_id,
                    "Awaiting approval"
                );
                self.awaiting = Some(index);
            }
        }
        if self.finished() {
            self.is_playing = false;
        }
        true
    }

    fn cancel_tick(&mut self) {
        self.tick_deadline = None;
        if let Some(handle) = self.tick.take() {
            handle.abort();
        }
    }

    fn rewind(&mut self) {
        self.cancel_tick();
        self.cursor = 0;
        self.is_playing = false;
        self.approved.clear();
        self.awaiting = None;
    }

    fn next_delay(&self) -> Option<Duration> {
        let events = &self.scenario.events;
        let next = events.get(self.cursor)?;
        let prev_ms = self
            .cursor
            .checked_sub(1)
            .map_or(0, |index| events[index].timing_ms);
        Some(step_delay(prev_ms, next.timing_ms, self.speed, &self.timing))
    }

    fn build_state(&self) -> ReconciliationState {
        let events = &self.scenario.events;
        let touches: Vec<StepTouch> = events
            .iter()
            .enumerate()
            .map(|(index, event)| StepTouch::from_event(event, self.event_status(index)))
            .collect();
        let input = StatusInput {
            workflow: &self.workflow,
            active_nodes: self.active_nodes.as_ref(),
            chosen_nodes: &self.chosen_nodes,
            touches: &touches,
            cursor: self.cursor,
        };
        let awaiting_node = self.awaiting.and_then(|index| self.approval_node(index));
        let graph = render_graph(&input, awaiting_node);

        let timeline: Vec<TimelineEntry> = events[..self.cursor]
            .iter()
            .enumerate()
            .map(|(index, event)| {
                TimelineEntry::from_event(&self.workflow, event, self.event_status(index))
            })
            .collect();
        let cutoff_ms = self
            .cursor
            .checked_sub(1)
            .map(|index| events[index].timing_ms);

        ReconciliationState {
            workflow_id: self.workflow.id.clone(),
            mode: SyncMode::Scripted,
            run_id: Some(self.scenario.id.clone()),
            cursor: self.cursor,
            total: self.total(),
            is_playing: self.is_playing,
            speed: self.speed,
            nodes: graph.nodes,
            connections: graph.connections,
            visible_step_ids: timeline.iter().map(|entry| entry.id.clone()).collect(),
            current_event: timeline.last().cloned(),
            timeline,
            chat: scripted_chat_visible(&self.scenario, cutoff_ms),
            highlighted_path: graph.highlighted_path,
            awaiting_approval: awaiting_node.map(str::to_string),
            finished: self.finished(),
            revision: 0,
        }
    }

    fn publish(&mut self) -> super::Delivery {
        let state = self.build_state();
        self.hub.publish(state)
    }
}

impl Drop for ScriptedInner {
    fn drop(&mut self) {
        self.cancel_tick();
    }
}

/// Arm the next tick if playback should continue. Any pending tick is
/// cancelled first.
fn schedule_tick(handle: &Rc<RefCell<ScriptedInner>>) {
    let delay = {
        let mut inner = handle.borrow_mut();
        inner.cancel_tick();
        if !inner.is_playing || inner.awaiting.is_some() {
            return;
        }
        inner.next_delay()
    };
    if let Some(delay) = delay {
        arm_tick(handle, delay);
    }
}

fn arm_tick(handle: &Rc<RefCell<ScriptedInner>>, delay: Duration) {
    let weak = Rc::downgrade(handle);
    let mut inner = handle.borrow_mut();
    inner.cancel_tick();
    inner.tick_deadline = Some(Instant::now() + delay);
    inner.tick = Some(tokio::task::spawn_local(async move {
        tokio::time::sleep(delay).await;
        if let Some(handle) = weak.upgrade() {
            on_tick(&handle);
        }
    }));
}

fn on_tick(handle: &Rc<RefCell<ScriptedInner>>) {
    let delivery = {
        let mut inner = handle.borrow_mut();
        inner.tick = None;
        inner.tick_deadline = None;
        if !inner.is_playing || !inner.advance() {
            return;
        }
        inner.publish()
    };
    schedule_tick(handle);
    delivery.send();
}

impl ScriptedEngine {
    pub fn new(workflow: Rc<WorkflowDefinition>, scenario: Scenario, timing: TimingConfig) -> Self {
        let active_nodes = (!scenario.active_nodes.is_empty()).then(|| id_set(&scenario.active_nodes));
        let chosen_nodes = id_set(&scenario.chosen_nodes);
        let initial = ReconciliationState::initial(&workflow, SyncMode::Scripted);
        let mut inner = ScriptedInner {
            workflow,
            scenario,
            active_nodes,
            chosen_nodes,
            timing,
            cursor: 0,
            is_playing: false,
            speed: 1.0,
            approved: HashSet::new(),
            awaiting: None,
            tick: None,
            tick_deadline: None,
            hub: Hub::new(initial),
        };
        let state = inner.build_state();
        inner.hub.seed(state);
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Initial playback speed, applied without a notification.
    pub fn with_speed(self, speed: f64) -> Self {
        {
            let mut inner = self.inner.borrow_mut();
            inner.speed = clamp_speed(speed).unwrap_or(1.0);
            let state = inner.build_state();
            inner.hub.seed(state);
        }
        self
    }

    pub fn scenario_id(&self) -> String {
        self.inner.borrow().scenario.id.clone()
    }

    /// Publish the current state after `mutate` and re-arm the timer.
    fn update(&self, mutate: impl FnOnce(&mut ScriptedInner) -> bool) {
        let delivery = {
            let mut inner = self.inner.borrow_mut();
            if !mutate(&mut inner) {
                return;
            }
            inner.publish()
        };
        schedule_tick(&self.inner);
        delivery.send();
    }
}

impl VisualizerEngine for ScriptedEngine {
    fn mode(&self) -> SyncMode {
        SyncMode::Scripted
    }

    fn start(&self) {
        self.play();
    }

    fn stop(&self) {
        self.pause();
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
        let mut inner = self.inner.borrow_mut();
        inner.cancel_tick();
        inner.is_playing = false;
        inner.hub.clear_subscribers();
    }

    fn play(&self) {
        self.update(|inner| {
            if inner.is_playing {
                tracing::debug!("Already playing");
                return false;
            }
            if inner.at_end() {
                inner.rewind();
            }
            inner.is_playing = true;
            if inner.cursor == 0 {
                inner.advance();
            }
            true
        });
    }

    fn pause(&self) {
        self.update(|inner| {
            if !inner.is_playing {
                return false;
            }
            inner.cancel_tick();
            inner.is_playing = false;
            true
        });
    }

    fn next(&self) {
        self.update(|inner| {
            if inner.awaiting.is_some() {
                tracing::warn!("Awaiting approval; confirm or deny to continue");
                return false;
            }
            if inner.at_end() {
                tracing::warn!("Already at the last event");
                return false;
            }
            inner.advance()
        });
    }

    fn reset(&self) {
        self.update(|inner| {
            inner.rewind();
            true
        });
    }

    /// A pending tick keeps its deadline; only the time left is rescaled.
    fn set_speed(&self, speed: f64) {
        let Some(clamped) = clamp_speed(speed) else {
            tracing::warn!(speed, "Ignoring non-finite playback speed");
            return;
        };
        let (delivery, rearm) = {
            let mut inner = self.inner.borrow_mut();
            let previous = inner.speed;
            inner.speed = clamped;
            let rearm = inner.tick_deadline.map(|deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .mul_f64(previous / clamped)
            });
            (inner.publish(), rearm)
        };
        if let Some(remaining) = rearm {
            arm_tick(&self.inner, remaining);
        }
        delivery.send();
    }

    fn confirm(&self) {
        self.update(|inner| {
            let Some(index) = inner.awaiting.take() else {
                tracing::warn!("Nothing awaiting approval");
                return false;
            };
            inner.approved.insert(index);
            inner.advance();
            if inner.finished() {
                inner.is_playing = false;
            }
            true
        });
    }

    fn deny(&self) {
        self.update(|inner| {
            if inner.awaiting.is_none() {
                tracing::warn!("Nothing awaiting approval");
                return false;
            }
            tracing::info!(scenario = %inner.scenario.id, "Approval denied; resetting");
            inner.rewind();
            true
        });
    }
}
