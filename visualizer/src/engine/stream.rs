//! Stream-cutoff live engine.
//!
//! A step is revealed once `now - created_at` reaches its offset, so the
//! graph keeps animating between two fetches. A reveal ticker re-evaluates
//! the cutoff and notifies only when the picture changes.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use shared_types::{RunRequest, SyncMode, TraceSnapshot, WorkflowDefinition};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::live::{log_transport_error, render_run, LiveSession};
use super::{Delivery, Hub, ReconciliationState, Subscriber, SubscriptionId, VisualizerEngine};
use crate::clock::Clock;
use crate::config::TimingConfig;
use crate::reconcile::{cutoff_visible, synthesize_running};
use crate::transport::{SnapshotCallback, SnapshotSource, TraceTransport};

pub struct StreamEngine {
    inner: Rc<RefCell<StreamInner>>,
    transport: TraceTransport,
}

struct StreamInner {
    workflow: Rc<WorkflowDefinition>,
    session: LiveSession,
    clock: Rc<dyn Clock>,
    running_gap_ms: i64,
    reveal_interval: Duration,
    polling: bool,
    ticker: Option<JoinHandle<()>>,
    hub: Hub,
}

impl StreamInner {
    fn build_state(&self) -> ReconciliationState {
        let Some(run) = self.session.run() else {
            return render_run(&self.workflow, SyncMode::LiveStream, None, &[], 0, self.polling);
        };

        let visible = cutoff_visible(&run.steps, run.created_at, self.clock.now());
        let mut steps = run.steps.clone();
        let mut cursor = visible;
        if let Some(running) = synthesize_running(&run.steps, visible, self.running_gap_ms) {
            steps.insert(visible, running);
            cursor += 1;
        }
        render_run(
            &self.workflow,
            SyncMode::LiveStream,
            Some(run),
            &steps,
            cursor,
            self.polling,
        )
    }

    fn refresh(&mut self) -> Option<Delivery> {
        let state = self.build_state();
        self.hub.publish_if_changed(state)
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

fn send(delivery: Option<Delivery>) {
    if let Some(delivery) = delivery {
        delivery.send();
    }
}

fn snapshot_callback(weak: Weak<RefCell<StreamInner>>) -> SnapshotCallback {
    Rc::new(move |snapshot: TraceSnapshot, _is_new_run: bool| {
        if let Some(inner) = weak.upgrade() {
            apply_snapshot(&inner, snapshot);
        }
    })
}

fn apply_snapshot(inner: &Rc<RefCell<StreamInner>>, snapshot: TraceSnapshot) {
    let delivery = {
        let mut inner = inner.borrow_mut();
        let workflow = inner.workflow.clone();
        if !inner.session.absorb(&workflow, snapshot) {
            return;
        }
        inner.refresh()
    };
    send(delivery);
}

fn start_ticker(handle: &Rc<RefCell<StreamInner>>) {
    let weak = Rc::downgrade(handle);
    let mut inner = handle.borrow_mut();
    if inner.ticker.is_some() {
        return;
    }
    let period = inner.reveal_interval;
    inner.ticker = Some(tokio::task::spawn_local(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(handle) = weak.upgrade() else {
                break;
            };
            let delivery = handle.borrow_mut().refresh();
            send(delivery);
        }
    }));
}

impl StreamEngine {
    pub fn new(
        workflow: Rc<WorkflowDefinition>,
        source: Rc<dyn SnapshotSource>,
        timing: TimingConfig,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let initial = ReconciliationState::initial(&workflow, SyncMode::LiveStream);
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                workflow,
                session: LiveSession::default(),
                clock,
                running_gap_ms: timing.running_gap.as_millis() as i64,
                reveal_interval: timing.reveal_interval,
                polling: false,
                ticker: None,
                hub: Hub::new(initial),
            })),
            transport: TraceTransport::new(source, timing.poll_interval),
        }
    }

    /// Apply a snapshot directly, as if it had been polled.
    pub fn ingest(&self, snapshot: TraceSnapshot) {
        apply_snapshot(&self.inner, snapshot);
    }

    /// Re-evaluate the cutoff now instead of waiting for the ticker.
    pub fn reveal(&self) {
        let delivery = self.inner.borrow_mut().refresh();
        send(delivery);
    }

    pub fn is_polling(&self) -> bool {
        self.transport.is_polling()
    }

    fn workflow_id(&self) -> String {
        self.inner.borrow().workflow.id.clone()
    }

    fn set_polling(&self, polling: bool) {
        let delivery = {
            let mut inner = self.inner.borrow_mut();
            inner.polling = polling;
            if !polling {
                inner.stop_ticker();
            }
            inner.refresh()
        };
        if polling {
            start_ticker(&self.inner);
        }
        send(delivery);
    }
}

impl VisualizerEngine for StreamEngine {
    fn mode(&self) -> SyncMode {
        SyncMode::LiveStream
    }

    fn start(&self) {
        self.transport.start_polling(
            snapshot_callback(Rc::downgrade(&self.inner)),
            log_transport_error(self.workflow_id()),
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
        inner.stop_ticker();
        inner.polling = false;
        inner.hub.clear_subscribers();
    }

    fn submit_query(&self, input: &str) {
        let input = input.trim();
        if input.is_empty() {
            tracing::warn!("Ignoring empty query");
            return;
        }
        let request = RunRequest {
            stream: true,
            ..RunRequest::query(input)
        };
        self.transport.start_query(
            request,
            snapshot_callback(Rc::downgrade(&self.inner)),
            log_transport_error(self.workflow_id()),
        );
        self.set_polling(true);
    }
}
