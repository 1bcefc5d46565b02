//! Trace transport: snapshot fetching, the polling loop and run tracking.
//!
//! The proxy's snapshot store is the state of record. Run submission only
//! kicks the upstream off; everything the engines see arrives through
//! `fetch_latest`.

mod http;

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use shared_types::{RunAck, RunRequest, TraceSnapshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::TransportError;

pub use http::HttpSnapshotSource;

/// What `POST {base}/run` answered with.
#[derive(Debug)]
pub enum RunSubmission {
    Ack(Option<RunAck>),
    /// An event-stream body. The submitter drains and discards it.
    Streaming(StreamDrain),
}

/// Reads a streamed run body to the end, holding the connection open until
/// the proxy closes it. Dropping it closes the connection.
pub struct StreamDrain(LocalBoxFuture<'static, usize>);

impl StreamDrain {
    pub fn new(drain: impl Future<Output = usize> + 'static) -> Self {
        Self(drain.boxed_local())
    }

    /// Resolves with the number of bytes read.
    pub async fn finish(self) -> usize {
        self.0.await
    }
}

impl fmt::Debug for StreamDrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamDrain")
    }
}

#[async_trait(?Send)]
pub trait SnapshotSource {
    /// `Ok(None)` when no run exists yet.
    async fn fetch_latest(&self) -> Result<Option<TraceSnapshot>, TransportError>;

    async fn submit_run(&self, request: &RunRequest) -> Result<RunSubmission, TransportError>;
}

pub type SnapshotCallback = Rc<dyn Fn(TraceSnapshot, bool)>;
pub type ErrorCallback = Rc<dyn Fn(&TransportError)>;

struct TransportInner {
    source: Rc<dyn SnapshotSource>,
    interval: Duration,
    last_run_id: Rc<RefCell<Option<String>>>,
    poller: RefCell<Option<JoinHandle<()>>>,
    submission: RefCell<Option<JoinHandle<()>>>,
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.submission.get_mut().take() {
            handle.abort();
        }
    }
}

/// Fail-soft wrapper over a [`SnapshotSource`].
///
/// Must be used from within a tokio `LocalSet`: the polling loop and
/// background submissions are `spawn_local` tasks.
#[derive(Clone)]
pub struct TraceTransport {
    inner: Rc<TransportInner>,
}

impl TraceTransport {
    pub fn new(source: Rc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self {
            inner: Rc::new(TransportInner {
                source,
                interval,
                last_run_id: Rc::new(RefCell::new(None)),
                poller: RefCell::new(None),
                submission: RefCell::new(None),
            }),
        }
    }

    /// One round trip. Every failure resolves to `None`.
    pub async fn fetch_latest(&self) -> Option<TraceSnapshot> {
        match self.inner.source.fetch_latest().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot fetch failed");
                None
            }
        }
    }

    /// Begin the fixed-interval poll loop. No-op when already polling.
    pub fn start_polling(&self, on_snapshot: SnapshotCallback, on_error: ErrorCallback) {
        if self.is_polling() {
            tracing::debug!("Polling already active");
            return;
        }

        let source = self.inner.source.clone();
        let last_run_id = self.inner.last_run_id.clone();
        let period = self.inner.interval;
        let handle = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match source.fetch_latest().await {
                    Ok(Some(snapshot)) => {
                        let is_new_run = {
                            let mut last = last_run_id.borrow_mut();
                            let is_new = last.as_deref() != Some(snapshot.run_id.as_str());
                            if is_new {
                                *last = Some(snapshot.run_id.clone());
                            }
                            is_new
                        };
                        on_snapshot(snapshot, is_new_run);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Snapshot poll failed");
                        on_error(&e);
                    }
                }
            }
        });
        *self.inner.poller.borrow_mut() = Some(handle);
        tracing::debug!(interval_ms = period.as_millis() as u64, "Polling started");
    }

    /// Idempotent.
    pub fn stop_polling(&self) {
        if let Some(handle) = self.inner.poller.borrow_mut().take() {
            handle.abort();
            tracing::debug!("Polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .borrow()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Submit a run and poll for its state whatever the response shape.
    pub fn start_query(
        &self,
        request: RunRequest,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) {
        if let Some(previous) = self.inner.submission.borrow_mut().take() {
            previous.abort();
        }

        let source = self.inner.source.clone();
        let submit_error = on_error.clone();
        let handle = tokio::task::spawn_local(async move {
            match source.submit_run(&request).await {
                Ok(RunSubmission::Ack(ack)) => {
                    tracing::info!(
                        run_id = ack.as_ref().map(|ack| ack.run_id.as_str()).unwrap_or(""),
                        "Run submitted"
                    );
                }
                Ok(RunSubmission::Streaming(drain)) => {
                    tracing::info!("Run submitted, stream body is advisory");
                    let bytes = drain.finish().await;
                    tracing::debug!(bytes, "Run stream drained");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Run submission failed");
                    submit_error(&e);
                }
            }
        });
        *self.inner.submission.borrow_mut() = Some(handle);

        self.start_polling(on_snapshot, on_error);
    }

    /// Stop polling and abandon any in-flight submission, closing its
    /// stream if one is still open.
    pub fn shutdown(&self) {
        self.stop_polling();
        if let Some(handle) = self.inner.submission.borrow_mut().take() {
            handle.abort();
        }
    }
}

/// How a snapshot relates to the run currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunChange {
    New,
    Same,
    /// An older run arriving late. Must not be applied.
    Stale,
}

#[derive(Debug, Default)]
pub struct RunTracker {
    current: Option<(String, DateTime<Utc>)>,
    retired: HashSet<String>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, snapshot: &TraceSnapshot) -> RunChange {
        let change = match &self.current {
            Some((run_id, _)) if *run_id == snapshot.run_id => RunChange::Same,
            Some((_, created_at))
                if self.retired.contains(&snapshot.run_id) || snapshot.created_at < *created_at =>
            {
                RunChange::Stale
            }
            _ => RunChange::New,
        };

        if change == RunChange::New {
            if let Some((previous, _)) = self
                .current
                .replace((snapshot.run_id.clone(), snapshot.created_at))
            {
                self.retired.insert(previous);
            }
        }
        change
    }

    pub fn current_run_id(&self) -> Option<&str> {
        self.current.as_ref().map(|(run_id, _)| run_id.as_str())
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.retired.clear();
    }
}
