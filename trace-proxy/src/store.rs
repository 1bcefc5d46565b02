//! Snapshot store: the latest run per workflow.
//!
//! The in-memory store lives in one process and is lost on restart. A
//! deployment with several proxy instances needs an external key-value
//! implementation of [`SnapshotStore`] so every instance serves the same
//! `latest`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use shared_types::TraceSnapshot;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Mutation applied to a stored snapshot under the store's lock.
pub type SnapshotUpdate = Box<dyn FnOnce(&mut TraceSnapshot) + Send>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreStats {
    pub cached_workflows: usize,
    pub total_steps: usize,
    pub finished_runs: usize,
    pub latest_run_id: Option<String>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, workflow: &str) -> Option<TraceSnapshot>;

    /// Replace the workflow's current run.
    async fn set(&self, workflow: &str, snapshot: TraceSnapshot);

    /// Mutate the workflow's run only while it is still `run_id`. A superseded
    /// run is never written to.
    async fn update_run(
        &self,
        workflow: &str,
        run_id: &str,
        update: SnapshotUpdate,
    ) -> Result<TraceSnapshot, StoreError>;

    /// The most recently written run across all workflows.
    async fn latest(&self) -> Option<TraceSnapshot>;

    /// Returns whether anything was removed.
    async fn clear(&self, workflow: &str) -> bool;

    async fn stats(&self) -> StoreStats;
}

struct Entry {
    /// Write order, for `latest`.
    seq: u64,
    snapshot: TraceSnapshot,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    inner: RwLock<Inner>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, workflow: &str) -> Option<TraceSnapshot> {
        self.inner
            .read()
            .await
            .entries
            .get(workflow)
            .map(|entry| entry.snapshot.clone())
    }

    async fn set(&self, workflow: &str, snapshot: TraceSnapshot) {
        let mut inner = self.inner.write().await;
        let seq = inner.bump();
        tracing::debug!(workflow, run_id = %snapshot.run_id, steps = snapshot.steps.len(), "Snapshot stored");
        inner
            .entries
            .insert(workflow.to_string(), Entry { seq, snapshot });
    }

    async fn update_run(
        &self,
        workflow: &str,
        run_id: &str,
        update: SnapshotUpdate,
    ) -> Result<TraceSnapshot, StoreError> {
        let mut inner = self.inner.write().await;
        let seq = inner.bump();
        let entry = inner
            .entries
            .get_mut(workflow)
            .ok_or_else(|| StoreError::Missing(workflow.to_string()))?;
        if entry.snapshot.run_id != run_id {
            return Err(StoreError::Superseded {
                run_id: run_id.to_string(),
                current: entry.snapshot.run_id.clone(),
            });
        }
        update(&mut entry.snapshot);
        entry.seq = seq;
        Ok(entry.snapshot.clone())
    }

    async fn latest(&self) -> Option<TraceSnapshot> {
        self.inner
            .read()
            .await
            .entries
            .values()
            .max_by_key(|entry| entry.seq)
            .map(|entry| entry.snapshot.clone())
    }

    async fn clear(&self, workflow: &str) -> bool {
        self.inner.write().await.entries.remove(workflow).is_some()
    }

    async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        StoreStats {
            cached_workflows: inner.entries.len(),
            total_steps: inner
                .entries
                .values()
                .map(|entry| entry.snapshot.steps.len())
                .sum(),
            finished_runs: inner
                .entries
                .values()
                .filter(|entry| entry.snapshot.is_finished())
                .count(),
            latest_run_id: inner
                .entries
                .values()
                .max_by_key(|entry| entry.seq)
                .map(|entry| entry.snapshot.run_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared_types::{StepStatus, TraceStep};

    fn snapshot(run_id: &str) -> TraceSnapshot {
        TraceSnapshot::new(run_id, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
    }

    #[tokio::test]
    async fn test_update_run_applies_to_current_run() {
        let store = InMemorySnapshotStore::new();
        store.set("rag-pipeline", snapshot("r1")).await;

        let updated = store
            .update_run(
                "rag-pipeline",
                "r1",
                Box::new(|snapshot| {
                    let at = snapshot.created_at;
                    snapshot.upsert_step(TraceStep::new("checking", "checking", StepStatus::Running, at));
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.steps.len(), 1);
        assert_eq!(store.get("rag-pipeline").await, Some(updated));
    }

    #[tokio::test]
    async fn test_superseded_run_is_not_mutated() {
        let store = InMemorySnapshotStore::new();
        store.set("rag-pipeline", snapshot("r1")).await;
        store.set("rag-pipeline", snapshot("r2")).await;

        let result = store
            .update_run(
                "rag-pipeline",
                "r1",
                Box::new(|snapshot| snapshot.final_output = Some("late".to_string())),
            )
            .await;
        assert_eq!(
            result,
            Err(StoreError::Superseded {
                run_id: "r1".to_string(),
                current: "r2".to_string(),
            })
        );
        let current = store.get("rag-pipeline").await.unwrap();
        assert_eq!(current.run_id, "r2");
        assert_eq!(current.final_output, None);

        assert_eq!(
            store
                .update_run("llm-router", "r1", Box::new(|_| {}))
                .await,
            Err(StoreError::Missing("llm-router".to_string()))
        );
    }

    #[tokio::test]
    async fn test_latest_follows_most_recent_write() {
        let store = InMemorySnapshotStore::new();
        assert!(store.latest().await.is_none());

        store.set("llm-router", snapshot("a")).await;
        store.set("rag-pipeline", snapshot("b")).await;
        assert_eq!(store.latest().await.map(|s| s.run_id), Some("b".to_string()));

        store
            .update_run("llm-router", "a", Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(store.latest().await.map(|s| s.run_id), Some("a".to_string()));

        let stats = store.stats().await;
        assert_eq!(stats.cached_workflows, 2);
        assert_eq!(stats.latest_run_id.as_deref(), Some("a"));

        assert!(store.clear("llm-router").await);
        assert!(!store.clear("llm-router").await);
        assert_eq!(store.latest().await.map(|s| s.run_id), Some("b".to_string()));
    }
}
