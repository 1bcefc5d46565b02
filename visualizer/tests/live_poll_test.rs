mod common;

use std::rc::Rc;
use std::time::Duration;

use shared_types::{catalog, ChatRole, NodeStatus, RunState, StepStatus, SyncMode};
use tokio::task::LocalSet;
use tokio::time::sleep;
use visualizer::config::TimingConfig;
use visualizer::engine::{PollEngine, VisualizerEngine};
use visualizer::TransportError;

use common::{recorder, snapshot, step, three_node_workflow, StubSource};

fn three_node_engine() -> PollEngine {
    PollEngine::new(
        Rc::new(three_node_workflow(SyncMode::LivePoll)),
        StubSource::new(),
        TimingConfig::default(),
    )
}

fn rag_engine() -> PollEngine {
    PollEngine::new(
        Rc::new(catalog::rag_pipeline()),
        StubSource::new(),
        TimingConfig::default(),
    )
}

fn router_engine() -> PollEngine {
    PollEngine::new(
        Rc::new(catalog::llm_router()),
        StubSource::new(),
        TimingConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_same_run_extends_without_reset() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let source = StubSource::new();
            source.push_snapshot(snapshot(
                "r1",
                0,
                vec![step("s1", "intake", StepStatus::Completed, 10)],
            ));
            source.push_snapshot(snapshot(
                "r1",
                0,
                vec![
                    step("s1", "intake", StepStatus::Completed, 10),
                    step("s2", "classify", StepStatus::Running, 20),
                ],
            ));
            let engine = PollEngine::new(
                Rc::new(three_node_workflow(SyncMode::LivePoll)),
                source.clone(),
                TimingConfig::default(),
            );

            engine.start();
            sleep(Duration::from_millis(10)).await;
            let first = engine.state();
            assert_eq!(first.run_id.as_deref(), Some("r1"));
            assert_eq!(first.visible_step_ids, vec!["s1"]);
            assert_eq!(first.node_status("intake"), Some(NodeStatus::Completed));
            assert!(first.is_playing);

            sleep(Duration::from_millis(1000)).await;
            let second = engine.state();
            assert_eq!(second.visible_step_ids, vec!["s1", "s2"]);
            assert_eq!(second.node_status("classify"), Some(NodeStatus::Active));
            assert_eq!(second.node_status("intake"), Some(NodeStatus::Completed));
            assert_eq!(second.node_status("output"), Some(NodeStatus::Dormant));
            assert_eq!(source.fetches.get(), 2);

            engine.stop();
            assert!(!engine.is_polling());
            assert!(!engine.state().is_playing);
        })
        .await;
}

#[test]
fn test_run_switch_resets_previous_run() {
    let engine = router_engine();
    let mut finished = snapshot(
        "r1",
        0,
        vec![
            step("request_received", "request_received", StepStatus::Completed, 10),
            step("model_large", "model_large", StepStatus::Completed, 400),
            step("response", "response", StepStatus::Completed, 900),
        ],
    );
    finished.selected_choice = Some("large".to_string());
    finished.final_output = Some("done".to_string());
    engine.ingest(finished);
    assert_eq!(engine.state().node_status("model-large"), Some(NodeStatus::Chosen));

    engine.ingest(snapshot("r2", 5_000, Vec::new()));
    let state = engine.state();
    assert_eq!(state.run_id.as_deref(), Some("r2"));
    assert!(state.timeline.is_empty());
    assert!(state.chat.is_empty());
    assert!(!state.finished);
    assert!(state
        .nodes
        .iter()
        .all(|node| matches!(node.status, NodeStatus::Dormant | NodeStatus::Upcoming)));
}

#[test]
fn test_stale_run_is_discarded() {
    let engine = three_node_engine();
    engine.ingest(snapshot("r1", 0, vec![step("s1", "intake", StepStatus::Completed, 10)]));
    engine.ingest(snapshot("r2", 1_000, vec![step("t1", "intake", StepStatus::Running, 1_010)]));
    let current = engine.state();

    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s1", "intake", StepStatus::Completed, 10),
            step("s2", "classify", StepStatus::Completed, 20),
        ],
    ));
    engine.ingest(snapshot("r0", -5_000, Vec::new()));

    assert_eq!(engine.state(), current);
    assert_eq!(engine.state().run_id.as_deref(), Some("r2"));
}

#[test]
fn test_duplicate_step_collapses_to_latest_status() {
    let engine = three_node_engine();
    engine.ingest(snapshot("r1", 0, vec![step("s1", "intake", StepStatus::Running, 10)]));
    engine.ingest(snapshot("r1", 0, vec![step("s1", "intake", StepStatus::Completed, 10)]));

    let state = engine.state();
    assert_eq!(state.timeline.len(), 1);
    assert_eq!(state.timeline[0].status, StepStatus::Completed);
    assert_eq!(
        state.chat.iter().filter(|e| e.role == ChatRole::System).count(),
        1
    );
}

#[test]
fn test_visibility_is_monotonic_within_a_run() {
    let engine = three_node_engine();
    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s1", "intake", StepStatus::Completed, 10),
            step("s2", "classify", StepStatus::Completed, 20),
        ],
    ));
    let before = engine.state().visible_step_ids;

    // A later fetch that omits s1 must not hide it.
    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s2", "classify", StepStatus::Completed, 20),
            step("s3", "output", StepStatus::Running, 30),
        ],
    ));
    let after = engine.state().visible_step_ids;
    assert!(before.iter().all(|id| after.contains(id)));
    assert_eq!(after, vec!["s1", "s2", "s3"]);
}

#[test]
fn test_timeline_sorted_regardless_of_arrival_order() {
    let engine = three_node_engine();
    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s3", "output", StepStatus::Completed, 300),
            step("s1", "intake", StepStatus::Completed, 100),
        ],
    ));
    engine.ingest(snapshot("r1", 0, vec![step("s2", "classify", StepStatus::Completed, 200)]));

    let state = engine.state();
    assert_eq!(state.visible_step_ids, vec!["s1", "s2", "s3"]);
    assert!(state
        .timeline
        .windows(2)
        .all(|pair| pair[0].offset_ms <= pair[1].offset_ms));
}

#[test]
fn test_unmapped_steps_still_appear() {
    let engine = three_node_engine();
    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s1", "intake", StepStatus::Completed, 10),
            step("x", "cache_lookup", StepStatus::Completed, 20),
        ],
    ));
    let state = engine.state();
    assert_eq!(state.visible_step_ids, vec!["s1", "x"]);
    assert_eq!(state.timeline[1].node_id, None);
    assert!(state.chat.iter().any(|e| e.id == "system:cache_lookup"));
}

#[test]
fn test_upstream_error_marks_running_steps() {
    let engine = three_node_engine();
    engine.ingest(snapshot(
        "r1",
        0,
        vec![
            step("s1", "intake", StepStatus::Completed, 10),
            step("s2", "classify", StepStatus::Running, 20),
        ],
    ));
    let mut failed = snapshot("r1", 0, Vec::new());
    failed.error = Some("model unavailable".to_string());
    engine.ingest(failed);

    let state = engine.state();
    assert_eq!(state.node_status("classify"), Some(NodeStatus::Error));
    assert_eq!(state.timeline[1].status, StepStatus::Error);
    assert!(state.finished);
    let last = state.chat.last().unwrap();
    assert_eq!(last.role, ChatRole::Error);
    assert_eq!(last.text, "model unavailable");
}

#[test]
fn test_finished_run_marks_branch_and_choice() {
    let engine = router_engine();
    let mut run = snapshot(
        "r1",
        0,
        vec![
            step("model_small", "model_small", StepStatus::Pending, 0),
            step("model_code", "model_code", StepStatus::Pending, 0),
            step("request_received", "request_received", StepStatus::Completed, 10),
            step("task_classification", "task_classification", StepStatus::Completed, 100),
            step("routing_decision", "routing_decision", StepStatus::Completed, 200),
            step("model_large", "model_large", StepStatus::Running, 300),
        ],
    );
    run.user_query = Some("Explain locking".to_string());
    run.selected_choice = Some("meta/llama-3.1-70b-instruct".to_string());
    engine.ingest(run);

    let running = engine.state();
    assert_eq!(running.node_status("model-large"), Some(NodeStatus::Active));
    assert_eq!(running.node_status("model-small"), Some(NodeStatus::Upcoming));
    assert_eq!(running.node_status("response"), Some(NodeStatus::Dormant));

    let mut done = snapshot(
        "r1",
        0,
        vec![
            step("model_large", "model_large", StepStatus::Completed, 300),
            step("response", "response", StepStatus::Completed, 1_500),
        ],
    );
    done.final_output = Some("Use row locks.".to_string());
    done.state = Some(RunState::Completed);
    engine.ingest(done);

    let state = engine.state();
    assert!(state.finished);
    assert_eq!(state.node_status("model-large"), Some(NodeStatus::Chosen));
    assert_eq!(state.node_status("model-small"), Some(NodeStatus::Skipped));
    assert_eq!(state.node_status("model-code"), Some(NodeStatus::Skipped));
    assert_eq!(state.node_status("response"), Some(NodeStatus::Completed));
    assert_eq!(
        state.highlighted_path,
        vec!["request", "classifier", "router", "model-large", "response"]
    );
    assert_eq!(state.chat.first().map(|e| e.role), Some(ChatRole::User));
    assert_eq!(state.chat.last().map(|e| e.text.as_str()), Some("Use row locks."));
}

#[test]
fn test_streamed_answer_keeps_later_steps_on_branch() {
    let engine = rag_engine();
    let mut partial = snapshot(
        "r1",
        0,
        vec![
            step("suggestions", "suggestions", StepStatus::Pending, 0),
            step("checking", "checking", StepStatus::Completed, 100),
            step("generating", "generating", StepStatus::Completed, 2_000),
        ],
    );
    partial.final_output = Some("The a".to_string());
    partial.state = Some(RunState::Running);
    engine.ingest(partial);

    let mid = engine.state();
    assert!(!mid.finished);
    assert_eq!(mid.node_status("suggestions"), Some(NodeStatus::Upcoming));
    assert_ne!(mid.node_status("web-search"), Some(NodeStatus::Skipped));

    let mut later = snapshot(
        "r1",
        0,
        vec![step("suggestions", "suggestions", StepStatus::Running, 2_500)],
    );
    later.final_output = Some("The answer.".to_string());
    later.state = Some(RunState::Running);
    engine.ingest(later);

    let running = engine.state();
    assert!(!running.finished);
    assert_eq!(running.node_status("suggestions"), Some(NodeStatus::Active));

    let mut done = snapshot(
        "r1",
        0,
        vec![step("suggestions", "suggestions", StepStatus::Completed, 2_500)],
    );
    done.state = Some(RunState::Completed);
    engine.ingest(done);

    let state = engine.state();
    assert!(state.finished);
    assert_eq!(state.node_status("suggestions"), Some(NodeStatus::Completed));
    assert_eq!(state.node_status("web-search"), Some(NodeStatus::Skipped));
}

#[test]
fn test_unreported_run_state_waits_for_open_steps() {
    let engine = rag_engine();
    let mut partial = snapshot(
        "r1",
        0,
        vec![
            step("checking", "checking", StepStatus::Completed, 100),
            step("generating", "generating", StepStatus::Completed, 2_000),
            step("suggestions", "suggestions", StepStatus::Pending, 2_100),
        ],
    );
    partial.final_output = Some("The a".to_string());
    engine.ingest(partial);

    let state = engine.state();
    assert!(!state.finished);
    assert_ne!(state.node_status("suggestions"), Some(NodeStatus::Skipped));
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_keep_state() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let source = StubSource::new();
            source.push_snapshot(snapshot(
                "r1",
                0,
                vec![step("s1", "intake", StepStatus::Completed, 10)],
            ));
            source.push(Err(TransportError::Network("connection refused".to_string())));
            let engine = PollEngine::new(
                Rc::new(three_node_workflow(SyncMode::LivePoll)),
                source.clone(),
                TimingConfig::default(),
            );
            let (subscriber, seen) = recorder();
            engine.subscribe(subscriber);

            engine.start();
            sleep(Duration::from_millis(2_500)).await;
            assert_eq!(source.fetches.get(), 3);
            assert_eq!(engine.state().visible_step_ids, vec!["s1"]);
            // start, first snapshot; errors and repeats are silent.
            assert_eq!(seen.borrow().len(), 2);
            engine.teardown();
        })
        .await;
}

#[test]
fn test_scripted_controls_are_noops() {
    let engine = three_node_engine();
    engine.ingest(snapshot("r1", 0, vec![step("s1", "intake", StepStatus::Completed, 10)]));
    let before = engine.state();
    engine.play();
    engine.next();
    engine.reset();
    engine.set_speed(2.0);
    engine.confirm();
    engine.submit_query("hello");
    assert_eq!(engine.state(), before);
}

#[test]
fn test_definitions_are_not_mutated() {
    let workflow = Rc::new(catalog::llm_router());
    let engine = PollEngine::new(workflow.clone(), StubSource::new(), TimingConfig::default());
    engine.ingest(snapshot(
        "r1",
        0,
        vec![step("request_received", "request_received", StepStatus::Completed, 10)],
    ));
    assert_eq!(*workflow, catalog::llm_router());
    assert_eq!(engine.state().nodes.len(), workflow.nodes.len());
}
