mod common;

use std::rc::Rc;
use std::time::Duration;

use shared_types::{catalog, StepStatus, SyncMode};
use tokio::task::LocalSet;
use tokio::time::sleep;
use visualizer::engine::{build_engine, EngineOptions, EngineSlot};
use visualizer::transport::SnapshotSource;
use visualizer::VisualizerError;

use common::{recorder, snapshot, step, StubSource};

fn with_source(source: Rc<StubSource>) -> EngineOptions {
    let source: Rc<dyn SnapshotSource> = source;
    EngineOptions {
        source: Some(source),
        ..EngineOptions::default()
    }
}

#[test]
fn test_declared_mode_selects_engine() {
    let source = StubSource::new();
    let cases = [
        (catalog::support_agent(), SyncMode::Scripted),
        (catalog::llm_router(), SyncMode::LivePoll),
        (catalog::rag_pipeline(), SyncMode::LiveStream),
    ];
    for (workflow, expected) in cases {
        let engine = build_engine(Rc::new(workflow), with_source(source.clone())).unwrap();
        assert_eq!(engine.mode(), expected);
        assert_eq!(engine.state().mode, expected);
    }
}

#[test]
fn test_live_mode_without_source_falls_back_to_scripted() {
    let engine = build_engine(Rc::new(catalog::llm_router()), EngineOptions::default()).unwrap();
    assert_eq!(engine.mode(), SyncMode::Scripted);
    assert_eq!(engine.state().run_id.as_deref(), Some("complex-reasoning"));
}

#[test]
fn test_scenario_forces_scripted_replay() {
    let options = EngineOptions {
        scenario: Some("code-question".to_string()),
        ..with_source(StubSource::new())
    };
    let engine = build_engine(Rc::new(catalog::llm_router()), options).unwrap();
    assert_eq!(engine.mode(), SyncMode::Scripted);
    assert_eq!(engine.state().run_id.as_deref(), Some("code-question"));

    let forced_live = EngineOptions {
        scenario: Some("code-question".to_string()),
        mode: Some(SyncMode::LivePoll),
        ..with_source(StubSource::new())
    };
    let engine = build_engine(Rc::new(catalog::llm_router()), forced_live).unwrap();
    assert_eq!(engine.mode(), SyncMode::LivePoll);
}

#[test]
fn test_unknown_scenario_is_rejected() {
    let options = EngineOptions {
        scenario: Some("missing".to_string()),
        ..EngineOptions::default()
    };
    match build_engine(Rc::new(catalog::support_agent()), options) {
        Err(VisualizerError::UnknownScenario { workflow, scenario }) => {
            assert_eq!(workflow, "support-agent");
            assert_eq!(scenario, "missing");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[test]
fn test_speed_option_applies_without_notifying() {
    let options = EngineOptions {
        speed: 20.0,
        ..EngineOptions::default()
    };
    let engine = build_engine(Rc::new(catalog::support_agent()), options).unwrap();
    let state = engine.state();
    assert_eq!(state.speed, 8.0);
    assert_eq!(state.revision, 0);
}

#[tokio::test(start_paused = true)]
async fn test_replacing_tears_down_previous_engine() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let source = StubSource::new();
            source.push_snapshot(snapshot(
                "r1",
                0,
                vec![step("request_received", "request_received", StepStatus::Completed, 10)],
            ));
            let mut slot = EngineSlot::new();

            let (subscriber, seen) = recorder();
            let first = slot.replace(
                build_engine(Rc::new(catalog::llm_router()), with_source(source.clone())).unwrap(),
            );
            first.subscribe(subscriber);
            first.start();
            sleep(Duration::from_millis(10)).await;
            let before = seen.borrow().len();
            assert!(before >= 1);

            let second = slot.replace(
                build_engine(Rc::new(catalog::support_agent()), EngineOptions::default()).unwrap(),
            );
            assert_eq!(second.mode(), SyncMode::Scripted);
            let fetches = source.fetches.get();

            sleep(Duration::from_secs(5)).await;
            assert_eq!(seen.borrow().len(), before);
            assert_eq!(source.fetches.get(), fetches);

            slot.clear();
            assert!(slot.get().is_none());
        })
        .await;
}
