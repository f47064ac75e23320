//! Client mirror integration tests: shared handles, live updates, waits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use trellis::{
    Engine, EventFilter, EventKind, FlowClient, FlowDefinition, FlowEvent, MemoryStore, RunStatus,
    SkipPolicy, SkipReason, StepDefinition, StepStatus, WaitError,
};

const WAIT: Duration = Duration::from_secs(5);

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryStore::new()))
}

async fn two_step_engine() -> Engine {
    let engine = engine();
    let mut flow = FlowDefinition::new("pipeline").unwrap();
    flow.add_step(StepDefinition::single("fetch")).unwrap();
    flow.add_step(StepDefinition::single("store").depends_on(["fetch"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    engine
}

#[tokio::test]
async fn mirror_follows_run_to_completion() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());

    let run = client
        .start_flow("pipeline", json!({"id": 1}), None)
        .await
        .unwrap();
    assert_eq!(run.status(), RunStatus::Started);
    assert_eq!(run.remaining_steps(), Some(2));

    // Drive the run from the worker side while the mirror watches.
    let driver = {
        let engine = engine.clone();
        tokio::spawn(async move {
            loop {
                let tasks = engine.poll_for_tasks("pipeline", 10, 2).await.unwrap();
                if tasks.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                for task in tasks {
                    engine
                        .complete_task(task.run_id, &task.step_slug, task.task_index, json!("done"))
                        .await
                        .unwrap();
                }
            }
        })
    };

    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();
    driver.abort();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.output(), Some(json!({"store": "done"})));
    assert_eq!(run.remaining_steps(), Some(0));
    assert_eq!(run.step("fetch").status(), StepStatus::Completed);
    assert_eq!(run.step("store").output(), Some(json!("done")));
}

#[tokio::test]
async fn get_run_returns_the_identical_handle() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());

    let started = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();
    let fetched = client.get_run(started.run_id()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&started, &fetched));

    // Unknown runs are absent, not an error.
    assert!(client.get_run(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn dispose_builds_a_fresh_mirror_from_storage() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());

    let run = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();
    let run_id = run.run_id();

    engine
        .complete_task(run_id, "fetch", 0, json!("fetched"))
        .await
        .unwrap();
    engine
        .complete_task(run_id, "store", 0, json!("stored"))
        .await
        .unwrap();
    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();

    client.dispose(run_id);
    assert_eq!(client.mirrored_runs(), 0);

    // The rebuilt mirror starts from a snapshot and is already terminal.
    let rebuilt = client.get_run(run_id).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&run, &rebuilt));
    assert_eq!(rebuilt.status(), RunStatus::Completed);
    assert_eq!(rebuilt.output(), Some(json!({"store": "stored"})));
    assert_eq!(rebuilt.step("fetch").output(), Some(json!("fetched")));
}

#[tokio::test]
async fn observers_fire_in_registration_order() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());
    let run = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();
    // Let the start events drain before registering.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let first = log.clone();
    run.on(EventFilter::Any, move |event| {
        first.lock().unwrap().push(format!("first:{}", event.event_type));
    });
    let second = log.clone();
    run.on(EventFilter::Any, move |event| {
        second.lock().unwrap().push(format!("second:{}", event.event_type));
    });
    let completed_only = log.clone();
    run.on(EventFilter::Kind(EventKind::RunCompleted), move |_| {
        completed_only.lock().unwrap().push("completed-only".to_string());
    });
    let store_step = log.clone();
    run.step("store")
        .on(EventFilter::Kind(EventKind::StepCompleted), move |event| {
            store_step
                .lock()
                .unwrap()
                .push(format!("store:{}", event.output.clone().unwrap()));
        });

    engine
        .complete_task(run.run_id(), "fetch", 0, json!("fetched"))
        .await
        .unwrap();
    engine
        .complete_task(run.run_id(), "store", 0, json!("stored"))
        .await
        .unwrap();
    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();

    // The step view saw its own completion; the run view saw its own
    // events, wildcard before the later-registered specific callback.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "store:\"stored\"".to_string(),
            "first:run:completed".to_string(),
            "second:run:completed".to_string(),
            "completed-only".to_string(),
        ]
    );
}

#[tokio::test]
async fn unsubscribed_observer_stops_firing() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());
    let run = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let muted_count = Arc::new(Mutex::new(0));
    let muted = muted_count.clone();
    let subscription = run.on(EventFilter::Any, move |_| *muted.lock().unwrap() += 1);
    let live_count = Arc::new(Mutex::new(0));
    let live = live_count.clone();
    run.on(EventFilter::Any, move |_| *live.lock().unwrap() += 1);

    assert!(run.off(subscription));
    assert!(!run.off(subscription));

    engine
        .complete_task(run.run_id(), "fetch", 0, json!("a"))
        .await
        .unwrap();
    engine
        .complete_task(run.run_id(), "store", 0, json!("b"))
        .await
        .unwrap();
    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();

    assert_eq!(*muted_count.lock().unwrap(), 0);
    assert_eq!(*live_count.lock().unwrap(), 1);
}

#[tokio::test]
async fn reused_run_id_does_not_leak_the_old_pump() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());
    let run_id = Uuid::new_v4();
    client
        .start_flow("pipeline", json!({}), Some(run_id))
        .await
        .unwrap();

    // Duplicate start: the engine rejects the run and the mirror for that
    // id is torn down, displaced pump included.
    assert!(client
        .start_flow("pipeline", json!({}), Some(run_id))
        .await
        .is_err());
    assert_eq!(client.mirrored_runs(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let event = FlowEvent::run(EventKind::RunStarted, run_id, Utc::now());
    assert_eq!(engine.bus().publish(&event), 0);
}

#[tokio::test]
async fn step_wait_and_skip_reasons_are_visible() {
    let engine = engine();
    let mut flow = FlowDefinition::new("gated").unwrap();
    flow.add_step(StepDefinition::single("check")).unwrap();
    flow.add_step(
        StepDefinition::single("notify")
            .depends_on(["check"])
            .condition(json!({"check": {"alert": true}}))
            .when_unmet(SkipPolicy::Skip),
    )
    .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let client = FlowClient::new(engine.clone());

    let run = client.start_flow("gated", json!({}), None).await.unwrap();
    engine
        .complete_task(run.run_id(), "check", 0, json!({"alert": false}))
        .await
        .unwrap();

    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();
    let notify = run.step("notify");
    assert_eq!(notify.status(), StepStatus::Skipped);
    assert_eq!(notify.view().skip_reason, Some(SkipReason::ConditionUnmet));
    assert_eq!(notify.output(), None);
}

#[tokio::test]
async fn waiting_for_a_bypassed_status_fails_fast() {
    let engine = engine();
    let mut flow = FlowDefinition::new("doomed").unwrap();
    flow.add_step(StepDefinition::single("work").max_attempts(1))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let client = FlowClient::new(engine.clone());

    let run = client.start_flow("doomed", json!({}), None).await.unwrap();
    engine
        .fail_task(run.run_id(), "work", 0, "broken")
        .await
        .unwrap();

    let error = run
        .wait_for_status(RunStatus::Completed, WAIT)
        .await
        .unwrap_err();
    assert_eq!(
        error,
        WaitError::TerminalMismatch {
            target: "completed",
            actual: "failed",
        }
    );
    assert_eq!(run.error_message().as_deref(), Some("step 'work' failed: broken"));
}

#[tokio::test]
async fn wait_times_out_when_nothing_happens() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());
    let run = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();

    let error = run
        .wait_for_status(RunStatus::Completed, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(error, WaitError::Timeout { .. }));
}

#[tokio::test]
async fn terminal_mirror_state_is_frozen() {
    let engine = two_step_engine().await;
    let client = FlowClient::new(engine.clone());
    let run = client
        .start_flow("pipeline", json!({}), None)
        .await
        .unwrap();

    engine
        .complete_task(run.run_id(), "fetch", 0, json!("a"))
        .await
        .unwrap();
    engine
        .complete_task(run.run_id(), "store", 0, json!("b"))
        .await
        .unwrap();
    run.wait_for_status(RunStatus::Completed, WAIT).await.unwrap();
    let settled = run.view();

    // Duplicate terminal reports are idempotent server-side and the mirror
    // ignores anything after its terminal state.
    engine
        .complete_task(run.run_id(), "store", 0, json!("other"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(run.view().output, settled.output);
    assert_eq!(run.step("store").output(), Some(json!("b")));
}
