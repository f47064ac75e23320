//! Engine integration tests against the in-memory store.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use trellis::{
    Engine, FlowDefinition, MemoryStore, RunStatus, SkipPolicy, SkipReason, StepDefinition,
    StepStatus,
};

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryStore::new()))
}

/// Drives every runnable task to completion with the given handler.
async fn drain<F>(engine: &Engine, flow_slug: &str, mut handler: F)
where
    F: FnMut(&str, &serde_json::Value) -> Result<serde_json::Value, String>,
{
    loop {
        let tasks = engine.poll_for_tasks(flow_slug, 50, 2).await.unwrap();
        if tasks.is_empty() {
            break;
        }
        for task in tasks {
            match handler(&task.step_slug, &task.input) {
                Ok(output) => engine
                    .complete_task(task.run_id, &task.step_slug, task.task_index, output)
                    .await
                    .unwrap(),
                Err(message) => engine
                    .fail_task(task.run_id, &task.step_slug, task.task_index, &message)
                    .await
                    .unwrap(),
            }
        }
    }
}

#[tokio::test]
async fn sequential_flow_passes_outputs_downstream() {
    let engine = engine();
    let mut flow = FlowDefinition::new("etl").unwrap();
    flow.add_step(StepDefinition::single("extract")).unwrap();
    flow.add_step(StepDefinition::single("transform").depends_on(["extract"]))
        .unwrap();
    flow.add_step(StepDefinition::single("load").depends_on(["transform"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run = engine
        .start_flow("etl", json!({"source": "s3"}), None)
        .await
        .unwrap();

    // Only the root is pollable at first.
    let tasks = engine.poll_for_tasks("etl", 50, 2).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_slug, "extract");
    assert_eq!(tasks[0].input, json!({"run": {"source": "s3"}}));
    engine
        .complete_task(run.run_id, "extract", 0, json!({"rows": 10}))
        .await
        .unwrap();

    let tasks = engine.poll_for_tasks("etl", 50, 2).await.unwrap();
    assert_eq!(tasks[0].step_slug, "transform");
    assert_eq!(
        tasks[0].input,
        json!({"run": {"source": "s3"}, "extract": {"rows": 10}})
    );
    engine
        .complete_task(run.run_id, "transform", 0, json!({"rows": 9}))
        .await
        .unwrap();

    drain(&engine, "etl", |_, _| Ok(json!("loaded"))).await;

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    // Run output is the leaf step's output keyed by slug.
    assert_eq!(snapshot.run.output, Some(json!({"load": "loaded"})));
    assert_eq!(snapshot.run.remaining_steps, 0);
}

#[tokio::test]
async fn unmet_condition_skips_step_and_dependents() {
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
    flow.add_step(StepDefinition::single("page").depends_on(["notify"]))
        .unwrap();
    flow.add_step(StepDefinition::single("archive").depends_on(["check"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run = engine.start_flow("gated", json!({}), None).await.unwrap();
    drain(&engine, "gated", |step, _| match step {
        "check" => Ok(json!({"alert": false})),
        other => Ok(json!(format!("{other} ran"))),
    })
    .await;

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    let step = |slug: &str| {
        snapshot
            .steps
            .iter()
            .find(|step| step.step_slug == slug)
            .unwrap()
            .clone()
    };
    assert_eq!(step("notify").status, StepStatus::Skipped);
    assert_eq!(step("notify").skip_reason, Some(SkipReason::ConditionUnmet));
    assert_eq!(step("page").status, StepStatus::Skipped);
    assert_eq!(step("page").skip_reason, Some(SkipReason::DependencySkipped));
    assert_eq!(step("archive").status, StepStatus::Completed);
    // Skipped leaves contribute null to the run output.
    assert_eq!(
        snapshot.run.output,
        Some(json!({"page": null, "archive": "archive ran"}))
    );
}

#[tokio::test]
async fn skip_cascade_on_unmet_condition_clears_the_whole_branch() {
    // Multi-level branch below the gated step: the origin keeps its own
    // reason and every transitive dependent is skipped as a dependency.
    let engine = engine();
    let mut flow = FlowDefinition::new("cascaded").unwrap();
    flow.add_step(StepDefinition::single("check")).unwrap();
    flow.add_step(
        StepDefinition::single("gate")
            .depends_on(["check"])
            .condition(json!({"check": {"proceed": true}}))
            .when_unmet(SkipPolicy::SkipCascade),
    )
    .unwrap();
    flow.add_step(StepDefinition::single("mid").depends_on(["gate"]))
        .unwrap();
    flow.add_step(StepDefinition::single("leaf").depends_on(["mid"]))
        .unwrap();
    flow.add_step(StepDefinition::single("side").depends_on(["check"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run = engine.start_flow("cascaded", json!({}), None).await.unwrap();
    drain(&engine, "cascaded", |step, _| match step {
        "check" => Ok(json!({"proceed": false})),
        other => Ok(json!(format!("{other} ran"))),
    })
    .await;

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    let step = |slug: &str| {
        snapshot
            .steps
            .iter()
            .find(|step| step.step_slug == slug)
            .unwrap()
            .clone()
    };
    assert_eq!(step("gate").status, StepStatus::Skipped);
    assert_eq!(step("gate").skip_reason, Some(SkipReason::ConditionUnmet));
    for slug in ["mid", "leaf"] {
        assert_eq!(step(slug).status, StepStatus::Skipped);
        assert_eq!(step(slug).skip_reason, Some(SkipReason::DependencySkipped));
    }
    assert_eq!(step("side").status, StepStatus::Completed);
    assert_eq!(
        snapshot.run.output,
        Some(json!({"leaf": null, "side": "side ran"}))
    );
}

#[tokio::test]
async fn failed_task_retries_then_fails_run_when_exhausted() {
    let engine = engine();
    let mut flow = FlowDefinition::new("flaky").unwrap();
    flow.add_step(
        StepDefinition::single("wobble")
            .max_attempts(3)
            .base_delay_secs(0),
    )
    .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("flaky", json!({}), None).await.unwrap();

    for attempt in 0..3 {
        let tasks = engine.poll_for_tasks("flaky", 10, 2).await.unwrap();
        assert_eq!(tasks.len(), 1, "attempt {attempt} should be pollable");
        assert_eq!(tasks[0].attempts_count, attempt);
        engine
            .fail_task(run.run_id, "wobble", 0, "still broken")
            .await
            .unwrap();
    }

    // Attempts exhausted: nothing left to poll and the run has failed.
    assert!(engine.poll_for_tasks("flaky", 10, 2).await.unwrap().is_empty());
    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert!(snapshot
        .run
        .error_message
        .as_deref()
        .unwrap()
        .contains("wobble"));
    assert_eq!(snapshot.steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn retry_backoff_defers_the_next_delivery() {
    let engine = engine();
    let mut flow = FlowDefinition::new("patient").unwrap();
    flow.add_step(
        StepDefinition::single("slow")
            .max_attempts(3)
            .base_delay_secs(3600),
    )
    .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("patient", json!({}), None).await.unwrap();

    let tasks = engine.poll_for_tasks("patient", 10, 2).await.unwrap();
    assert_eq!(tasks.len(), 1);
    engine
        .fail_task(run.run_id, "slow", 0, "transient")
        .await
        .unwrap();

    // Requeued an hour out; not pollable now.
    assert!(engine.poll_for_tasks("patient", 10, 2).await.unwrap().is_empty());
    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Started);
    assert_eq!(snapshot.steps[0].status, StepStatus::Started);
}

#[tokio::test]
async fn map_step_fans_out_and_aggregates_in_order() {
    let engine = engine();
    let mut flow = FlowDefinition::new("mapper").unwrap();
    flow.add_step(StepDefinition::map("double")).unwrap();
    flow.add_step(StepDefinition::single("sum").depends_on(["double"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run = engine
        .start_flow("mapper", json!([1, 2, 3]), None)
        .await
        .unwrap();

    let mut tasks = engine.poll_for_tasks("mapper", 10, 2).await.unwrap();
    assert_eq!(tasks.len(), 3);
    tasks.sort_by_key(|task| task.task_index);
    for (index, task) in tasks.iter().enumerate() {
        assert_eq!(task.input, json!(index as i64 + 1));
    }
    // Complete out of order; aggregation stays index-ordered.
    for task in tasks.iter().rev() {
        let doubled = task.input.as_i64().unwrap() * 2;
        engine
            .complete_task(run.run_id, "double", task.task_index, json!(doubled))
            .await
            .unwrap();
    }

    let tasks = engine.poll_for_tasks("mapper", 10, 2).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_slug, "sum");
    assert_eq!(tasks[0].input, json!({"run": [1, 2, 3], "double": [2, 4, 6]}));
    engine
        .complete_task(run.run_id, "sum", 0, json!(12))
        .await
        .unwrap();

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.run.output, Some(json!({"sum": 12})));
}

#[tokio::test]
async fn empty_map_input_completes_without_tasks() {
    let engine = engine();
    let mut flow = FlowDefinition::new("mapper").unwrap();
    flow.add_step(StepDefinition::map("items")).unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run = engine.start_flow("mapper", json!([]), None).await.unwrap();
    assert!(engine.poll_for_tasks("mapper", 10, 2).await.unwrap().is_empty());
    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.run.output, Some(json!({"items": []})));
}

#[tokio::test]
async fn non_array_input_for_root_map_is_rejected() {
    let engine = engine();
    let mut flow = FlowDefinition::new("mapper").unwrap();
    flow.add_step(StepDefinition::map("items")).unwrap();
    engine.create_flow(&flow).await.unwrap();

    let error = engine
        .start_flow("mapper", json!({"not": "array"}), None)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("array"));
}

#[tokio::test]
async fn non_array_output_feeding_map_fails_the_producer() {
    let engine = engine();
    let mut flow = FlowDefinition::new("fanout").unwrap();
    flow.add_step(StepDefinition::single("produce")).unwrap();
    flow.add_step(StepDefinition::map("spread").depends_on(["produce"]))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("fanout", json!({}), None).await.unwrap();

    drain(&engine, "fanout", |_, _| Ok(json!({"oops": true}))).await;

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    let produce = snapshot
        .steps
        .iter()
        .find(|step| step.step_slug == "produce")
        .unwrap();
    assert_eq!(produce.status, StepStatus::Failed);
    assert!(produce
        .error_message
        .as_deref()
        .unwrap()
        .contains("TYPE_VIOLATION"));
}

#[tokio::test]
async fn expired_lease_redelivers_without_burning_an_attempt() {
    let engine = engine();
    let mut flow = FlowDefinition::new("leaky").unwrap();
    flow.add_step(StepDefinition::single("work").timeout_secs(0))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("leaky", json!({}), None).await.unwrap();

    let first = engine.poll_for_tasks("leaky", 10, 0).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = engine.poll_for_tasks("leaky", 10, 0).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].attempts_count, 0);
    assert_ne!(first[0].lease_token, second[0].lease_token);

    // The stale worker finishing late still lands: terminal reports are
    // first-writer-wins and later duplicates are ignored.
    engine
        .complete_task(run.run_id, "work", 0, json!("late but fine"))
        .await
        .unwrap();
    engine
        .complete_task(run.run_id, "work", 0, json!("duplicate"))
        .await
        .unwrap();
    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.run.output, Some(json!({"work": "late but fine"})));
}

#[tokio::test]
async fn start_delay_defers_first_delivery() {
    let engine = engine();
    let mut flow = FlowDefinition::new("delayed").unwrap();
    flow.add_step(StepDefinition::single("later").start_delay_secs(3600))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    engine.start_flow("delayed", json!({}), None).await.unwrap();

    assert!(engine.poll_for_tasks("delayed", 10, 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_step_with_skip_policy_lets_run_complete() {
    let engine = engine();
    let mut flow = FlowDefinition::new("lenient").unwrap();
    flow.add_step(StepDefinition::single("optional").max_attempts(1).when_exhausted(SkipPolicy::Skip))
        .unwrap();
    flow.add_step(StepDefinition::single("required")).unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("lenient", json!({}), None).await.unwrap();

    drain(&engine, "lenient", |step, _| match step {
        "optional" => Err("broken".to_string()),
        _ => Ok(json!("ok")),
    })
    .await;

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    let optional = snapshot
        .steps
        .iter()
        .find(|step| step.step_slug == "optional")
        .unwrap();
    assert_eq!(optional.status, StepStatus::Skipped);
    assert_eq!(optional.skip_reason, Some(SkipReason::HandlerFailed));
    assert_eq!(
        snapshot.run.output,
        Some(json!({"optional": null, "required": "ok"}))
    );
}

#[tokio::test]
async fn tasks_of_unrelated_flows_are_not_claimed() {
    let engine = engine();
    for slug in ["first-flow", "second-flow"] {
        let mut flow = FlowDefinition::new(slug).unwrap();
        flow.add_step(StepDefinition::single("work")).unwrap();
        engine.create_flow(&flow).await.unwrap();
        engine.start_flow(slug, json!({}), None).await.unwrap();
    }
    let tasks = engine.poll_for_tasks("first-flow", 10, 2).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].flow_slug, "first-flow");
}

#[tokio::test]
async fn duplicate_run_id_is_rejected() {
    let engine = engine();
    let mut flow = FlowDefinition::new("once").unwrap();
    flow.add_step(StepDefinition::single("work")).unwrap();
    engine.create_flow(&flow).await.unwrap();

    let run_id = Uuid::new_v4();
    engine
        .start_flow("once", json!({}), Some(run_id))
        .await
        .unwrap();
    let error = engine
        .start_flow("once", json!({}), Some(run_id))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("already exists"));
}

#[tokio::test]
async fn failed_task_after_run_failure_is_recorded_quietly() {
    // Two parallel steps; one fails the run while the other is in flight.
    let engine = engine();
    let mut flow = FlowDefinition::new("parallel").unwrap();
    flow.add_step(StepDefinition::single("a").max_attempts(1))
        .unwrap();
    flow.add_step(StepDefinition::single("b").max_attempts(1))
        .unwrap();
    engine.create_flow(&flow).await.unwrap();
    let run = engine.start_flow("parallel", json!({}), None).await.unwrap();

    let tasks = engine.poll_for_tasks("parallel", 10, 2).await.unwrap();
    assert_eq!(tasks.len(), 2);
    engine.fail_task(run.run_id, "a", 0, "boom").await.unwrap();
    // The run is already failed; the in-flight sibling's report is absorbed.
    engine
        .complete_task(run.run_id, "b", 0, json!("too late"))
        .await
        .unwrap();

    let snapshot = engine.run_snapshot(run.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    let b = snapshot
        .steps
        .iter()
        .find(|step| step.step_slug == "b")
        .unwrap();
    // The sibling's task record settles but the step and run stay put.
    assert_eq!(b.status, StepStatus::Started);
    assert_eq!(snapshot.run.output, None);
}
