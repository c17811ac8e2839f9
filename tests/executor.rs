//! Task Executor Integration Tests
//!
//! Cache hits, validation failures, deadlines, retries and the
//! at-most-one-execution guarantee.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use common::{agent_task, context_for, success_schema, test_context, ScriptedAgent};
use keel::adapters::AgentRegistry;
use keel::core::{generate_effect_id, EffectStore, EngineError, RetryPolicy, TaskExecutor, TaskOptions};
use keel::domain::{EffectRecord, EffectStatus, EventType, FailureKind};

fn executor(temp: &TempDir, agent: Arc<ScriptedAgent>) -> Arc<TaskExecutor> {
    let effects = Arc::new(EffectStore::new(temp.path().join("runs")));
    Arc::new(TaskExecutor::new(effects, AgentRegistry::with_default(agent)))
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn test_completed_effect_is_answered_from_store() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();
    let plan = agent_task("plan", success_schema());

    let first = context_for(&runs_dir, run_id, executor.clone()).await;
    let output = first.task(&plan, json!({"topic": "assays"})).await.unwrap();
    assert_eq!(output["input"]["topic"], "assays");

    // A fresh context of the same run assigns ordinal 0 again
    let second = context_for(&runs_dir, run_id, executor.clone()).await;
    let replayed = second.task(&plan, json!({"topic": "assays"})).await.unwrap();

    assert_eq!(replayed, output);
    assert_eq!(agent.calls(), 1);

    let journal = second.store().replay().await.unwrap();
    assert!(journal.iter().any(|e| e.event_type == EventType::TaskCached));
}

#[tokio::test]
async fn test_repeated_calls_get_distinct_effects() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let ctx = test_context(&temp, agent.clone()).await;
    let plan = agent_task("plan", success_schema());

    ctx.task(&plan, json!({"n": 1})).await.unwrap();
    ctx.task(&plan, json!({"n": 2})).await.unwrap();

    assert_eq!(agent.calls_for("plan"), 2);

    let effects = EffectStore::new(temp.path().join("runs")).list(ctx.run_id()).await.unwrap();
    let ids: Vec<&str> = effects.iter().map(|e| e.effect_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0].starts_with("plan-000-"));
    assert!(ids[1].starts_with("plan-001-"));
}

#[tokio::test]
async fn test_invalid_payload_fails_with_violations() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new(|_, _| Ok(json!({"success": "yes"}))));
    let ctx = test_context(&temp, agent.clone()).await;
    let review = agent_task("review", success_schema());

    let err = ctx
        .task_with(&review, json!({}), TaskOptions::default().with_retry(fast_retry(3)))
        .await
        .unwrap_err();

    let (effect_id, violations) = match err {
        EngineError::TaskValidation {
            effect_id, violations, ..
        } => (effect_id, violations),
        other => panic!("expected a validation error, got {:?}", other),
    };
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].path, "success");
    assert_eq!(effect_id, generate_effect_id(ctx.run_id(), "review", 0));

    // Validation failures are never retried
    assert_eq!(agent.calls(), 1);

    let record = EffectStore::new(temp.path().join("runs"))
        .get(ctx.run_id(), &effect_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EffectStatus::Failed);
    let failure = record.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Validation);
    assert_eq!(failure.payload, Some(json!({"success": "yes"})));
}

#[tokio::test]
async fn test_deadline_records_failed_timeout() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo().with_delay(Duration::from_millis(500)));
    let ctx = test_context(&temp, agent).await;
    let slow = agent_task("slow", success_schema());

    let err = ctx
        .task_with(&slow, json!({}), TaskOptions::default().with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TaskTimeout { .. }));
    assert!(err.is_recoverable());

    let effect_id = generate_effect_id(ctx.run_id(), "slow", 0);
    let record = EffectStore::new(temp.path().join("runs"))
        .get(ctx.run_id(), &effect_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EffectStatus::FailedTimeout);
}

#[tokio::test]
async fn test_retry_reuses_effect_until_success() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new(|_, nth| {
        if nth < 3 {
            anyhow::bail!("transient failure {}", nth);
        }
        Ok(json!({"success": true}))
    }));
    let ctx = test_context(&temp, agent.clone()).await;
    let flaky = agent_task("flaky", success_schema());

    let output = ctx
        .task_with(&flaky, json!({}), TaskOptions::default().with_retry(fast_retry(3)))
        .await
        .unwrap();
    assert_eq!(output, json!({"success": true}));
    assert_eq!(agent.calls(), 3);

    let effects = EffectStore::new(temp.path().join("runs")).list(ctx.run_id()).await.unwrap();
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].attempts, 3);
    assert!(effects[0].is_completed());
}

#[tokio::test]
async fn test_execution_failure_without_retry() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new(|_, _| anyhow::bail!("agent unreachable")));
    let ctx = test_context(&temp, agent.clone()).await;
    let task = agent_task("plan", success_schema());

    let err = ctx.task(&task, json!({})).await.unwrap_err();
    match err {
        EngineError::TaskExecution { message, .. } => assert!(message.contains("agent unreachable")),
        other => panic!("expected an execution error, got {:?}", other),
    }
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_failed_effect_is_reinvoked_on_replay() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new(|_, nth| {
        if nth == 1 {
            anyhow::bail!("first call fails");
        }
        Ok(json!({"success": true}))
    }));
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();
    let plan = agent_task("plan", success_schema());

    let first = context_for(&runs_dir, run_id, executor.clone()).await;
    assert!(first.task(&plan, json!({})).await.is_err());

    let second = context_for(&runs_dir, run_id, executor.clone()).await;
    assert_eq!(second.task(&plan, json!({})).await.unwrap(), json!({"success": true}));
    assert_eq!(agent.calls_for("plan"), 2);
}

#[tokio::test]
async fn test_invalid_schema_is_reported_before_invocation() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let ctx = test_context(&temp, agent.clone()).await;
    let broken = agent_task("broken", json!({"type": "widget"}));

    let err = ctx.task(&broken, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSchema { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_execute_once() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo().with_delay(Duration::from_millis(100)));
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();
    let plan = agent_task("plan", success_schema());

    let a = context_for(&runs_dir, run_id, executor.clone()).await;
    let b = context_for(&runs_dir, run_id, executor.clone()).await;

    let (left, right) = tokio::join!(a.task(&plan, json!({"x": 1})), b.task(&plan, json!({"x": 1})));

    assert_eq!(left.unwrap(), right.unwrap());
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_fresh_pending_effect_is_not_reinvoked() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();

    // Another process has the effect in flight
    let effect_id = generate_effect_id(run_id, "plan", 0);
    let pending = EffectRecord::pending(run_id, &effect_id, "plan", 0, json!({}));
    executor.effects().put(run_id, &effect_id, &pending).await.unwrap();

    let ctx = context_for(&runs_dir, run_id, executor.clone()).await;
    let err = ctx.task(&agent_task("plan", success_schema()), json!({})).await.unwrap_err();

    assert!(matches!(err, EngineError::TaskExecution { .. }));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_stale_pending_effect_is_retried() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let effects = Arc::new(EffectStore::new(temp.path().join("runs")));
    let executor = Arc::new(
        TaskExecutor::new(effects.clone(), AgentRegistry::with_default(agent.clone()))
            .with_stale_after(Duration::ZERO),
    );
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();

    // Left behind by a crashed process
    let effect_id = generate_effect_id(run_id, "plan", 0);
    let pending = EffectRecord::pending(run_id, &effect_id, "plan", 0, json!({}));
    effects.put(run_id, &effect_id, &pending).await.unwrap();

    let ctx = context_for(&runs_dir, run_id, executor).await;
    ctx.task(&agent_task("plan", success_schema()), json!({})).await.unwrap();

    assert_eq!(agent.calls(), 1);
    assert!(effects.get(run_id, &effect_id).await.unwrap().unwrap().is_completed());
}

#[tokio::test]
async fn test_divergent_replay_returns_recorded_output() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::echo());
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();
    let plan = agent_task("plan", success_schema());

    let first = context_for(&runs_dir, run_id, executor.clone()).await;
    first.task(&plan, json!({"draft": 1})).await.unwrap();

    let second = context_for(&runs_dir, run_id, executor.clone()).await;
    let output = second.task(&plan, json!({"draft": 2})).await.unwrap();

    assert_eq!(output["input"]["draft"], 1);
    assert_eq!(agent.calls(), 1);

    let journal = second.store().replay().await.unwrap();
    let cached = journal
        .iter()
        .find(|e| e.event_type == EventType::TaskCached)
        .unwrap();
    assert_eq!(cached.data.as_ref().unwrap()["diverged"], true);
}

#[tokio::test]
async fn test_missing_agent_is_an_execution_failure() {
    let temp = TempDir::new().unwrap();
    let runs_dir = temp.path().join("runs");
    let executor = Arc::new(TaskExecutor::new(Arc::new(EffectStore::new(&runs_dir)), AgentRegistry::new()));

    let ctx = context_for(&runs_dir, Uuid::new_v4(), executor).await;
    let err = ctx.task(&agent_task("plan", success_schema()), json!({})).await.unwrap_err();

    match err {
        EngineError::TaskExecution { message, .. } => assert!(message.contains("no agent registered")),
        other => panic!("expected an execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_artifacts_follow_call_order() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(
        ScriptedAgent::new(|request, _| {
            Ok(json!({
                "success": true,
                "artifacts": [{"path": format!("{}.md", request.task), "format": "markdown", "label": request.task}]
            }))
        })
        .with_delay(Duration::from_millis(20)),
    );
    let ctx = test_context(&temp, agent).await;
    let first = agent_task("first", success_schema());
    let second = agent_task("second", success_schema());

    let (a, b) = tokio::join!(ctx.task(&first, json!({})), ctx.task(&second, json!({})));
    a.unwrap();
    b.unwrap();

    let paths: Vec<String> = ctx.artifacts().into_iter().map(|a| a.path).collect();
    assert_eq!(paths, vec!["first.md", "second.md"]);
}

#[tokio::test]
async fn test_reinvoked_effect_keeps_its_place_in_call_order() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new(|request, nth| {
        if request.task == "a" && nth == 1 {
            anyhow::bail!("agent unavailable");
        }
        Ok(json!({"success": true}))
    }));
    let executor = executor(&temp, agent.clone());
    let runs_dir = temp.path().join("runs");
    let run_id = Uuid::new_v4();
    let a = agent_task("a", success_schema());
    let b = agent_task("b", success_schema());

    let first = context_for(&runs_dir, run_id, executor.clone()).await;
    assert!(first.task(&a, json!({})).await.is_err());
    first.task(&b, json!({})).await.unwrap();

    let second = context_for(&runs_dir, run_id, executor.clone()).await;
    second.task(&a, json!({})).await.unwrap();
    second.task(&b, json!({})).await.unwrap();
    assert_eq!(agent.calls_for("a"), 2);
    assert_eq!(agent.calls_for("b"), 1);

    let records = executor.effects().list(run_id).await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.task_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(records[0].attempts, 2);
    assert!(records[0].created_at <= records[1].created_at);
}
