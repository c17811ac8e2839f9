//! Process Driver Integration Tests
//!
//! Whole runs: failure reporting, idempotent replay, artifacts, the journal
//! and declarative processes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use common::{agent_task, success_schema, test_driver, wait_until, ScriptedAgent};
use keel::core::{
    generate_effect_id, DeclarativeProcess, EngineError, ProcessDefinition, ProcessRegistry, RunContext,
};
use keel::domain::{Artifact, ErrorKind, EventType, RunRecord, RunStatus};

/// Two sequential tasks: `a` then `b`
struct TwoStep;

#[async_trait]
impl ProcessDefinition for TwoStep {
    fn name(&self) -> &str {
        "two-step"
    }

    async fn entry(&self, inputs: Value, ctx: &RunContext) -> Result<Value> {
        let a = ctx.task(&agent_task("a", success_schema()), inputs).await?;
        ctx.log("a finished").await?;
        let b = ctx.task(&agent_task("b", success_schema()), a.clone()).await?;
        Ok(json!({"a": a, "b": b}))
    }
}

/// Artifacts from tasks and from the workflow itself
struct Publishing;

#[async_trait]
impl ProcessDefinition for Publishing {
    fn name(&self) -> &str {
        "publishing"
    }

    async fn entry(&self, _inputs: Value, ctx: &RunContext) -> Result<Value> {
        let report = agent_task("report", success_schema());
        let (first, second) = tokio::join!(ctx.task(&report, json!({"part": 1})), ctx.task(&report, json!({"part": 2})));
        first?;
        second?;
        ctx.add_artifacts(vec![Artifact::new("summary.md", "markdown", "Summary")]);
        Ok(json!({"done": true}))
    }
}

/// Fails on its own, outside any task
struct Broken;

#[async_trait]
impl ProcessDefinition for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn entry(&self, _inputs: Value, _ctx: &RunContext) -> Result<Value> {
        anyhow::bail!("missing configuration value 'region'")
    }
}

/// `b` answers `{"success": "yes"}` until `fixed` is set
fn two_step_agent(fixed: bool) -> ScriptedAgent {
    ScriptedAgent::new(move |request, _| match request.task.as_str() {
        "b" if !fixed => Ok(json!({"success": "yes"})),
        _ => Ok(json!({"success": true, "from": request.task})),
    })
}

#[tokio::test]
async fn test_invalid_output_fails_run_with_effect_id() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(two_step_agent(false));
    let driver = test_driver(&temp, agent.clone());

    let outcome = driver.run_process(&TwoStep, json!({"topic": "x"})).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TaskValidation);
    assert_eq!(error.task.as_deref(), Some("b"));
    assert_eq!(error.effect_id, Some(generate_effect_id(outcome.run_id, "b", 0)));
    assert_eq!(error.violations.len(), 1);
    assert_eq!(error.violations[0].path, "success");

    let record = driver.status(outcome.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error.unwrap().effect_id, error.effect_id);

    // Rerunning with the same broken agent does not re-invoke `a`
    let rerun = driver.resume(outcome.run_id, &TwoStep).await.unwrap();
    assert_eq!(rerun.status, RunStatus::Failed);
    assert_eq!(agent.calls_for("a"), 1);
    assert_eq!(agent.calls_for("b"), 2);
}

#[tokio::test]
async fn test_resume_after_fix_only_runs_remaining_work() {
    let temp = TempDir::new().unwrap();

    let broken = Arc::new(two_step_agent(false));
    let outcome = test_driver(&temp, broken.clone())
        .run_process(&TwoStep, json!({}))
        .await
        .unwrap();
    assert!(!outcome.is_completed());

    // A new driver over the same home, as after a restart with a fixed agent
    let fixed = Arc::new(two_step_agent(true));
    let driver = test_driver(&temp, fixed.clone());
    let resumed = driver.resume(outcome.run_id, &TwoStep).await.unwrap();

    assert!(resumed.is_completed());
    assert_eq!(fixed.calls_for("a"), 0);
    assert_eq!(fixed.calls_for("b"), 1);
    assert_eq!(resumed.result.unwrap()["b"]["from"], "b");
}

#[tokio::test]
async fn test_completed_run_replays_without_invocations() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(two_step_agent(true));
    let driver = test_driver(&temp, agent.clone());

    let first = driver.run_process(&TwoStep, json!({"topic": "x"})).await.unwrap();
    assert!(first.is_completed());
    assert_eq!(agent.calls(), 2);

    let second = driver.resume(first.run_id, &TwoStep).await.unwrap();
    assert!(second.is_completed());
    assert_eq!(second.result, first.result);
    assert_eq!(agent.calls(), 2);

    let effects = driver.effects().list(first.run_id).await.unwrap();
    assert_eq!(effects.len(), 2);
    assert!(effects.iter().all(|e| e.attempts == 1));
}

#[tokio::test]
async fn test_artifacts_are_ordered_by_call() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(
        ScriptedAgent::new(|request, _| {
            let part = request.input["part"].as_u64().unwrap_or(0);
            Ok(json!({
                "success": true,
                "artifacts": [{"path": format!("part-{}.md", part), "format": "markdown", "label": format!("Part {}", part)}]
            }))
        })
        .with_delay(Duration::from_millis(10)),
    );
    let driver = test_driver(&temp, agent);

    let outcome = driver.run_process(&Publishing, json!({})).await.unwrap();
    assert!(outcome.is_completed());

    let paths: Vec<&str> = outcome.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert_eq!(paths, vec!["part-1.md", "part-2.md", "summary.md"]);

    // Cached tasks contribute the same artifacts on replay
    let replayed = driver.resume(outcome.run_id, &Publishing).await.unwrap();
    assert_eq!(replayed.artifacts, outcome.artifacts);
}

#[tokio::test]
async fn test_journal_rebuilds_run_record() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(two_step_agent(true));
    let driver = test_driver(&temp, agent);

    let outcome = driver.run_process(&TwoStep, json!({"topic": "x"})).await.unwrap();
    let journal = driver.journal(outcome.run_id).await.unwrap();

    let seqs: Vec<u64> = journal.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=journal.len() as u64).collect::<Vec<_>>());
    assert_eq!(journal.first().unwrap().event_type, EventType::RunStarted);
    assert_eq!(journal.last().unwrap().event_type, EventType::RunCompleted);
    assert!(journal.iter().any(|e| e.event_type == EventType::Log && e.summary == "a finished"));

    let rebuilt = RunRecord::from_events(&journal).unwrap();
    let snapshot = driver.status(outcome.run_id).await.unwrap().unwrap();
    assert_eq!(rebuilt.status, snapshot.status);
    assert_eq!(rebuilt.process_name, "two-step");
    assert_eq!(rebuilt.inputs, json!({"topic": "x"}));
    assert_eq!(rebuilt.completed_at, snapshot.completed_at);
}

#[tokio::test]
async fn test_status_falls_back_to_journal() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(two_step_agent(true));
    let driver = test_driver(&temp, agent);

    let outcome = driver.run_process(&TwoStep, json!({})).await.unwrap();
    std::fs::remove_file(driver.runs_dir().join(outcome.run_id.to_string()).join("run.json")).unwrap();

    let record = driver.status(outcome.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(driver.status(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_workflow_error_is_recorded() {
    let temp = TempDir::new().unwrap();
    let driver = test_driver(&temp, Arc::new(ScriptedAgent::echo()));

    let outcome = driver.run_process(&Broken, json!({})).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);

    let error = outcome.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Workflow);
    assert!(error.message.contains("region"));
    assert!(error.effect_id.is_none());

    match outcome.into_result() {
        Err(EngineError::RunFailed { run_id, error: recorded }) => {
            assert_eq!(recorded, error);
            assert!(EngineError::RunFailed { run_id, error: recorded }.to_string().contains("region"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_completed_outcome_into_result() {
    let temp = TempDir::new().unwrap();
    let driver = test_driver(&temp, Arc::new(two_step_agent(true)));

    let outcome = driver.run_process(&TwoStep, json!({"topic": "x"})).await.unwrap();
    let expected = outcome.result.clone().unwrap();
    assert_eq!(outcome.into_result().unwrap(), expected);
}

#[tokio::test]
async fn test_run_belongs_to_its_process() {
    let temp = TempDir::new().unwrap();
    let driver = test_driver(&temp, Arc::new(two_step_agent(true)));

    let outcome = driver.run_process(&TwoStep, json!({})).await.unwrap();
    let err = driver.resume(outcome.run_id, &Broken).await.unwrap_err();
    assert!(err.to_string().contains("two-step"));
}

#[tokio::test]
async fn test_abort_while_task_runs() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(two_step_agent(true).with_delay(Duration::from_millis(200)));
    let driver = Arc::new(test_driver(&temp, agent.clone()));
    let run_id = Uuid::new_v4();

    let handle = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.run_with_id(run_id, &TwoStep, json!({})).await })
    };

    wait_until(|| agent.calls() == 1).await;
    driver.abort(run_id, Some("wrong inputs".to_string())).await.unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::RunAborted);
    assert_eq!(agent.calls_for("b"), 0);
}

#[tokio::test]
async fn test_list_runs_newest_first() {
    let temp = TempDir::new().unwrap();
    let driver = test_driver(&temp, Arc::new(two_step_agent(true)));

    let first = driver.run_process(&TwoStep, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = driver.run_process(&TwoStep, json!({})).await.unwrap();

    let runs = driver.list_runs(10).await.unwrap();
    let ids: Vec<Uuid> = runs.iter().map(|r| r.run_id).collect();
    assert_eq!(ids, vec![second.run_id, first.run_id]);
    assert_eq!(driver.list_runs(1).await.unwrap().len(), 1);
}

const DECLARATIVE_YAML: &str = r#"
name: brief
description: Outline then expand a brief

steps:
  - name: outline
    task:
      title: Outline the brief
      agent: planner
      prompt:
        role: planner
        task: Outline the brief
      output_schema:
        type: object
        required: [success, sections]
        properties:
          success: { type: boolean }
          sections: { type: array, items: { type: string } }

  - name: expand
    task:
      title: Expand each section
      agent: writer
      prompt:
        role: writer
        task: Expand the outline
      input_from:
        previous_step: outline
"#;

#[tokio::test]
async fn test_declarative_process_run() {
    let temp = TempDir::new().unwrap();
    let processes_dir = temp.path().join("processes");
    std::fs::create_dir_all(&processes_dir).unwrap();
    std::fs::write(processes_dir.join("brief.yaml"), DECLARATIVE_YAML).unwrap();
    std::fs::write(processes_dir.join("notes.txt"), "not a process").unwrap();

    let mut registry = ProcessRegistry::new();
    assert_eq!(registry.load_dir(&processes_dir).unwrap(), 1);
    assert_eq!(registry.names(), vec!["brief"]);
    let process = registry.get("brief").unwrap();

    let agent = Arc::new(ScriptedAgent::new(|request, _| match request.task.as_str() {
        "outline" => Ok(json!({"success": true, "sections": ["intro", "methods"]})),
        _ => Ok(json!({"expanded": request.input["sections"]})),
    }));
    let driver = test_driver(&temp, agent.clone());

    let outcome = driver.run_process(process.as_ref(), json!({"topic": "assays"})).await.unwrap();
    assert!(outcome.is_completed());

    let result = outcome.result.unwrap();
    assert_eq!(result["outline"]["sections"], json!(["intro", "methods"]));
    assert_eq!(result["expand"]["expanded"], json!(["intro", "methods"]));
    assert_eq!(agent.calls(), 2);

    let record = driver.status(outcome.run_id).await.unwrap().unwrap();
    assert_eq!(record.process_name, "brief");
}

#[test]
fn test_declarative_process_rejects_unknown_reference() {
    let yaml = DECLARATIVE_YAML.replace("previous_step: outline", "previous_step: research");
    let process = DeclarativeProcess::from_yaml(&yaml).unwrap();
    assert!(process.validate().is_err());
}
