#![allow(dead_code)]

use bpmn_exec_core::*;
use serde_json::Value;

pub fn definitions(yamls: &[&str]) -> DefinitionTable {
    DefinitionTable::new(
        yamls
            .iter()
            .map(|yaml| ProcessDefinition::from_yaml(yaml, 3).unwrap()),
    )
}

pub fn engine_for(yaml: &str) -> Engine {
    Engine::in_memory(definitions(&[yaml]), EngineConfig::default())
}

pub fn doc(value: Value) -> VariableDocument {
    value.as_object().cloned().unwrap()
}

pub async fn create(engine: &Engine, variables: Value) -> (Key, CommandOutcome) {
    let outcome = engine
        .apply(Command::CreateProcessInstance {
            process_id: "p".into(),
            variables: doc(variables),
        })
        .await
        .unwrap();
    (outcome.key().unwrap(), outcome)
}

pub async fn complete(engine: &Engine, job_key: Key, variables: Value) -> CommandOutcome {
    engine
        .apply(Command::CompleteJob {
            job_key,
            variables: doc(variables),
        })
        .await
        .unwrap()
}

pub async fn fail(
    engine: &Engine,
    job_key: Key,
    retries: u32,
    backoff_ms: u64,
    at_ms: Timestamp,
) -> CommandOutcome {
    engine
        .apply(Command::FailJob {
            job_key,
            retries,
            backoff_ms,
            error_message: "worker failed".into(),
            at_ms,
        })
        .await
        .unwrap()
}

pub async fn apply(engine: &Engine, command: Command) -> CommandOutcome {
    engine.apply(command).await.unwrap()
}

/// The only job the outcome created.
pub fn single_job(outcome: &CommandOutcome) -> (Key, String) {
    let jobs = outcome.created_jobs();
    assert_eq!(jobs.len(), 1, "expected exactly one job, got {jobs:?}");
    jobs[0].clone()
}

/// `(job_key, job_type, variables snapshot)` of every created job.
pub fn created_job_snapshots(outcome: &CommandOutcome) -> Vec<(Key, String, VariableDocument)> {
    outcome
        .events()
        .iter()
        .filter_map(|(_, event)| match event {
            RuntimeEvent::JobCreated {
                job_key,
                job_type,
                variables,
                ..
            } => Some((*job_key, job_type.clone(), variables.clone())),
            _ => None,
        })
        .collect()
}

pub fn event_names(outcome: &CommandOutcome) -> Vec<&'static str> {
    outcome.events().iter().map(|(_, e)| e.name()).collect()
}

pub async fn instances_of(engine: &Engine, element_id: &str) -> Vec<ElementInstance> {
    engine
        .snapshot()
        .await
        .unwrap()
        .instances
        .into_iter()
        .filter(|i| i.element_id == element_id)
        .collect()
}

pub async fn state_of(engine: &Engine, key: Key) -> LifecycleState {
    engine.instance(key).await.unwrap().unwrap().lifecycle_state
}

pub fn rejection_kind(outcome: &CommandOutcome) -> RejectionKind {
    outcome
        .rejection()
        .unwrap_or_else(|| panic!("expected a rejection, got {outcome:?}"))
        .kind
}
