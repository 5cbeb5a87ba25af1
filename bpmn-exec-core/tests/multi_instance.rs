mod common;

use bpmn_exec_core::*;
use common::*;
use serde_json::json;

fn fixed(mode: &str) -> String {
    format!(
        r#"
id: p
start: s
elements:
  - id: s
    type: start_event
    outgoing: [t]
  - id: t
    type: service_task
    job_type: work
    multi_instance:
      mode: {mode}
      cardinality: 3
    outgoing: [e]
  - id: e
    type: end_event
"#
    )
}

const COLLECTION: &str = r#"
id: p
start: s
elements:
  - id: s
    type: start_event
    outgoing: [t]
  - id: t
    type: service_task
    job_type: "= 'pack-' + inputElement"
    listeners:
      - {event: end, job_type: checked}
    multi_instance:
      mode: parallel
      input_collection: items
    outgoing: [e]
  - id: e
    type: end_event
"#;

async fn body(engine: &Engine) -> ElementInstance {
    instances_of(engine, "t")
        .await
        .into_iter()
        .find(|i| i.element_type == ElementType::MultiInstanceBody)
        .unwrap()
}

/// M1.T1: Parallel bodies fan out in one batch and fan in once all children complete
#[tokio::test]
async fn test_parallel_fan_out_fan_in() {
    let engine = engine_for(&fixed("parallel"));
    let (pik, outcome) = create(&engine, json!({})).await;

    let jobs = created_job_snapshots(&outcome);
    assert_eq!(jobs.len(), 3);
    let counters: Vec<_> = jobs.iter().map(|(_, _, vars)| vars["loopCounter"].clone()).collect();
    assert_eq!(counters, vec![json!(1), json!(2), json!(3)]);

    let body_key = body(&engine).await.key;
    for (i, (job_key, _, _)) in jobs.iter().enumerate() {
        let outcome = complete(&engine, *job_key, json!({ format!("r{}", i + 1): i + 1 })).await;
        assert!(!outcome.is_rejected());
        let body = engine.instance(body_key).await.unwrap().unwrap();
        let state = body.multi_instance.as_ref().unwrap();
        assert_eq!(state.completed_child_count as usize, i + 1);
        if i < 2 {
            assert_eq!(body.lifecycle_state, LifecycleState::Activated);
        }
    }

    assert_eq!(state_of(&engine, body_key).await, LifecycleState::Completed);
    assert_eq!(state_of(&engine, pik).await, LifecycleState::Completed);

    let root_vars = engine.variables(pik).await.unwrap();
    for name in ["r1", "r2", "r3"] {
        assert!(root_vars.contains_key(name), "missing {name}");
    }
    assert!(!root_vars.contains_key("loopCounter"));
}

/// M1.T2: Sequential bodies run one child at a time, in order
#[tokio::test]
async fn test_sequential_order() {
    let engine = engine_for(&fixed("sequential"));
    let (pik, outcome) = create(&engine, json!({})).await;

    let mut counters = Vec::new();
    let mut jobs = created_job_snapshots(&outcome);
    while let Some((job_key, _, vars)) = jobs.pop() {
        assert!(jobs.is_empty(), "only one child may run at a time");
        counters.push(vars["loopCounter"].clone());
        assert_eq!(engine.activatable_jobs("work", 10).await.unwrap().len(), 1);
        jobs = created_job_snapshots(&complete(&engine, job_key, json!({})).await);
    }

    assert_eq!(counters, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(state_of(&engine, pik).await, LifecycleState::Completed);
}

/// M1.T3: Input collection items reach each child, end listeners run per child
#[tokio::test]
async fn test_input_collection() {
    let engine = engine_for(COLLECTION);
    let (pik, outcome) = create(&engine, json!({"items": ["a", "b"]})).await;

    let types: Vec<_> = outcome.created_jobs().into_iter().map(|(_, t)| t).collect();
    assert_eq!(types, vec!["pack-a", "pack-b"]);

    let state = body(&engine).await.multi_instance.unwrap();
    assert_eq!(state.total, 2);
    assert_eq!(state.mode, MultiInstanceMode::Parallel);

    let mut checks = Vec::new();
    for (job_key, _) in outcome.created_jobs() {
        let next = complete(&engine, job_key, json!({})).await;
        let (check, kind) = single_job(&next);
        assert_eq!(kind, "checked");
        checks.push(check);
    }
    for check in checks {
        complete(&engine, check, json!({})).await;
    }
    assert_eq!(state_of(&engine, pik).await, LifecycleState::Completed);
    assert!(!engine.variables(pik).await.unwrap().contains_key("inputElement"));
}

/// M1.T4: A missing input collection blocks the body until fixed and resolved
#[tokio::test]
async fn test_missing_collection_incident() {
    let engine = engine_for(COLLECTION);
    let (pik, outcome) = create(&engine, json!({})).await;
    assert!(outcome.created_jobs().is_empty());

    let incident_key = outcome.created_incidents()[0];
    let incident = engine.incident(incident_key).await.unwrap().unwrap();
    assert_eq!(incident.error_type, ErrorType::ExtractValueError);
    assert!(incident.error_message.contains("'ARRAY'"));
    let blocked = body(&engine).await;
    assert_eq!(incident.element_instance_key, blocked.key);
    assert!(blocked.multi_instance.is_none());

    apply(
        &engine,
        Command::SetVariables {
            scope_key: pik,
            variables: doc(json!({"items": "not-a-list"})),
        },
    )
    .await;
    let still = apply(&engine, Command::ResolveIncident { incident_key }).await;
    let fresh = still.created_incidents()[0];
    let message = engine.incident(fresh).await.unwrap().unwrap().error_message;
    assert!(message.contains("but was 'STRING'"), "{message}");

    apply(
        &engine,
        Command::SetVariables {
            scope_key: pik,
            variables: doc(json!({"items": ["x"]})),
        },
    )
    .await;
    let resolved = apply(&engine, Command::ResolveIncident { incident_key: fresh }).await;
    assert_eq!(single_job(&resolved).1, "pack-x");
}

/// M1.T5: An empty collection completes the body without children
#[tokio::test]
async fn test_empty_collection_completes_immediately() {
    let engine = engine_for(COLLECTION);
    let (pik, outcome) = create(&engine, json!({"items": []})).await;
    assert!(outcome.created_jobs().is_empty());
    assert!(outcome.created_incidents().is_empty());
    assert_eq!(state_of(&engine, pik).await, LifecycleState::Completed);
}
