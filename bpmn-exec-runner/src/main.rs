//! bpmn-exec-runner — runs one process definition end to end against the
//! in-memory engine with simulated workers, then prints the event log as
//! JSON lines followed by a summary line.
//!
//! See `config.rs` for the env vars it reads. Engine settings come from
//! `EngineConfig::from_env`.

mod config;
mod worker;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bpmn_exec_core::{
    state_digest, Command, DefinitionTable, Engine, EngineConfig, ProcessDefinition,
};
use serde_json::json;

use crate::config::RunnerConfig;
use crate::worker::SimulatedWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bpmn_exec_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunnerConfig::from_env()?;
    let engine_config = EngineConfig::from_env();

    let yaml = std::fs::read_to_string(&config.definition_path).with_context(|| {
        format!("failed to read {}", config.definition_path.display())
    })?;
    let definition = ProcessDefinition::from_yaml(&yaml, engine_config.default_job_retries)?;
    let process_id = config
        .process_id
        .clone()
        .unwrap_or_else(|| definition.process_id.clone());
    tracing::info!(
        path = %config.definition_path.display(),
        process_id = %process_id,
        "definition loaded"
    );

    let engine = Arc::new(Engine::in_memory(
        DefinitionTable::new([definition]),
        engine_config,
    ));
    let outcome = engine
        .apply(Command::CreateProcessInstance {
            process_id: process_id.clone(),
            variables: config.variables.clone(),
        })
        .await?;
    if let Some(rejection) = outcome.rejection() {
        bail!("cannot start {process_id}: {}", rejection.reason);
    }
    let process_instance_key = outcome
        .key()
        .context("create returned no process instance key")?;

    let summary = SimulatedWorker::new(engine.clone(), &config)
        .run(process_instance_key)
        .await?;

    for (seq, event) in engine.events_since(1).await? {
        println!("{}", json!({ "seq": seq, "event": event }));
    }

    let digest: String = state_digest(&engine)
        .await?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    println!(
        "{}",
        json!({
            "process_instance_key": summary.process_instance_key,
            "state": format!("{:?}", summary.state),
            "ticks": summary.ticks,
            "simulated_ms": summary.simulated_ms,
            "jobs_completed": summary.jobs_completed,
            "jobs_failed": summary.jobs_failed,
            "open_incidents": summary
                .open_incidents
                .iter()
                .map(|i| json!({ "key": i.key, "element_id": i.element_id, "message": i.error_message }))
                .collect::<Vec<_>>(),
            "state_digest": digest,
        })
    );
    tracing::info!(
        process_instance_key,
        state = ?summary.state,
        jobs_completed = summary.jobs_completed,
        "run finished"
    );
    Ok(())
}
