//! Runner configuration.
//!
//! Reads config from env vars:
//!   BPMN_EXEC_DEFINITION  — path of the YAML process definition (required)
//!   BPMN_EXEC_PROCESS_ID  — process to start (default: the definition's id)
//!   BPMN_EXEC_VARIABLES   — JSON object of start variables (default: {})
//!   BPMN_EXEC_TICK_MS     — simulated milliseconds per worker tick (default: 100)
//!   BPMN_EXEC_MAX_TICKS   — ticks before the run gives up (default: 1000)
//!   BPMN_EXEC_FAIL_FIRST  — fail each job's first attempt with a backoff (default: false)
//!   BPMN_EXEC_BACKOFF_MS  — backoff used for those failures (default: 250)

use anyhow::{bail, Context, Result};
use bpmn_exec_core::VariableDocument;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    pub definition_path: PathBuf,
    pub process_id: Option<String>,
    pub variables: VariableDocument,
    pub tick_ms: u64,
    pub max_ticks: u64,
    pub fail_first_attempt: bool,
    pub backoff_ms: u64,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let definition_path = lookup("BPMN_EXEC_DEFINITION")
            .map(PathBuf::from)
            .context("BPMN_EXEC_DEFINITION must be set")?;

        let variables = match lookup("BPMN_EXEC_VARIABLES") {
            None => VariableDocument::new(),
            Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw)
                .with_context(|| format!("BPMN_EXEC_VARIABLES is not valid JSON: {raw}"))?
            {
                serde_json::Value::Object(map) => map,
                other => bail!("BPMN_EXEC_VARIABLES must be a JSON object, got {other}"),
            },
        };

        Ok(Self {
            definition_path,
            process_id: lookup("BPMN_EXEC_PROCESS_ID"),
            variables,
            tick_ms: lookup("BPMN_EXEC_TICK_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            max_ticks: lookup("BPMN_EXEC_MAX_TICKS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            fail_first_attempt: lookup("BPMN_EXEC_FAIL_FIRST")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            backoff_ms: lookup("BPMN_EXEC_BACKOFF_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
        })
    }
}
