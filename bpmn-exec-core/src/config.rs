//! Engine configuration.
//!
//! Reads from env vars when built with [`EngineConfig::from_env`]:
//!   BPMN_EXEC_DEFAULT_RETRIES   — retries for jobs whose definition names none (default: 3)
//!   BPMN_EXEC_MAX_CASCADE_STEPS — element advances allowed per command (default: 10000)

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_JOB_RETRIES: u32 = 3;
pub const DEFAULT_MAX_CASCADE_STEPS: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_job_retries: u32,
    /// Upper bound on element advances while applying one command.
    pub max_cascade_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_job_retries: DEFAULT_JOB_RETRIES,
            max_cascade_steps: DEFAULT_MAX_CASCADE_STEPS,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparsable values fall back
    /// to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            default_job_retries: parse_or(
                &lookup,
                "BPMN_EXEC_DEFAULT_RETRIES",
                defaults.default_job_retries,
            ),
            max_cascade_steps: parse_or(
                &lookup,
                "BPMN_EXEC_MAX_CASCADE_STEPS",
                defaults.max_cascade_steps,
            ),
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, raw = %raw, ?default, "unparsable config value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let vars = HashMap::from([
            ("BPMN_EXEC_DEFAULT_RETRIES", "5"),
            ("BPMN_EXEC_MAX_CASCADE_STEPS", " 64 "),
        ]);
        let config = EngineConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.default_job_retries, 5);
        assert_eq!(config.max_cascade_steps, 64);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = EngineConfig::from_lookup(|name| {
            (name == "BPMN_EXEC_DEFAULT_RETRIES").then(|| "many".to_string())
        });
        assert_eq!(config.default_job_retries, DEFAULT_JOB_RETRIES);
    }
}
