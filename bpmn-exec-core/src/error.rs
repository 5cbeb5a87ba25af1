use crate::authoring::ValidationError;
use crate::types::Key;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Infrastructure failure in a store. Marks the engine unhealthy.
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error("engine is unhealthy after a store failure")]
    Unhealthy,

    #[error("invalid process definition: {} violation(s)", .0.len())]
    InvalidDefinition(Vec<ValidationError>),

    #[error("definition yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("unknown element '{element_id}' in process '{process_id}'")]
    UnknownElement {
        process_id: String,
        element_id: String,
    },

    #[error("missing {kind} record {key}")]
    MissingRecord { kind: &'static str, key: Key },

    #[error("invalid transition for element instance {key}: {detail}")]
    InvalidTransition { key: Key, detail: String },

    #[error("command cascade exceeded {limit} steps")]
    CascadeLimit { limit: usize },
}

impl EngineError {
    /// Infrastructure failures poison the processor; everything else is a
    /// problem with the command or the definitions.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
