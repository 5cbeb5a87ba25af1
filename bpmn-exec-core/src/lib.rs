//! bpmn-exec-core: element execution lifecycle with execution-listener job
//! chains, retry/backoff and incident-based suspension.
//!
//! The [`Engine`] applies [`Command`]s one at a time against a
//! [`ProcessStore`] and a [`VariableStore`], recording every state change
//! as a [`RuntimeEvent`].

pub mod authoring;
pub mod chain;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod incidents;
pub mod jobs;
pub mod replay;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod variables;

pub use config::EngineConfig;
pub use definition::{DefinitionTable, ProcessDefinition};
pub use engine::Engine;
pub use error::EngineError;
pub use events::RuntimeEvent;
pub use expression::{ExpressionResolver, SimpleExpressionResolver};
pub use replay::{replay, state_digest};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::*;
pub use variables::VariableStore;
