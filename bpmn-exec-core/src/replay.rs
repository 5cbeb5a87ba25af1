//! Command log replay and state digests.
//!
//! Every transition is a function of persisted state and the command
//! payload, so re-applying a command log into an empty store reproduces
//! the same events and the same digest.

use crate::config::EngineConfig;
use crate::definition::DefinitionTable;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::StoreSnapshot;
use crate::types::{Command, Key, VariableDocument};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Re-apply `commands` in order into a fresh in-memory engine. Commands
/// that failed the first time fail the same way again and are skipped;
/// only a store failure stops the replay.
pub async fn replay(
    definitions: DefinitionTable,
    config: EngineConfig,
    commands: &[Command],
) -> Result<Engine, EngineError> {
    let engine = Engine::in_memory(definitions, config);
    for command in commands {
        match engine.apply(command.clone()).await {
            Err(err) if err.is_infrastructure() => return Err(err),
            Err(err) => tracing::warn!(command = command.kind(), error = %err, "replayed command failed"),
            Ok(_) => {}
        }
    }
    tracing::info!(commands = commands.len(), "replay finished");
    Ok(engine)
}

#[derive(Serialize)]
struct DigestInput<'a> {
    store: &'a StoreSnapshot,
    variables: &'a BTreeMap<Key, VariableDocument>,
}

/// SHA-256 over the canonical JSON of the engine's owned state and every
/// variable scope.
pub async fn state_digest(engine: &Engine) -> Result<[u8; 32], EngineError> {
    let store = engine.snapshot().await?;
    let variables = engine.variable_dump().await?;
    let json = serde_json::to_string(&DigestInput {
        store: &store,
        variables: &variables,
    })
    .map_err(|e| EngineError::Store(e.into()))?;
    Ok(compute_hash(&json))
}

pub fn compute_hash(data: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().into()
}
