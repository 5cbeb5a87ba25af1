//! Variable scopes.
//!
//! Scopes form a tree that mirrors element instances: every element
//! instance owns a scope keyed by its own key whose parent is the scope of
//! its parent instance. Lookups walk towards the root; writes are always
//! local.

use crate::types::{Key, VariableDocument};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// 1-based index of a multi-instance child.
pub const LOOP_COUNTER: &str = "loopCounter";

/// The input collection item handed to a multi-instance child.
pub const INPUT_ELEMENT: &str = "inputElement";

#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Register a scope. Creating an existing scope is a no-op.
    async fn create_scope(&self, scope_key: Key, parent: Option<Key>) -> Result<()>;

    /// Nearest binding of `name`, walking from `scope_key` to the root.
    async fn get(&self, scope_key: Key, name: &str) -> Result<Option<Value>>;

    /// Shallow, last-write-wins merge into the scope's own bindings.
    async fn merge(&self, scope_key: Key, document: &VariableDocument) -> Result<()>;

    /// Bindings owned by the scope itself.
    async fn local(&self, scope_key: Key) -> Result<VariableDocument>;

    /// Everything visible from the scope, inner bindings shadowing outer ones.
    async fn visible(&self, scope_key: Key) -> Result<VariableDocument>;

    /// Every scope's local bindings, for snapshots.
    async fn dump(&self) -> Result<BTreeMap<Key, VariableDocument>>;

    /// Start recording scope writes so they can be discarded together.
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    /// Restore every scope written since `begin`.
    async fn rollback(&self) -> Result<()>;
}

/// Shallow merge: each top-level key of `incoming` replaces the one in
/// `target`. Nested objects are replaced, not merged.
pub fn merge_shallow(target: &mut VariableDocument, incoming: &VariableDocument) {
    for (name, value) in incoming {
        target.insert(name.clone(), value.clone());
    }
}

/// Drop the multi-instance bookkeeping bindings before output propagation.
pub fn without_loop_bindings(mut document: VariableDocument) -> VariableDocument {
    document.remove(LOOP_COUNTER);
    document.remove(INPUT_ELEMENT);
    document
}
