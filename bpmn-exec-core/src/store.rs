use crate::events::RuntimeEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persistence port for everything the lifecycle engine owns.
///
/// The engine reads and writes exclusively through this trait. A failing
/// call is an infrastructure failure: the engine stops accepting commands
/// until it is reset. `MemoryStore` is the bundled implementation.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Keys ──

    /// Allocate the next key. Keys are shared by instances, jobs and
    /// incidents and are never reused.
    async fn next_key(&self) -> Result<Key>;

    // ── Element instances ──

    async fn save_instance(&self, instance: &ElementInstance) -> Result<()>;
    async fn load_instance(&self, key: Key) -> Result<Option<ElementInstance>>;
    /// Direct children of a scope, ordered by key.
    async fn load_children(&self, parent_key: Key) -> Result<Vec<ElementInstance>>;

    // ── Jobs ──

    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_job(&self, key: Key) -> Result<Option<Job>>;
    /// Jobs in `Created` state of the given type, ordered by key.
    async fn activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>>;
    /// Failed jobs whose backoff deadline is at or before `now`, ordered by
    /// `(recur_at, key)`.
    async fn due_recurrences(&self, now: Timestamp) -> Result<Vec<Job>>;

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> Result<()>;
    async fn load_incident(&self, key: Key) -> Result<Option<Incident>>;
    async fn load_incidents(&self, process_instance_key: Key) -> Result<Vec<Incident>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number (starting at 1).
    async fn append_event(&self, event: &RuntimeEvent) -> Result<u64>;
    /// Sequence number the next appended event will receive.
    async fn next_event_seq(&self) -> Result<u64>;
    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>>;

    // ── Command log (append-only) ──

    async fn append_command(&self, command: &Command) -> Result<u64>;
    async fn read_commands(&self) -> Result<Vec<Command>>;

    // ── Command transactions ──

    /// Start recording the writes of one command. Transactions do not
    /// nest. The command log is outside every transaction.
    async fn begin(&self) -> Result<()>;
    /// Keep everything written since `begin`.
    async fn commit(&self) -> Result<()>;
    /// Discard everything written since `begin`, key allocation and
    /// appended events included.
    async fn rollback(&self) -> Result<()>;

    // ── Snapshot ──

    async fn snapshot(&self) -> Result<StoreSnapshot>;
}

/// Point-in-time copy of the owned state, every list ordered by key.
/// The command log is deliberately absent: it is input, not state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_key: Key,
    pub instances: Vec<ElementInstance>,
    pub jobs: Vec<Job>,
    pub incidents: Vec<Incident>,
    pub events: Vec<(u64, RuntimeEvent)>,
}
