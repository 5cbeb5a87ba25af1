use crate::events::RuntimeEvent;
use crate::store::{ProcessStore, StoreSnapshot};
use crate::types::*;
use crate::variables::{merge_shallow, VariableStore};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
struct Scope {
    parent: Option<Key>,
    bindings: VariableDocument,
}

#[derive(Default)]
struct MemoryState {
    next_key: Key,
    instances: BTreeMap<Key, ElementInstance>,
    jobs: BTreeMap<Key, Job>,
    incidents: BTreeMap<Key, Incident>,
    events: Vec<RuntimeEvent>,
    commands: Vec<Command>,
    scopes: BTreeMap<Key, Scope>,
    journal: Option<Journal>,
    scope_journal: Option<BTreeMap<Key, Option<Scope>>>,
}

/// What an open transaction overwrote: the first prior value of every
/// touched key (`None` for keys it created), plus the key counter and
/// event log length at `begin`.
#[derive(Default)]
struct Journal {
    next_key: Key,
    events: usize,
    instances: BTreeMap<Key, Option<ElementInstance>>,
    jobs: BTreeMap<Key, Option<Job>>,
    incidents: BTreeMap<Key, Option<Incident>>,
}

fn remember<T: Clone>(saved: &mut BTreeMap<Key, Option<T>>, current: &BTreeMap<Key, T>, key: Key) {
    saved.entry(key).or_insert_with(|| current.get(&key).cloned());
}

fn restore<T>(current: &mut BTreeMap<Key, T>, saved: BTreeMap<Key, Option<T>>) {
    for (key, previous) in saved {
        match previous {
            Some(value) => {
                current.insert(key, value);
            }
            None => {
                current.remove(&key);
            }
        }
    }
}

/// In-memory `ProcessStore` + `VariableStore`. Ordered maps only, so
/// iteration order (and therefore every query) is deterministic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn next_key(&self) -> Result<Key> {
        let mut state = self.state.write().await;
        state.next_key += 1;
        Ok(state.next_key)
    }

    async fn save_instance(&self, instance: &ElementInstance) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(journal) = state.journal.as_mut() {
            remember(&mut journal.instances, &state.instances, instance.key);
        }
        state.instances.insert(instance.key, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, key: Key) -> Result<Option<ElementInstance>> {
        Ok(self.state.read().await.instances.get(&key).cloned())
    }

    async fn load_children(&self, parent_key: Key) -> Result<Vec<ElementInstance>> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.parent_key == Some(parent_key))
            .cloned()
            .collect())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(journal) = state.journal.as_mut() {
            remember(&mut journal.jobs, &state.jobs, job.key);
        }
        state.jobs.insert(job.key, job.clone());
        Ok(())
    }

    async fn load_job(&self, key: Key) -> Result<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&key).cloned())
    }

    async fn activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.state == JobState::Created && j.job_type == job_type)
            .take(max)
            .cloned()
            .collect())
    }

    async fn due_recurrences(&self, now: Timestamp) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Failed && j.retries > 0)
            .filter(|j| j.recur_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.recur_at, j.key));
        Ok(due)
    }

    async fn save_incident(&self, incident: &Incident) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(journal) = state.journal.as_mut() {
            remember(&mut journal.incidents, &state.incidents, incident.key);
        }
        state.incidents.insert(incident.key, incident.clone());
        Ok(())
    }

    async fn load_incident(&self, key: Key) -> Result<Option<Incident>> {
        Ok(self.state.read().await.incidents.get(&key).cloned())
    }

    async fn load_incidents(&self, process_instance_key: Key) -> Result<Vec<Incident>> {
        Ok(self
            .state
            .read()
            .await
            .incidents
            .values()
            .filter(|i| i.process_instance_key == process_instance_key)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &RuntimeEvent) -> Result<u64> {
        let mut state = self.state.write().await;
        state.events.push(event.clone());
        Ok(state.events.len() as u64)
    }

    async fn next_event_seq(&self) -> Result<u64> {
        Ok(self.state.read().await.events.len() as u64 + 1)
    }

    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>> {
        let state = self.state.read().await;
        let skip = from_seq.saturating_sub(1) as usize;
        Ok(state
            .events
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, e)| (i as u64 + 1, e.clone()))
            .collect())
    }

    async fn append_command(&self, command: &Command) -> Result<u64> {
        let mut state = self.state.write().await;
        state.commands.push(command.clone());
        Ok(state.commands.len() as u64)
    }

    async fn read_commands(&self) -> Result<Vec<Command>> {
        Ok(self.state.read().await.commands.clone())
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.journal.is_some() {
            bail!("store transaction already open");
        }
        state.journal = Some(Journal {
            next_key: state.next_key,
            events: state.events.len(),
            ..Journal::default()
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state
            .write()
            .await
            .journal
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("no open store transaction"))
    }

    async fn rollback(&self) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let journal = state
            .journal
            .take()
            .ok_or_else(|| anyhow!("no open store transaction"))?;
        state.next_key = journal.next_key;
        state.events.truncate(journal.events);
        restore(&mut state.instances, journal.instances);
        restore(&mut state.jobs, journal.jobs);
        restore(&mut state.incidents, journal.incidents);
        Ok(())
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        let state = self.state.read().await;
        Ok(StoreSnapshot {
            next_key: state.next_key,
            instances: state.instances.values().cloned().collect(),
            jobs: state.jobs.values().cloned().collect(),
            incidents: state.incidents.values().cloned().collect(),
            events: state
                .events
                .iter()
                .enumerate()
                .map(|(i, e)| (i as u64 + 1, e.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn create_scope(&self, scope_key: Key, parent: Option<Key>) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(parent) = parent {
            if !state.scopes.contains_key(&parent) {
                return Err(anyhow!("parent scope {parent} of {scope_key} does not exist"));
            }
        }
        if state.scopes.contains_key(&scope_key) {
            return Ok(());
        }
        if let Some(saved) = state.scope_journal.as_mut() {
            saved.entry(scope_key).or_insert(None);
        }
        state.scopes.insert(
            scope_key,
            Scope {
                parent,
                bindings: VariableDocument::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, scope_key: Key, name: &str) -> Result<Option<Value>> {
        let state = self.state.read().await;
        let mut cursor = Some(scope_key);
        while let Some(key) = cursor {
            let scope = state
                .scopes
                .get(&key)
                .ok_or_else(|| anyhow!("unknown variable scope {key}"))?;
            if let Some(value) = scope.bindings.get(name) {
                return Ok(Some(value.clone()));
            }
            cursor = scope.parent;
        }
        Ok(None)
    }

    async fn merge(&self, scope_key: Key, document: &VariableDocument) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let scope = state
            .scopes
            .get_mut(&scope_key)
            .ok_or_else(|| anyhow!("unknown variable scope {scope_key}"))?;
        if let Some(saved) = state.scope_journal.as_mut() {
            saved.entry(scope_key).or_insert_with(|| Some(scope.clone()));
        }
        merge_shallow(&mut scope.bindings, document);
        Ok(())
    }

    async fn local(&self, scope_key: Key) -> Result<VariableDocument> {
        let state = self.state.read().await;
        state
            .scopes
            .get(&scope_key)
            .map(|s| s.bindings.clone())
            .ok_or_else(|| anyhow!("unknown variable scope {scope_key}"))
    }

    async fn visible(&self, scope_key: Key) -> Result<VariableDocument> {
        let state = self.state.read().await;
        let mut chain = Vec::new();
        let mut cursor = Some(scope_key);
        while let Some(key) = cursor {
            let scope = state
                .scopes
                .get(&key)
                .ok_or_else(|| anyhow!("unknown variable scope {key}"))?;
            chain.push(&scope.bindings);
            cursor = scope.parent;
        }
        // Root first so inner scopes win.
        let mut view = VariableDocument::new();
        for bindings in chain.into_iter().rev() {
            merge_shallow(&mut view, bindings);
        }
        Ok(view)
    }

    async fn dump(&self) -> Result<BTreeMap<Key, VariableDocument>> {
        Ok(self
            .state
            .read()
            .await
            .scopes
            .iter()
            .map(|(k, s)| (*k, s.bindings.clone()))
            .collect())
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.scope_journal.is_some() {
            bail!("variable transaction already open");
        }
        state.scope_journal = Some(BTreeMap::new());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state
            .write()
            .await
            .scope_journal
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("no open variable transaction"))
    }

    async fn rollback(&self) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let saved = state
            .scope_journal
            .take()
            .ok_or_else(|| anyhow!("no open variable transaction"))?;
        restore(&mut state.scopes, saved);
        Ok(())
    }
}
