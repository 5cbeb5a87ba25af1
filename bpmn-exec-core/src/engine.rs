//! Element lifecycle orchestrator.
//!
//! [`Engine::apply`] is the single sequential command processor of a
//! partition. A command is applied completely, every cascade included,
//! before the next one is looked at. Cascades run from an agenda of element
//! keys so that fan-out never needs async recursion. A command that fails
//! part way, for instance on the cascade bound, is rolled back whole.

use crate::chain::{next_step, prepare, ChainView, Prepared, Step};
use crate::config::EngineConfig;
use crate::definition::{Cardinality, DefinitionTable, Element, ProcessDefinition};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::expression::{value_kind, EvaluationError, ExpressionResolver, SimpleExpressionResolver};
use crate::incidents::{IncidentManager, Redrive};
use crate::jobs::{FailOutcome, JobLedger};
use crate::store::{ProcessStore, StoreSnapshot};
use crate::store_memory::MemoryStore;
use crate::types::*;
use crate::variables::{without_loop_bindings, VariableStore, INPUT_ELEMENT, LOOP_COUNTER};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Element instances waiting to be advanced within the current command.
struct Agenda {
    queue: VecDeque<Key>,
    steps: usize,
    limit: usize,
}

impl Agenda {
    fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            steps: 0,
            limit,
        }
    }

    fn push(&mut self, key: Key) {
        self.queue.push_back(key);
    }

    fn pop(&mut self) -> Result<Option<Key>, EngineError> {
        let Some(key) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.steps += 1;
        if self.steps > self.limit {
            return Err(EngineError::CascadeLimit { limit: self.limit });
        }
        Ok(Some(key))
    }
}

/// Locals handed to a multi-instance child.
struct LoopBinding {
    loop_counter: u32,
    item: Option<Value>,
}

pub struct Engine {
    store: Arc<dyn ProcessStore>,
    variables: Arc<dyn VariableStore>,
    definitions: DefinitionTable,
    resolver: Arc<dyn ExpressionResolver>,
    config: EngineConfig,
    jobs: JobLedger,
    incidents: IncidentManager,
    processor: Mutex<()>,
    healthy: AtomicBool,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        variables: Arc<dyn VariableStore>,
        definitions: DefinitionTable,
        config: EngineConfig,
    ) -> Self {
        Self {
            jobs: JobLedger::new(store.clone(), variables.clone()),
            incidents: IncidentManager::new(store.clone()),
            store,
            variables,
            definitions,
            resolver: Arc::new(SimpleExpressionResolver),
            config,
            processor: Mutex::new(()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Engine over a fresh [`MemoryStore`] serving both ports.
    pub fn in_memory(definitions: DefinitionTable, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store, definitions, config)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.definitions
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Accept commands again after the store has been repaired.
    pub fn reset_health(&self) {
        self.healthy.store(true, Ordering::SeqCst);
        tracing::info!("engine health reset");
    }

    // ─── Command processing ───────────────────────────────────────

    /// Apply one command. Rejections are outcomes, not errors; an `Err`
    /// means the command could not be processed at all and left no state
    /// behind beyond its command log entry.
    pub async fn apply(&self, command: Command) -> Result<CommandOutcome, EngineError> {
        let _processor = self.processor.lock().await;
        if !self.is_healthy() {
            return Err(EngineError::Unhealthy);
        }
        let kind = command.kind();
        match self.apply_locked(command).await {
            Err(err) if err.is_infrastructure() => {
                tracing::error!(command = kind, error = %err, "store failure, engine marked unhealthy");
                self.healthy.store(false, Ordering::SeqCst);
                Err(err)
            }
            Err(err) => {
                tracing::error!(command = kind, error = %err, "command failed");
                Err(err)
            }
            Ok(outcome) => Ok(outcome),
        }
    }

    /// Log the command, then apply it inside a store transaction: either
    /// the whole cascade lands or none of it does.
    async fn apply_locked(&self, command: Command) -> Result<CommandOutcome, EngineError> {
        self.store.append_command(&command).await?;
        self.store.begin().await?;
        if let Err(err) = self.variables.begin().await {
            if let Err(rollback) = self.store.rollback().await {
                tracing::error!(error = %rollback, "process store rollback failed");
            }
            return Err(err.into());
        }
        match self.run(command).await {
            Ok(outcome) => {
                self.store.commit().await?;
                self.variables.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                self.discard().await;
                Err(err)
            }
        }
    }

    /// Roll back both stores. A failed rollback leaves the error to the
    /// store failure that caused it.
    async fn discard(&self) {
        if let Err(err) = self.store.rollback().await {
            tracing::error!(error = %err, "process store rollback failed");
        }
        if let Err(err) = self.variables.rollback().await {
            tracing::error!(error = %err, "variable store rollback failed");
        }
    }

    async fn run(&self, command: Command) -> Result<CommandOutcome, EngineError> {
        let from_seq = self.store.next_event_seq().await?;
        let mut agenda = Agenda::new(self.config.max_cascade_steps);
        tracing::debug!(command = command.kind(), "applying command");

        let verdict = match command {
            Command::CreateProcessInstance {
                process_id,
                variables,
            } => self.create_process_instance(&process_id, variables, &mut agenda).await?,
            Command::ActivateJob { job_key } => match self.jobs.activate(job_key).await? {
                Verdict::Accepted(_) => Verdict::Accepted(Some(job_key)),
                Verdict::Rejected(r) => Verdict::Rejected(r),
            },
            Command::CompleteJob { job_key, variables } => {
                match self.jobs.complete(job_key, variables).await? {
                    Verdict::Accepted(instance) => {
                        agenda.push(instance.key);
                        Verdict::Accepted(Some(job_key))
                    }
                    Verdict::Rejected(r) => Verdict::Rejected(r),
                }
            }
            Command::FailJob {
                job_key,
                retries,
                backoff_ms,
                error_message,
                at_ms,
            } => {
                self.fail_job(job_key, retries, backoff_ms, error_message, at_ms)
                    .await?
            }
            Command::RecurJobAfterBackoff { job_key, at_ms } => {
                match self.jobs.recur(job_key, at_ms).await? {
                    Verdict::Accepted(()) => Verdict::Accepted(Some(job_key)),
                    Verdict::Rejected(r) => Verdict::Rejected(r),
                }
            }
            Command::SetVariables {
                scope_key,
                variables,
            } => self.set_variables(scope_key, variables).await?,
            Command::ResolveIncident { incident_key } => {
                self.resolve_incident(incident_key, &mut agenda).await?
            }
            Command::CancelProcessInstance {
                process_instance_key,
            } => self.cancel_process_instance(process_instance_key).await?,
        };

        match verdict {
            Verdict::Rejected(rejection) => Ok(CommandOutcome::Rejected(rejection)),
            Verdict::Accepted(key) => {
                while let Some(next) = agenda.pop()? {
                    self.advance(next, &mut agenda).await?;
                }
                let events = self.store.read_events(from_seq).await?;
                Ok(CommandOutcome::Applied { key, events })
            }
        }
    }

    // ─── Command handlers ─────────────────────────────────────────

    async fn create_process_instance(
        &self,
        process_id: &str,
        variables: VariableDocument,
        agenda: &mut Agenda,
    ) -> Result<Verdict<Option<Key>>, EngineError> {
        if !self.definitions.contains(process_id) {
            return Ok(rejected(
                RejectionKind::NotFound,
                format!("unknown process: {process_id}"),
            ));
        }
        let definition = self.definitions.process(process_id)?;

        let key = self.store.next_key().await?;
        self.store
            .append_event(&RuntimeEvent::ProcessInstanceCreated {
                process_instance_key: key,
                process_id: process_id.to_string(),
            })
            .await?;
        self.activate_with_key(key, None, &definition, process_id, None, agenda)
            .await?;
        if !variables.is_empty() {
            self.merge_variables(key, variables).await?;
        }
        tracing::info!(process_instance_key = key, process_id, "process instance created");
        Ok(Verdict::Accepted(Some(key)))
    }

    async fn fail_job(
        &self,
        job_key: Key,
        retries: u32,
        backoff_ms: u64,
        error_message: String,
        at_ms: Timestamp,
    ) -> Result<Verdict<Option<Key>>, EngineError> {
        let outcome = match self
            .jobs
            .fail(job_key, retries, backoff_ms, error_message.clone(), at_ms)
            .await?
        {
            Verdict::Accepted(outcome) => outcome,
            Verdict::Rejected(r) => return Ok(Verdict::Rejected(r)),
        };
        if let FailOutcome::Exhausted {
            mut instance,
            activity_type,
        } = outcome
        {
            let failed_step = FailedStep {
                phase: instance.phase,
                listener_cursor: instance.listener_cursor,
                activity_type,
            };
            self.incidents
                .raise(
                    &mut instance,
                    Some(job_key),
                    ErrorType::JobNoRetries,
                    failed_step,
                    error_message,
                )
                .await?;
        }
        Ok(Verdict::Accepted(Some(job_key)))
    }

    async fn set_variables(
        &self,
        scope_key: Key,
        variables: VariableDocument,
    ) -> Result<Verdict<Option<Key>>, EngineError> {
        let Some(instance) = self.store.load_instance(scope_key).await? else {
            return Ok(rejected(
                RejectionKind::NotFound,
                format!("unknown scope {scope_key}"),
            ));
        };
        if !instance.lifecycle_state.is_live() {
            return Ok(rejected(
                RejectionKind::InvalidState,
                format!("scope {scope_key} is {:?}", instance.lifecycle_state),
            ));
        }
        if !variables.is_empty() {
            self.merge_variables(scope_key, variables).await?;
        }
        Ok(Verdict::Accepted(Some(scope_key)))
    }

    async fn resolve_incident(
        &self,
        incident_key: Key,
        agenda: &mut Agenda,
    ) -> Result<Verdict<Option<Key>>, EngineError> {
        let (mut instance, redrive) = match self.incidents.resolve(incident_key).await? {
            Verdict::Accepted(resolved) => resolved,
            Verdict::Rejected(r) => return Ok(Verdict::Rejected(r)),
        };
        match redrive {
            Redrive::ReplaceJob(failed_job) => {
                self.jobs.cancel(failed_job, CancelReason::Superseded).await?;
                instance.pending_job_key = None;
                self.store.save_instance(&instance).await?;
            }
            Redrive::ReEvaluate => {
                let collection_pending = instance.element_type == ElementType::MultiInstanceBody
                    && instance.phase == Phase::MainWork
                    && instance.multi_instance.is_none();
                if collection_pending {
                    let definition = self.definitions.process(&instance.process_id)?;
                    let element = definition.element(&instance.element_id)?;
                    self.spawn_multi_instance(&mut instance, &definition, element, agenda)
                        .await?;
                }
            }
        }
        agenda.push(instance.key);
        Ok(Verdict::Accepted(Some(incident_key)))
    }

    async fn cancel_process_instance(
        &self,
        process_instance_key: Key,
    ) -> Result<Verdict<Option<Key>>, EngineError> {
        let Some(root) = self.store.load_instance(process_instance_key).await? else {
            return Ok(rejected(
                RejectionKind::NotFound,
                format!("unknown process instance {process_instance_key}"),
            ));
        };
        if !root.is_root() {
            return Ok(rejected(
                RejectionKind::InvalidState,
                format!("{process_instance_key} is not a process instance"),
            ));
        }
        if !root.lifecycle_state.is_live() {
            return Ok(rejected(
                RejectionKind::InvalidState,
                format!("process instance is {:?}", root.lifecycle_state),
            ));
        }

        // Pre-order walk; reversed, every descendant precedes its ancestors.
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(instance) = stack.pop() {
            let children = self.store.load_children(instance.key).await?;
            stack.extend(children.into_iter().rev());
            order.push(instance);
        }
        for mut instance in order.into_iter().rev() {
            if instance.lifecycle_state.is_live() {
                self.terminate(&mut instance).await?;
            }
        }
        tracing::info!(process_instance_key, "process instance cancelled");
        Ok(Verdict::Accepted(Some(process_instance_key)))
    }

    async fn terminate(&self, instance: &mut ElementInstance) -> Result<(), EngineError> {
        instance.lifecycle_state = LifecycleState::Terminating;
        self.store.save_instance(instance).await?;
        self.emit(RuntimeEvent::ElementTerminating {
            key: instance.key,
            element_id: instance.element_id.clone(),
        })
        .await?;

        if let Some(job_key) = instance.pending_job_key.take() {
            self.jobs.cancel(job_key, CancelReason::Orphaned).await?;
        }
        self.incidents.abandon(instance).await?;

        instance.lifecycle_state = LifecycleState::Terminated;
        self.store.save_instance(instance).await?;
        self.emit(RuntimeEvent::ElementTerminated {
            key: instance.key,
            element_id: instance.element_id.clone(),
        })
        .await?;
        Ok(())
    }

    // ─── Lifecycle ────────────────────────────────────────────────

    /// Drive one element instance as far as it goes without outside input.
    async fn advance(&self, key: Key, agenda: &mut Agenda) -> Result<(), EngineError> {
        let mut instance = self.load_instance(key).await?;
        let definition = self.definitions.process(&instance.process_id)?;
        let element = definition.element(&instance.element_id)?;

        loop {
            if !instance.lifecycle_state.is_live() || instance.is_blocked() {
                return Ok(());
            }
            let view = ChainView::of(&instance, element);
            match next_step(&instance, &view) {
                Step::Wait => return Ok(()),
                Step::CreateJob {
                    activity_type,
                    job_type,
                    retries,
                } => {
                    let scope = self.variables.visible(instance.key).await?;
                    match prepare(
                        activity_type,
                        &job_type,
                        retries,
                        self.resolver.as_ref(),
                        &scope,
                    ) {
                        Prepared::Job {
                            activity_type,
                            job_type,
                            retries,
                        } => {
                            self.jobs
                                .create(&mut instance, activity_type, job_type, retries)
                                .await?;
                        }
                        Prepared::Unresolvable {
                            activity_type,
                            error,
                        } => {
                            let failed_step = FailedStep {
                                phase: instance.phase,
                                listener_cursor: instance.listener_cursor,
                                activity_type,
                            };
                            self.incidents
                                .raise(
                                    &mut instance,
                                    None,
                                    ErrorType::ExtractValueError,
                                    failed_step,
                                    error.to_string(),
                                )
                                .await?;
                        }
                    }
                    return Ok(());
                }
                Step::AdvancePhase => match instance.phase {
                    Phase::StartListeners => {
                        self.enter_main_work(&mut instance, &definition, element, agenda)
                            .await?
                    }
                    Phase::MainWork => self.enter_completing(&mut instance).await?,
                    Phase::EndListeners => {
                        return Err(EngineError::InvalidTransition {
                            key,
                            detail: "no phase after end listeners".into(),
                        })
                    }
                },
                Step::Done => {
                    self.complete_element(&mut instance, &definition, agenda)
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    async fn enter_main_work(
        &self,
        instance: &mut ElementInstance,
        definition: &ProcessDefinition,
        element: &Element,
        agenda: &mut Agenda,
    ) -> Result<(), EngineError> {
        instance.lifecycle_state = LifecycleState::Activated;
        instance.phase = Phase::MainWork;
        instance.listener_cursor = 0;
        self.store.save_instance(instance).await?;
        self.emit(RuntimeEvent::ElementActivated {
            key: instance.key,
            element_id: instance.element_id.clone(),
        })
        .await?;
        tracing::debug!(key = instance.key, element = %instance.element_id, "element activated");

        match instance.element_type.main_work() {
            MainWork::Job => {}
            MainWork::PassThrough => {
                instance.main_work_done = true;
                self.store.save_instance(instance).await?;
            }
            MainWork::Scope => {
                let start = element
                    .start
                    .as_deref()
                    .ok_or_else(|| EngineError::InvalidTransition {
                        key: instance.key,
                        detail: format!("scope {} has no start element", element.id),
                    })?;
                self.activate_element(instance, definition, start, None, agenda)
                    .await?;
            }
            MainWork::MultiInstance => {
                self.spawn_multi_instance(instance, definition, element, agenda)
                    .await?;
            }
        }
        Ok(())
    }

    async fn enter_completing(&self, instance: &mut ElementInstance) -> Result<(), EngineError> {
        instance.lifecycle_state = LifecycleState::Completing;
        instance.phase = Phase::EndListeners;
        instance.listener_cursor = 0;
        self.store.save_instance(instance).await?;
        self.emit(RuntimeEvent::ElementCompleting {
            key: instance.key,
            element_id: instance.element_id.clone(),
        })
        .await?;
        tracing::debug!(key = instance.key, element = %instance.element_id, "element completing");
        Ok(())
    }

    async fn complete_element(
        &self,
        instance: &mut ElementInstance,
        definition: &ProcessDefinition,
        agenda: &mut Agenda,
    ) -> Result<(), EngineError> {
        instance.lifecycle_state = LifecycleState::Completed;
        self.store.save_instance(instance).await?;
        self.emit(RuntimeEvent::ElementCompleted {
            key: instance.key,
            element_id: instance.element_id.clone(),
        })
        .await?;

        let Some(parent_key) = instance.parent_key else {
            tracing::info!(
                process_instance_key = instance.key,
                process_id = %instance.process_id,
                "process instance completed"
            );
            return Ok(());
        };
        tracing::debug!(key = instance.key, element = %instance.element_id, "element completed");

        let mut output = self.variables.local(instance.key).await?;
        if instance.loop_counter.is_some() {
            output = without_loop_bindings(output);
        }
        if !output.is_empty() {
            self.merge_variables(parent_key, output).await?;
        }
        self.on_child_completed(parent_key, instance, definition, agenda)
            .await
    }

    async fn on_child_completed(
        &self,
        parent_key: Key,
        child: &ElementInstance,
        definition: &ProcessDefinition,
        agenda: &mut Agenda,
    ) -> Result<(), EngineError> {
        let mut parent = self.load_instance(parent_key).await?;
        if !parent.lifecycle_state.is_live() {
            return Ok(());
        }

        match parent.element_type.main_work() {
            MainWork::MultiInstance => {
                let state = parent
                    .multi_instance
                    .as_mut()
                    .ok_or_else(|| EngineError::InvalidTransition {
                        key: parent_key,
                        detail: "multi-instance body without state".into(),
                    })?;
                state.completed_child_count += 1;
                let drained = state.is_drained();
                let spawn_next =
                    state.mode == MultiInstanceMode::Sequential && state.spawned < state.total;
                tracing::debug!(
                    body = parent_key,
                    completed = state.completed_child_count,
                    total = state.total,
                    "multi-instance child completed"
                );
                if drained {
                    parent.main_work_done = true;
                    agenda.push(parent_key);
                } else if spawn_next {
                    self.spawn_child(&mut parent, definition, agenda).await?;
                }
                self.store.save_instance(&parent).await?;
            }
            MainWork::Scope => {
                let element = definition.element(&child.element_id)?;
                for target in &element.outgoing {
                    self.activate_element(&parent, definition, target, None, agenda)
                        .await?;
                }
                let children = self.store.load_children(parent_key).await?;
                if !children.iter().any(|c| c.lifecycle_state.is_live()) {
                    parent.main_work_done = true;
                    self.store.save_instance(&parent).await?;
                    agenda.push(parent_key);
                }
            }
            MainWork::Job | MainWork::PassThrough => {
                return Err(EngineError::InvalidTransition {
                    key: parent_key,
                    detail: format!("{:?} cannot own children", parent.element_type),
                })
            }
        }
        Ok(())
    }

    // ─── Activation ───────────────────────────────────────────────

    async fn activate_element(
        &self,
        parent: &ElementInstance,
        definition: &ProcessDefinition,
        element_id: &str,
        binding: Option<LoopBinding>,
        agenda: &mut Agenda,
    ) -> Result<Key, EngineError> {
        let key = self.store.next_key().await?;
        self.activate_with_key(key, Some(parent), definition, element_id, binding, agenda)
            .await?;
        Ok(key)
    }

    /// Create an instance of `element_id` and queue it. An element with a
    /// multi-instance spec gets a body first; the body's children carry a
    /// loop binding.
    async fn activate_with_key(
        &self,
        key: Key,
        parent: Option<&ElementInstance>,
        definition: &ProcessDefinition,
        element_id: &str,
        binding: Option<LoopBinding>,
        agenda: &mut Agenda,
    ) -> Result<(), EngineError> {
        let element = definition.element(element_id)?;
        let element_type = match (&element.multi_instance, &binding) {
            (Some(_), None) => ElementType::MultiInstanceBody,
            _ => element.element_type,
        };
        let (process_instance_key, parent_key) = match parent {
            Some(p) => (p.process_instance_key, Some(p.key)),
            None => (key, None),
        };

        let mut instance = ElementInstance::new(
            key,
            parent_key,
            process_instance_key,
            definition.process_id.clone(),
            element_id,
            element_type,
        );
        self.variables.create_scope(key, parent_key).await?;
        instance.loop_counter = binding.as_ref().map(|b| b.loop_counter);
        self.store.save_instance(&instance).await?;
        self.emit(RuntimeEvent::ElementActivating {
            key,
            parent_key,
            element_id: element_id.to_string(),
            element_type,
            loop_counter: instance.loop_counter,
        })
        .await?;

        if let Some(binding) = binding {
            let mut locals = VariableDocument::new();
            locals.insert(LOOP_COUNTER.to_string(), Value::from(binding.loop_counter));
            if let Some(item) = binding.item {
                locals.insert(INPUT_ELEMENT.to_string(), item);
            }
            self.merge_variables(key, locals).await?;
        }
        tracing::debug!(key, element = element_id, ?element_type, "element activating");
        agenda.push(key);
        Ok(())
    }

    /// Size the body from its cardinality and spawn the first batch. A
    /// missing or non-array input collection blocks the body with an
    /// incident instead.
    async fn spawn_multi_instance(
        &self,
        body: &mut ElementInstance,
        definition: &ProcessDefinition,
        element: &Element,
        agenda: &mut Agenda,
    ) -> Result<(), EngineError> {
        let spec = element
            .multi_instance
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition {
                key: body.key,
                detail: format!("{} is not multi-instance", element.id),
            })?;

        let (total, items) = match &spec.cardinality {
            Cardinality::Fixed(n) => (*n, None),
            Cardinality::InputCollection(name) => {
                let sized = match self.variables.get(body.key, name).await? {
                    Some(Value::Array(items)) => {
                        loop_total(name, items.len()).map(|total| (total, items))
                    }
                    other => Err(collection_error(name, other.as_ref())),
                };
                match sized {
                    Ok((total, items)) => (total, Some(items)),
                    Err(error) => {
                        let failed_step = FailedStep {
                            phase: body.phase,
                            listener_cursor: body.listener_cursor,
                            activity_type: ActivityType::Regular,
                        };
                        self.incidents
                            .raise(
                                body,
                                None,
                                ErrorType::ExtractValueError,
                                failed_step,
                                error.to_string(),
                            )
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        body.multi_instance = Some(MultiInstanceState {
            mode: spec.mode,
            total,
            spawned: 0,
            completed_child_count: 0,
            items,
        });
        tracing::debug!(body = body.key, total, mode = ?spec.mode, "multi-instance body started");

        if total == 0 {
            body.main_work_done = true;
        } else {
            let batch = match spec.mode {
                MultiInstanceMode::Parallel => total,
                MultiInstanceMode::Sequential => 1,
            };
            for _ in 0..batch {
                self.spawn_child(body, definition, agenda).await?;
            }
        }
        self.store.save_instance(body).await?;
        Ok(())
    }

    /// Spawn the body's next child. The caller saves the body.
    async fn spawn_child(
        &self,
        body: &mut ElementInstance,
        definition: &ProcessDefinition,
        agenda: &mut Agenda,
    ) -> Result<Key, EngineError> {
        let binding = {
            let state = body
                .multi_instance
                .as_mut()
                .ok_or_else(|| EngineError::InvalidTransition {
                    key: body.key,
                    detail: "multi-instance body without state".into(),
                })?;
            let index = state.spawned as usize;
            state.spawned += 1;
            LoopBinding {
                loop_counter: state.spawned,
                item: state.items.as_ref().and_then(|items| items.get(index).cloned()),
            }
        };
        let element_id = body.element_id.clone();
        self.activate_element(body, definition, &element_id, Some(binding), agenda)
            .await
    }

    // ─── Helpers ──────────────────────────────────────────────────

    async fn load_instance(&self, key: Key) -> Result<ElementInstance, EngineError> {
        self.store
            .load_instance(key)
            .await?
            .ok_or(EngineError::MissingRecord {
                kind: "element instance",
                key,
            })
    }

    async fn merge_variables(
        &self,
        scope_key: Key,
        variables: VariableDocument,
    ) -> Result<(), EngineError> {
        self.variables.merge(scope_key, &variables).await?;
        self.emit(RuntimeEvent::VariablesMerged {
            scope_key,
            variables,
        })
        .await
    }

    async fn emit(&self, event: RuntimeEvent) -> Result<(), EngineError> {
        self.store.append_event(&event).await?;
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────────

    pub async fn instance(&self, key: Key) -> Result<Option<ElementInstance>, EngineError> {
        Ok(self.store.load_instance(key).await?)
    }

    pub async fn children(&self, key: Key) -> Result<Vec<ElementInstance>, EngineError> {
        Ok(self.store.load_children(key).await?)
    }

    pub async fn job(&self, key: Key) -> Result<Option<Job>, EngineError> {
        Ok(self.store.load_job(key).await?)
    }

    pub async fn incident(&self, key: Key) -> Result<Option<Incident>, EngineError> {
        Ok(self.store.load_incident(key).await?)
    }

    pub async fn unresolved_incidents(
        &self,
        process_instance_key: Key,
    ) -> Result<Vec<Incident>, EngineError> {
        self.incidents.unresolved(process_instance_key).await
    }

    /// Variables visible from a scope.
    pub async fn variables(&self, scope_key: Key) -> Result<VariableDocument, EngineError> {
        Ok(self.variables.visible(scope_key).await?)
    }

    pub async fn variable_dump(&self) -> Result<BTreeMap<Key, VariableDocument>, EngineError> {
        Ok(self.variables.dump().await?)
    }

    pub async fn events_since(&self, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>, EngineError> {
        Ok(self.store.read_events(from_seq).await?)
    }

    /// Jobs a worker polling `job_type` could activate now.
    pub async fn activatable_jobs(
        &self,
        job_type: &str,
        max: usize,
    ) -> Result<Vec<JobActivation>, EngineError> {
        self.jobs.activatable(job_type, max).await
    }

    /// Recurrence commands whose backoff has elapsed by `now`, in deadline
    /// order. Submitting them is up to the caller.
    pub async fn due_backoff_commands(&self, now: Timestamp) -> Result<Vec<Command>, EngineError> {
        Ok(self
            .jobs
            .due_recurrences(now)
            .await?
            .into_iter()
            .map(|job| Command::RecurJobAfterBackoff {
                job_key: job.key,
                at_ms: now,
            })
            .collect())
    }

    pub async fn command_log(&self) -> Result<Vec<Command>, EngineError> {
        Ok(self.store.read_commands().await?)
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, EngineError> {
        Ok(self.store.snapshot().await?)
    }
}

fn rejected(kind: RejectionKind, reason: String) -> Verdict<Option<Key>> {
    tracing::warn!(?kind, reason = %reason, "command rejected");
    Verdict::Rejected(Rejection::new(kind, reason))
}

/// Number of children for a collection of `len` items. Loop counters are
/// `u32`, so larger collections cannot be iterated.
fn loop_total(name: &str, len: usize) -> Result<u32, EvaluationError> {
    u32::try_from(len).map_err(|_| EvaluationError {
        message: format!(
            "Expected result of the expression '{name}' to be an 'ARRAY' of at most {} items, but it has {len}.",
            u32::MAX
        ),
        warnings: Vec::new(),
    })
}

fn collection_error(name: &str, found: Option<&Value>) -> EvaluationError {
    match found {
        None => EvaluationError {
            message: format!(
                "Expected result of the expression '{name}' to be 'ARRAY', but was 'NULL'."
            ),
            warnings: vec![format!(
                "[NO_VARIABLE_FOUND] No variable found with name '{name}'"
            )],
        },
        Some(value) => EvaluationError {
            message: format!(
                "Expected result of the expression '{name}' to be 'ARRAY', but was '{}'.",
                value_kind(value)
            ),
            warnings: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    const TASK: &str = r#"
id: p
start: s
elements:
  - id: s
    type: start_event
    outgoing: [t]
  - id: t
    type: service_task
    job_type: work
    outgoing: [e]
  - id: e
    type: end_event
"#;

    fn engine(yaml: &str) -> Engine {
        let definition = ProcessDefinition::from_yaml(yaml, 3).unwrap();
        Engine::in_memory(DefinitionTable::new([definition]), EngineConfig::default())
    }

    async fn start(engine: &Engine) -> CommandOutcome {
        engine
            .apply(Command::CreateProcessInstance {
                process_id: "p".into(),
                variables: json!({"order": 1}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap()
    }

    /// L1.T1: A task without listeners creates its job and completes the process
    #[tokio::test]
    async fn test_linear_process_runs_to_completion() {
        let engine = engine(TASK);
        let created = start(&engine).await;
        let pik = created.key().unwrap();
        let jobs = created.created_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1, "work");

        let done = engine
            .apply(Command::CompleteJob {
                job_key: jobs[0].0,
                variables: json!({"paid": true}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap();
        assert!(!done.is_rejected());

        let root = engine.instance(pik).await.unwrap().unwrap();
        assert_eq!(root.lifecycle_state, LifecycleState::Completed);
        let vars = engine.variables(pik).await.unwrap();
        assert_eq!(vars["paid"], json!(true));
        assert_eq!(vars["order"], json!(1));
    }

    /// L1.T2: Unknown process is rejected without touching state
    #[tokio::test]
    async fn test_unknown_process_rejected() {
        let engine = engine(TASK);
        let outcome = engine
            .apply(Command::CreateProcessInstance {
                process_id: "nope".into(),
                variables: VariableDocument::new(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.rejection().unwrap().kind, RejectionKind::NotFound);
        assert!(engine.snapshot().await.unwrap().instances.is_empty());
        assert_eq!(engine.command_log().await.unwrap().len(), 1);
    }

    const WIDE: &str = r#"
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
      mode: parallel
      cardinality: 6
    outgoing: [e]
  - id: e
    type: end_event
"#;

    const TAIL: &str = r#"
id: p
start: s
elements:
  - id: s
    type: start_event
    outgoing: [t]
  - id: t
    type: service_task
    job_type: work
    outgoing: [m1]
  - id: m1
    type: manual_task
    outgoing: [m2]
  - id: m2
    type: manual_task
    outgoing: [e]
  - id: e
    type: end_event
"#;

    fn bounded(yaml: &str, max_cascade_steps: usize) -> Engine {
        let definition = ProcessDefinition::from_yaml(yaml, 3).unwrap();
        Engine::in_memory(
            DefinitionTable::new([definition]),
            EngineConfig {
                max_cascade_steps,
                ..EngineConfig::default()
            },
        )
    }

    /// L1.T3: A fan-out past the cascade bound leaves no instance behind
    #[tokio::test]
    async fn test_cascade_limit_rolls_back_create() {
        let engine = bounded(WIDE, 5);
        let before = engine.snapshot().await.unwrap();
        let err = engine
            .apply(Command::CreateProcessInstance {
                process_id: "p".into(),
                variables: json!({"order": 1}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CascadeLimit { limit: 5 }));
        assert!(engine.is_healthy());

        assert_eq!(engine.snapshot().await.unwrap(), before);
        assert!(engine.variable_dump().await.unwrap().is_empty());
        assert!(engine.activatable_jobs("work", 100).await.unwrap().is_empty());
        assert_eq!(engine.command_log().await.unwrap().len(), 1);

        // Nothing leaked: a process that fits still gets the first keys.
        let engine = bounded(WIDE, 100);
        let created = start(&engine).await;
        assert_eq!(created.created_jobs().len(), 6);
    }

    /// L1.T4: A completion whose cascade overruns leaves the job pending
    #[tokio::test]
    async fn test_cascade_limit_keeps_completion_pending() {
        // Creation advances root, s and t; completing t needs five steps.
        let engine = bounded(TAIL, 4);
        let created = start(&engine).await;
        let job_key = created.created_jobs()[0].0;
        let before = engine.snapshot().await.unwrap();
        let vars_before = engine.variable_dump().await.unwrap();

        let err = engine
            .apply(Command::CompleteJob {
                job_key,
                variables: json!({"paid": true}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CascadeLimit { limit: 4 }));

        assert_eq!(engine.snapshot().await.unwrap(), before);
        assert_eq!(engine.variable_dump().await.unwrap(), vars_before);
        let job = engine.job(job_key).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Created);
        let task = engine.instance(job.element_instance_key).await.unwrap().unwrap();
        assert_eq!(task.pending_job_key, Some(job_key));
        assert_eq!(engine.activatable_jobs("work", 1).await.unwrap().len(), 1);
    }

    /// L1.T8: Collections too large for a loop counter are an extraction error
    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_loop_total_refuses_oversized_collections() {
        assert_eq!(loop_total("items", 3), Ok(3));
        assert_eq!(loop_total("items", u32::MAX as usize), Ok(u32::MAX));

        let oversized = u32::MAX as usize + 1;
        let err = loop_total("items", oversized).unwrap_err();
        assert!(err.message.contains("'items'"), "{}", err.message);
        assert!(err.message.contains(&oversized.to_string()), "{}", err.message);
    }

    /// Store whose command log refuses writes.
    struct BrokenStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ProcessStore for BrokenStore {
        async fn next_key(&self) -> anyhow::Result<Key> {
            self.inner.next_key().await
        }
        async fn save_instance(&self, instance: &ElementInstance) -> anyhow::Result<()> {
            self.inner.save_instance(instance).await
        }
        async fn load_instance(&self, key: Key) -> anyhow::Result<Option<ElementInstance>> {
            self.inner.load_instance(key).await
        }
        async fn load_children(&self, parent_key: Key) -> anyhow::Result<Vec<ElementInstance>> {
            self.inner.load_children(parent_key).await
        }
        async fn save_job(&self, job: &Job) -> anyhow::Result<()> {
            self.inner.save_job(job).await
        }
        async fn load_job(&self, key: Key) -> anyhow::Result<Option<Job>> {
            self.inner.load_job(key).await
        }
        async fn activatable_jobs(&self, job_type: &str, max: usize) -> anyhow::Result<Vec<Job>> {
            self.inner.activatable_jobs(job_type, max).await
        }
        async fn due_recurrences(&self, now: Timestamp) -> anyhow::Result<Vec<Job>> {
            self.inner.due_recurrences(now).await
        }
        async fn save_incident(&self, incident: &Incident) -> anyhow::Result<()> {
            self.inner.save_incident(incident).await
        }
        async fn load_incident(&self, key: Key) -> anyhow::Result<Option<Incident>> {
            self.inner.load_incident(key).await
        }
        async fn load_incidents(&self, pik: Key) -> anyhow::Result<Vec<Incident>> {
            self.inner.load_incidents(pik).await
        }
        async fn append_event(&self, event: &RuntimeEvent) -> anyhow::Result<u64> {
            self.inner.append_event(event).await
        }
        async fn next_event_seq(&self) -> anyhow::Result<u64> {
            self.inner.next_event_seq().await
        }
        async fn read_events(&self, from_seq: u64) -> anyhow::Result<Vec<(u64, RuntimeEvent)>> {
            self.inner.read_events(from_seq).await
        }
        async fn append_command(&self, _command: &Command) -> anyhow::Result<u64> {
            Err(anyhow::anyhow!("command log unavailable"))
        }
        async fn read_commands(&self) -> anyhow::Result<Vec<Command>> {
            self.inner.read_commands().await
        }
        async fn begin(&self) -> anyhow::Result<()> {
            ProcessStore::begin(&self.inner).await
        }
        async fn commit(&self) -> anyhow::Result<()> {
            ProcessStore::commit(&self.inner).await
        }
        async fn rollback(&self) -> anyhow::Result<()> {
            ProcessStore::rollback(&self.inner).await
        }
        async fn snapshot(&self) -> anyhow::Result<StoreSnapshot> {
            self.inner.snapshot().await
        }
    }

    /// L1.T5: A store failure poisons the processor until reset
    #[tokio::test]
    async fn test_store_failure_marks_unhealthy() {
        let definition = ProcessDefinition::from_yaml(TASK, 3).unwrap();
        let store = Arc::new(BrokenStore {
            inner: MemoryStore::new(),
        });
        let engine = Engine::new(
            store,
            Arc::new(MemoryStore::new()),
            DefinitionTable::new([definition]),
            EngineConfig::default(),
        );
        let cmd = Command::CreateProcessInstance {
            process_id: "p".into(),
            variables: VariableDocument::new(),
        };

        let err = engine.apply(cmd.clone()).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert!(!engine.is_healthy());
        assert!(matches!(
            engine.apply(cmd.clone()).await.unwrap_err(),
            EngineError::Unhealthy
        ));

        engine.reset_health();
        assert!(engine.is_healthy());
        assert!(engine.apply(cmd).await.unwrap_err().is_infrastructure());
    }

    /// L1.T6: Due backoff commands carry the polling time
    #[tokio::test]
    async fn test_due_backoff_commands() {
        let engine = engine(TASK);
        let job_key = start(&engine).await.created_jobs()[0].0;
        engine
            .apply(Command::FailJob {
                job_key,
                retries: 2,
                backoff_ms: 250,
                error_message: "busy".into(),
                at_ms: 1_000,
            })
            .await
            .unwrap();

        assert!(engine.due_backoff_commands(1_249).await.unwrap().is_empty());
        assert_eq!(
            engine.due_backoff_commands(1_300).await.unwrap(),
            vec![Command::RecurJobAfterBackoff {
                job_key,
                at_ms: 1_300
            }]
        );
    }

    /// L1.T7: Variables set on a live scope are visible to later jobs
    #[tokio::test]
    async fn test_set_variables_on_scope() {
        let engine = engine(TASK);
        let pik = start(&engine).await.key().unwrap();
        let outcome = engine
            .apply(Command::SetVariables {
                scope_key: pik,
                variables: json!({"fixed": "yes"}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap();
        assert!(!outcome.is_rejected());
        let polled = engine.activatable_jobs("work", 1).await.unwrap();
        assert_eq!(polled[0].variables["fixed"], json!("yes"));

        let missing = engine
            .apply(Command::SetVariables {
                scope_key: 9_999,
                variables: VariableDocument::new(),
            })
            .await
            .unwrap();
        assert_eq!(missing.rejection().unwrap().kind, RejectionKind::NotFound);
    }
}
