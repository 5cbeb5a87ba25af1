use crate::events::RuntimeEvent;
use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Engine-allocated key for element instances, jobs and incidents.
/// Monotonic per partition, never reused.
pub type Key = u64;

/// Epoch milliseconds. Only ever taken from a command payload.
pub type Timestamp = i64;

/// A shallow variable document. `serde_json::Map` is ordered, which keeps
/// snapshots and digests stable across replays.
pub type VariableDocument = serde_json::Map<String, serde_json::Value>;

// ─── Element lifecycle ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl LifecycleState {
    /// Still progressing: commands for this instance are accepted.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LifecycleState::Activating | LifecycleState::Activated | LifecycleState::Completing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Terminated)
    }
}

/// Where an element instance is inside its own listener chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    StartListeners,
    MainWork,
    EndListeners,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Process,
    SubProcess,
    StartEvent,
    EndEvent,
    ServiceTask,
    ManualTask,
    MultiInstanceBody,
}

/// What an element does between its start and end listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MainWork {
    /// A REGULAR job of the element's own type.
    Job,
    /// Activate the scope's start element; done once no child is live.
    Scope,
    /// Spawn the inner instances; done once all of them completed.
    MultiInstance,
    /// Nothing to wait for.
    PassThrough,
}

impl ElementType {
    pub fn main_work(&self) -> MainWork {
        match self {
            ElementType::ServiceTask => MainWork::Job,
            ElementType::Process | ElementType::SubProcess => MainWork::Scope,
            ElementType::MultiInstanceBody => MainWork::MultiInstance,
            ElementType::StartEvent | ElementType::EndEvent | ElementType::ManualTask => {
                MainWork::PassThrough
            }
        }
    }
}

// ─── Multi-instance ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiInstanceMode {
    Sequential,
    Parallel,
}

/// Runtime bookkeeping carried by a multi-instance body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceState {
    pub mode: MultiInstanceMode,
    pub total: u32,
    pub spawned: u32,
    pub completed_child_count: u32,
    /// Input collection captured when the body started, if any.
    pub items: Option<Vec<serde_json::Value>>,
}

impl MultiInstanceState {
    pub fn is_drained(&self) -> bool {
        self.completed_child_count >= self.total
    }
}

// ─── Element instance ─────────────────────────────────────────

/// One runtime activation of a process-graph node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    /// Owning scope. `None` only for the process root.
    pub parent_key: Option<Key>,
    pub process_instance_key: Key,
    pub process_id: String,
    pub element_id: String,
    pub element_type: ElementType,
    pub lifecycle_state: LifecycleState,
    pub phase: Phase,
    pub listener_cursor: u32,
    pub pending_job_key: Option<Key>,
    /// Set while an unresolved incident blocks this instance.
    pub incident_key: Option<Key>,
    pub main_work_done: bool,
    /// 1-based index of a multi-instance child.
    pub loop_counter: Option<u32>,
    pub multi_instance: Option<MultiInstanceState>,
}

impl ElementInstance {
    pub fn new(
        key: Key,
        parent_key: Option<Key>,
        process_instance_key: Key,
        process_id: impl Into<String>,
        element_id: impl Into<String>,
        element_type: ElementType,
    ) -> Self {
        Self {
            key,
            parent_key,
            process_instance_key,
            process_id: process_id.into(),
            element_id: element_id.into(),
            element_type,
            lifecycle_state: LifecycleState::Activating,
            phase: Phase::StartListeners,
            listener_cursor: 0,
            pending_job_key: None,
            incident_key: None,
            main_work_done: false,
            loop_counter: None,
            multi_instance: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.incident_key.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.parent_key.is_none()
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Regular,
    ExecutionListener,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Activated,
    Completed,
    Failed,
    /// Orphaned by termination or superseded after an incident.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: Key,
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub activity_type: ActivityType,
    pub job_type: String,
    pub retries: u32,
    pub backoff_ms: Option<u64>,
    /// Not-before deadline of the pending recurrence.
    pub recur_at: Option<Timestamp>,
    pub state: JobState,
    pub variables: Option<VariableDocument>,
    pub error_message: Option<String>,
}

/// Handed to a worker when a job is activated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobActivation {
    pub job_key: Key,
    pub job_type: String,
    pub activity_type: ActivityType,
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub retries: u32,
    pub variables: VariableDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The owning element instance was terminated.
    Orphaned,
    /// Replaced by a new job for the same step after an incident was resolved.
    Superseded,
}

// ─── Incidents ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    Created,
    Resolved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// A job failed with no retries left.
    JobNoRetries,
    /// A job type or input collection could not be evaluated.
    ExtractValueError,
}

/// The exact step an incident interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub phase: Phase,
    pub listener_cursor: u32,
    pub activity_type: ActivityType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub key: Key,
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    /// Absent when the failure happened before any job existed.
    pub job_key: Option<Key>,
    pub error_type: ErrorType,
    pub error_message: String,
    pub failed_step: FailedStep,
    pub state: IncidentState,
}

// ─── Commands ─────────────────────────────────────────────────

/// Everything that can change engine state. Times are supplied by the
/// caller so that replaying the same commands yields the same state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CreateProcessInstance {
        process_id: String,
        #[serde(default)]
        variables: VariableDocument,
    },
    ActivateJob {
        job_key: Key,
    },
    CompleteJob {
        job_key: Key,
        #[serde(default)]
        variables: VariableDocument,
    },
    FailJob {
        job_key: Key,
        retries: u32,
        #[serde(default)]
        backoff_ms: u64,
        error_message: String,
        at_ms: Timestamp,
    },
    RecurJobAfterBackoff {
        job_key: Key,
        at_ms: Timestamp,
    },
    SetVariables {
        scope_key: Key,
        variables: VariableDocument,
    },
    ResolveIncident {
        incident_key: Key,
    },
    CancelProcessInstance {
        process_instance_key: Key,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateProcessInstance { .. } => "create_process_instance",
            Command::ActivateJob { .. } => "activate_job",
            Command::CompleteJob { .. } => "complete_job",
            Command::FailJob { .. } => "fail_job",
            Command::RecurJobAfterBackoff { .. } => "recur_job_after_backoff",
            Command::SetVariables { .. } => "set_variables",
            Command::ResolveIncident { .. } => "resolve_incident",
            Command::CancelProcessInstance { .. } => "cancel_process_instance",
        }
    }
}

// ─── Command outcomes ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    NotFound,
    /// Duplicate, late or orphaned worker response.
    StaleJob,
    InvalidState,
    /// A backoff recurrence that arrived before its deadline.
    NotYetDue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Component-level verdict: either the request was accepted, or it was
/// rejected without mutating anything.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict<T> {
    Accepted(T),
    Rejected(Rejection),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Applied {
        /// Key of the entity the command created or targeted.
        key: Option<Key>,
        events: Vec<(u64, RuntimeEvent)>,
    },
    Rejected(Rejection),
}

impl CommandOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandOutcome::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            CommandOutcome::Rejected(rejection) => Some(rejection),
            CommandOutcome::Applied { .. } => None,
        }
    }

    pub fn key(&self) -> Option<Key> {
        match self {
            CommandOutcome::Applied { key, .. } => *key,
            CommandOutcome::Rejected(_) => None,
        }
    }

    pub fn events(&self) -> &[(u64, RuntimeEvent)] {
        match self {
            CommandOutcome::Applied { events, .. } => events,
            CommandOutcome::Rejected(_) => &[],
        }
    }

    /// `(job_key, job_type)` of every job this command created, in order.
    pub fn created_jobs(&self) -> Vec<(Key, String)> {
        self.events()
            .iter()
            .filter_map(|(_, event)| match event {
                RuntimeEvent::JobCreated {
                    job_key, job_type, ..
                } => Some((*job_key, job_type.clone())),
                _ => None,
            })
            .collect()
    }

    /// Keys of the incidents this command raised.
    pub fn created_incidents(&self) -> Vec<Key> {
        self.events()
            .iter()
            .filter_map(|(_, event)| match event {
                RuntimeEvent::IncidentCreated { incident_key, .. } => Some(*incident_key),
                _ => None,
            })
            .collect()
    }
}
