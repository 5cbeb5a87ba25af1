use crate::types::*;
use serde::{Deserialize, Serialize};

/// Runtime events: the durable audit trail of a partition. Every state
/// change the engine makes is recorded here, in application order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    ProcessInstanceCreated {
        process_instance_key: Key,
        process_id: String,
    },
    ElementActivating {
        key: Key,
        parent_key: Option<Key>,
        element_id: String,
        element_type: ElementType,
        loop_counter: Option<u32>,
    },
    ElementActivated {
        key: Key,
        element_id: String,
    },
    ElementCompleting {
        key: Key,
        element_id: String,
    },
    ElementCompleted {
        key: Key,
        element_id: String,
    },
    ElementTerminating {
        key: Key,
        element_id: String,
    },
    ElementTerminated {
        key: Key,
        element_id: String,
    },
    /// Produced toward workers; carries the scope snapshot at creation.
    JobCreated {
        job_key: Key,
        job_type: String,
        activity_type: ActivityType,
        element_instance_key: Key,
        process_instance_key: Key,
        element_id: String,
        retries: u32,
        variables: VariableDocument,
    },
    JobActivated {
        job_key: Key,
    },
    JobCompleted {
        job_key: Key,
        variables: VariableDocument,
    },
    JobFailed {
        job_key: Key,
        retries: u32,
        backoff_ms: Option<u64>,
        recur_at: Option<Timestamp>,
        error_message: String,
    },
    JobRecurredAfterBackoff {
        job_key: Key,
    },
    JobCancelled {
        job_key: Key,
        reason: CancelReason,
    },
    VariablesMerged {
        scope_key: Key,
        variables: VariableDocument,
    },
    IncidentCreated {
        incident_key: Key,
        element_instance_key: Key,
        job_key: Option<Key>,
        error_type: ErrorType,
        error_message: String,
    },
    IncidentResolved {
        incident_key: Key,
    },
    /// Dropped together with its terminated element instance.
    IncidentAbandoned {
        incident_key: Key,
    },
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::ProcessInstanceCreated { .. } => "ProcessInstanceCreated",
            RuntimeEvent::ElementActivating { .. } => "ElementActivating",
            RuntimeEvent::ElementActivated { .. } => "ElementActivated",
            RuntimeEvent::ElementCompleting { .. } => "ElementCompleting",
            RuntimeEvent::ElementCompleted { .. } => "ElementCompleted",
            RuntimeEvent::ElementTerminating { .. } => "ElementTerminating",
            RuntimeEvent::ElementTerminated { .. } => "ElementTerminated",
            RuntimeEvent::JobCreated { .. } => "JobCreated",
            RuntimeEvent::JobActivated { .. } => "JobActivated",
            RuntimeEvent::JobCompleted { .. } => "JobCompleted",
            RuntimeEvent::JobFailed { .. } => "JobFailed",
            RuntimeEvent::JobRecurredAfterBackoff { .. } => "JobRecurredAfterBackoff",
            RuntimeEvent::JobCancelled { .. } => "JobCancelled",
            RuntimeEvent::VariablesMerged { .. } => "VariablesMerged",
            RuntimeEvent::IncidentCreated { .. } => "IncidentCreated",
            RuntimeEvent::IncidentResolved { .. } => "IncidentResolved",
            RuntimeEvent::IncidentAbandoned { .. } => "IncidentAbandoned",
        }
    }

    /// The job this event is about, if any.
    pub fn job_key(&self) -> Option<Key> {
        match self {
            RuntimeEvent::JobCreated { job_key, .. }
            | RuntimeEvent::JobActivated { job_key }
            | RuntimeEvent::JobCompleted { job_key, .. }
            | RuntimeEvent::JobFailed { job_key, .. }
            | RuntimeEvent::JobRecurredAfterBackoff { job_key }
            | RuntimeEvent::JobCancelled { job_key, .. } => Some(*job_key),
            RuntimeEvent::IncidentCreated { job_key, .. } => *job_key,
            _ => None,
        }
    }
}
