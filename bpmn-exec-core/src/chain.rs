//! Listener chain driver.
//!
//! Decides what an element instance needs next from its phase, cursor and
//! the listeners of its definition. Pure: the engine owns every effect.

use crate::definition::{Element, JobTypeSpec, ListenerSpec};
use crate::expression::{EvaluationError, ExpressionResolver};
use crate::types::{ActivityType, ElementInstance, ElementType, Phase, VariableDocument};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Create the next job in the chain.
    CreateJob {
        activity_type: ActivityType,
        job_type: JobTypeSpec,
        retries: u32,
    },
    /// The current phase is exhausted.
    AdvancePhase,
    /// End listeners are exhausted: the element may complete.
    Done,
    /// A job is outstanding or the main work is still in flight.
    Wait,
}

/// The parts of an element definition the driver reads.
#[derive(Clone, Copy, Debug)]
pub struct ChainView<'a> {
    pub start_listeners: &'a [ListenerSpec],
    pub end_listeners: &'a [ListenerSpec],
    pub main_job: Option<&'a JobTypeSpec>,
    pub main_retries: u32,
}

impl<'a> ChainView<'a> {
    /// A multi-instance body runs no listeners of its own; they belong to
    /// each inner instance.
    pub fn of(instance: &ElementInstance, element: &'a Element) -> Self {
        if instance.element_type == ElementType::MultiInstanceBody {
            return Self {
                start_listeners: &[],
                end_listeners: &[],
                main_job: None,
                main_retries: element.retries,
            };
        }
        Self {
            start_listeners: &element.start_listeners,
            end_listeners: &element.end_listeners,
            main_job: element.job_type.as_ref(),
            main_retries: element.retries,
        }
    }

    fn listeners(&self, phase: Phase) -> &'a [ListenerSpec] {
        match phase {
            Phase::StartListeners => self.start_listeners,
            Phase::EndListeners => self.end_listeners,
            Phase::MainWork => &[],
        }
    }
}

pub fn next_step(instance: &ElementInstance, view: &ChainView<'_>) -> Step {
    if instance.pending_job_key.is_some() {
        return Step::Wait;
    }
    match instance.phase {
        Phase::StartListeners | Phase::EndListeners => {
            let listeners = view.listeners(instance.phase);
            match listeners.get(instance.listener_cursor as usize) {
                Some(listener) => Step::CreateJob {
                    activity_type: ActivityType::ExecutionListener,
                    job_type: listener.job_type.clone(),
                    retries: listener.retries,
                },
                None if instance.phase == Phase::StartListeners => Step::AdvancePhase,
                None => Step::Done,
            }
        }
        Phase::MainWork => {
            if instance.main_work_done {
                return Step::AdvancePhase;
            }
            match view.main_job {
                Some(job_type) => Step::CreateJob {
                    activity_type: ActivityType::Regular,
                    job_type: job_type.clone(),
                    retries: view.main_retries,
                },
                None => Step::Wait,
            }
        }
    }
}

/// A `CreateJob` step with its job type resolved, or the reason it could
/// not be.
#[derive(Clone, Debug, PartialEq)]
pub enum Prepared {
    Job {
        activity_type: ActivityType,
        job_type: String,
        retries: u32,
    },
    Unresolvable {
        activity_type: ActivityType,
        error: EvaluationError,
    },
}

pub fn prepare(
    activity_type: ActivityType,
    job_type: &JobTypeSpec,
    retries: u32,
    resolver: &dyn ExpressionResolver,
    scope: &VariableDocument,
) -> Prepared {
    match resolver.resolve(job_type, scope) {
        Ok(job_type) => Prepared::Job {
            activity_type,
            job_type,
            retries,
        },
        Err(error) => Prepared::Unresolvable {
            activity_type,
            error,
        },
    }
}
