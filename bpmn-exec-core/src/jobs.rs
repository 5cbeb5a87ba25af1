//! Job ledger.
//!
//! Owns job records: creation, hand-off to workers, completion and failure
//! intake, and backoff recurrence. Every mutation is checked against the
//! owning element instance first; a response that no longer matches what
//! the instance is waiting for is rejected untouched.

use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::store::ProcessStore;
use crate::types::*;
use crate::variables::VariableStore;
use std::sync::Arc;

/// What a failure report turned into.
#[derive(Clone, Debug, PartialEq)]
pub enum FailOutcome {
    /// Retries left and no backoff: the job is activatable again.
    Retrying,
    /// Retries left: the job recurs once `recur_at` has passed.
    BackingOff { recur_at: Timestamp },
    /// No retries left. The instance stays blocked on the failed job.
    Exhausted {
        instance: ElementInstance,
        activity_type: ActivityType,
    },
}

pub struct JobLedger {
    store: Arc<dyn ProcessStore>,
    variables: Arc<dyn VariableStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn ProcessStore>, variables: Arc<dyn VariableStore>) -> Self {
        Self { store, variables }
    }

    /// Create a job for the instance's next step and mark it pending. The
    /// instance is saved.
    pub async fn create(
        &self,
        instance: &mut ElementInstance,
        activity_type: ActivityType,
        job_type: String,
        retries: u32,
    ) -> Result<Key, EngineError> {
        let key = self.store.next_key().await?;
        let snapshot = self.variables.visible(instance.key).await?;
        let job = Job {
            key,
            element_instance_key: instance.key,
            process_instance_key: instance.process_instance_key,
            element_id: instance.element_id.clone(),
            activity_type,
            job_type: job_type.clone(),
            retries,
            backoff_ms: None,
            recur_at: None,
            state: JobState::Created,
            variables: None,
            error_message: None,
        };
        self.store.save_job(&job).await?;

        instance.pending_job_key = Some(key);
        self.store.save_instance(instance).await?;

        self.store
            .append_event(&RuntimeEvent::JobCreated {
                job_key: key,
                job_type: job_type.clone(),
                activity_type,
                element_instance_key: instance.key,
                process_instance_key: instance.process_instance_key,
                element_id: instance.element_id.clone(),
                retries,
                variables: snapshot,
            })
            .await?;
        tracing::debug!(
            job_key = key,
            job_type = %job_type,
            ?activity_type,
            element = %instance.element_id,
            phase = ?instance.phase,
            cursor = instance.listener_cursor,
            "job created"
        );
        Ok(key)
    }

    pub async fn activate(&self, job_key: Key) -> Result<Verdict<JobActivation>, EngineError> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            return Ok(reject(job_key, RejectionKind::NotFound, "unknown job"));
        };
        if job.state.is_terminal() {
            return Ok(reject(job_key, RejectionKind::StaleJob, "job already finished"));
        }
        if job.state != JobState::Created {
            return Ok(reject(
                job_key,
                RejectionKind::InvalidState,
                format!("job is {:?}, not Created", job.state),
            ));
        }
        let instance = self.owner(&job).await?;
        if !instance.lifecycle_state.is_live() {
            return Ok(reject(job_key, RejectionKind::StaleJob, "element instance no longer live"));
        }

        job.state = JobState::Activated;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&RuntimeEvent::JobActivated { job_key })
            .await?;

        let variables = self.variables.visible(job.element_instance_key).await?;
        Ok(Verdict::Accepted(activation(&job, variables)))
    }

    /// Accept a worker's completion. Output variables land in the owning
    /// instance's local scope, then the instance moves past the step: the
    /// listener cursor for a listener job, `main_work_done` for a regular
    /// one. Returns the saved instance.
    pub async fn complete(
        &self,
        job_key: Key,
        variables: VariableDocument,
    ) -> Result<Verdict<ElementInstance>, EngineError> {
        let (mut job, mut instance) = match self.pending(job_key).await? {
            Verdict::Accepted(found) => found,
            Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
        };

        if !variables.is_empty() {
            self.variables.merge(instance.key, &variables).await?;
        }
        job.state = JobState::Completed;
        job.variables = Some(variables.clone());
        self.store.save_job(&job).await?;
        self.store
            .append_event(&RuntimeEvent::JobCompleted {
                job_key,
                variables: variables.clone(),
            })
            .await?;
        if !variables.is_empty() {
            self.store
                .append_event(&RuntimeEvent::VariablesMerged {
                    scope_key: instance.key,
                    variables,
                })
                .await?;
        }

        instance.pending_job_key = None;
        match job.activity_type {
            ActivityType::ExecutionListener => instance.listener_cursor += 1,
            ActivityType::Regular => instance.main_work_done = true,
        }
        self.store.save_instance(&instance).await?;
        tracing::debug!(
            job_key,
            element = %instance.element_id,
            phase = ?instance.phase,
            cursor = instance.listener_cursor,
            "job completed"
        );
        Ok(Verdict::Accepted(instance))
    }

    pub async fn fail(
        &self,
        job_key: Key,
        retries: u32,
        backoff_ms: u64,
        error_message: String,
        at_ms: Timestamp,
    ) -> Result<Verdict<FailOutcome>, EngineError> {
        let (mut job, instance) = match self.pending(job_key).await? {
            Verdict::Accepted(found) => found,
            Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
        };

        job.retries = retries;
        job.error_message = Some(error_message.clone());
        let outcome = if retries == 0 {
            job.state = JobState::Failed;
            job.backoff_ms = None;
            job.recur_at = None;
            FailOutcome::Exhausted {
                instance,
                activity_type: job.activity_type,
            }
        } else if backoff_ms > 0 {
            let recur_at = at_ms.saturating_add(i64::try_from(backoff_ms).unwrap_or(i64::MAX));
            job.state = JobState::Failed;
            job.backoff_ms = Some(backoff_ms);
            job.recur_at = Some(recur_at);
            FailOutcome::BackingOff { recur_at }
        } else {
            job.state = JobState::Created;
            job.backoff_ms = None;
            job.recur_at = None;
            FailOutcome::Retrying
        };
        self.store.save_job(&job).await?;
        self.store
            .append_event(&RuntimeEvent::JobFailed {
                job_key,
                retries,
                backoff_ms: job.backoff_ms,
                recur_at: job.recur_at,
                error_message,
            })
            .await?;
        tracing::info!(job_key, retries, recur_at = ?job.recur_at, "job failed");
        Ok(Verdict::Accepted(outcome))
    }

    /// Make a backed-off job activatable again. Only fires once its
    /// deadline has passed, and only once.
    pub async fn recur(&self, job_key: Key, at_ms: Timestamp) -> Result<Verdict<()>, EngineError> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            return Ok(reject(job_key, RejectionKind::NotFound, "unknown job"));
        };
        if job.state.is_terminal() {
            return Ok(reject(job_key, RejectionKind::StaleJob, "job already finished"));
        }
        let recur_at = match (job.state, job.retries, job.recur_at) {
            (JobState::Failed, retries, Some(recur_at)) if retries > 0 => recur_at,
            _ => {
                return Ok(reject(
                    job_key,
                    RejectionKind::InvalidState,
                    "job is not waiting for a backoff",
                ))
            }
        };
        if at_ms < recur_at {
            return Ok(reject(
                job_key,
                RejectionKind::NotYetDue,
                format!("backoff elapses at {recur_at}, now {at_ms}"),
            ));
        }
        let instance = self.owner(&job).await?;
        if !instance.lifecycle_state.is_live() || instance.pending_job_key != Some(job_key) {
            return Ok(reject(job_key, RejectionKind::StaleJob, "job no longer pending"));
        }

        job.state = JobState::Created;
        job.recur_at = None;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&RuntimeEvent::JobRecurredAfterBackoff { job_key })
            .await?;
        tracing::debug!(job_key, at_ms, "job recurred after backoff");
        Ok(Verdict::Accepted(()))
    }

    /// Cancel a job. The caller clears the instance's pending marker.
    pub async fn cancel(&self, job_key: Key, reason: CancelReason) -> Result<(), EngineError> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            return Err(EngineError::MissingRecord {
                kind: "job",
                key: job_key,
            });
        };
        if job.state.is_terminal() {
            return Ok(());
        }
        job.state = JobState::Cancelled;
        job.recur_at = None;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&RuntimeEvent::JobCancelled { job_key, reason })
            .await?;
        tracing::debug!(job_key, ?reason, "job cancelled");
        Ok(())
    }

    pub async fn activatable(
        &self,
        job_type: &str,
        max: usize,
    ) -> Result<Vec<JobActivation>, EngineError> {
        let mut activations = Vec::new();
        for job in self.store.activatable_jobs(job_type, max).await? {
            let variables = self.variables.visible(job.element_instance_key).await?;
            activations.push(activation(&job, variables));
        }
        Ok(activations)
    }

    pub async fn due_recurrences(&self, now: Timestamp) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.due_recurrences(now).await?)
    }

    // ── Helpers ──

    async fn owner(&self, job: &Job) -> Result<ElementInstance, EngineError> {
        self.store
            .load_instance(job.element_instance_key)
            .await?
            .ok_or(EngineError::MissingRecord {
                kind: "element instance",
                key: job.element_instance_key,
            })
    }

    /// The job and its instance, if the job is the step the instance is
    /// currently waiting on and a worker may still report on it.
    async fn pending(&self, job_key: Key) -> Result<Verdict<(Job, ElementInstance)>, EngineError> {
        let Some(job) = self.store.load_job(job_key).await? else {
            return Ok(reject(job_key, RejectionKind::NotFound, "unknown job"));
        };
        match job.state {
            JobState::Completed | JobState::Cancelled => {
                return Ok(reject(job_key, RejectionKind::StaleJob, "job already finished"))
            }
            JobState::Failed => {
                return Ok(reject(
                    job_key,
                    RejectionKind::InvalidState,
                    "job failed and is not activatable",
                ))
            }
            JobState::Created | JobState::Activated => {}
        }
        let instance = self.owner(&job).await?;
        if !instance.lifecycle_state.is_live() {
            return Ok(reject(job_key, RejectionKind::StaleJob, "element instance no longer live"));
        }
        if instance.pending_job_key != Some(job_key) {
            return Ok(reject(
                job_key,
                RejectionKind::StaleJob,
                "job is not the instance's pending step",
            ));
        }
        Ok(Verdict::Accepted((job, instance)))
    }
}

fn activation(job: &Job, variables: VariableDocument) -> JobActivation {
    JobActivation {
        job_key: job.key,
        job_type: job.job_type.clone(),
        activity_type: job.activity_type,
        element_instance_key: job.element_instance_key,
        process_instance_key: job.process_instance_key,
        element_id: job.element_id.clone(),
        retries: job.retries,
        variables,
    }
}

fn reject<T>(job_key: Key, kind: RejectionKind, reason: impl Into<String>) -> Verdict<T> {
    let rejection = Rejection::new(kind, reason);
    tracing::warn!(job_key, kind = ?rejection.kind, reason = %rejection.reason, "job command rejected");
    Verdict::Rejected(rejection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    async fn setup() -> (Arc<MemoryStore>, JobLedger, ElementInstance) {
        let store = Arc::new(MemoryStore::new());
        let ledger = JobLedger::new(store.clone(), store.clone());
        let key = store.next_key().await.unwrap();
        store.create_scope(key, None).await.unwrap();
        let mut instance = ElementInstance::new(key, None, key, "p", "task", ElementType::ServiceTask);
        instance.phase = Phase::MainWork;
        store.save_instance(&instance).await.unwrap();
        (store, ledger, instance)
    }

    fn doc(value: serde_json::Value) -> VariableDocument {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_marks_instance_pending() {
        let (store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 3)
            .await
            .unwrap();
        assert_eq!(instance.pending_job_key, Some(job_key));
        let saved = store.load_instance(instance.key).await.unwrap().unwrap();
        assert_eq!(saved.pending_job_key, Some(job_key));
        let job = store.load_job(job_key).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Created);
    }

    #[tokio::test]
    async fn test_complete_merges_locally_and_marks_done() {
        let (store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 3)
            .await
            .unwrap();
        let Verdict::Accepted(instance) = ledger
            .complete(job_key, doc(json!({"out": 1})))
            .await
            .unwrap()
        else {
            panic!("completion rejected");
        };
        assert!(instance.main_work_done);
        assert_eq!(instance.pending_job_key, None);
        assert_eq!(store.local(instance.key).await.unwrap()["out"], json!(1));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_stale() {
        let (_store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::ExecutionListener, "audit".into(), 3)
            .await
            .unwrap();
        assert!(matches!(
            ledger.complete(job_key, VariableDocument::new()).await.unwrap(),
            Verdict::Accepted(_)
        ));
        match ledger.complete(job_key, VariableDocument::new()).await.unwrap() {
            Verdict::Rejected(r) => assert_eq!(r.kind, RejectionKind::StaleJob),
            other => panic!("expected rejection, got {other:?}"),
        }
        match ledger.complete(999, VariableDocument::new()).await.unwrap() {
            Verdict::Rejected(r) => assert_eq!(r.kind, RejectionKind::NotFound),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_paths() {
        let (store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 3)
            .await
            .unwrap();

        let outcome = ledger.fail(job_key, 2, 0, "boom".into(), 10).await.unwrap();
        assert_eq!(outcome, Verdict::Accepted(FailOutcome::Retrying));
        assert_eq!(store.load_job(job_key).await.unwrap().unwrap().state, JobState::Created);

        let outcome = ledger.fail(job_key, 1, 500, "boom".into(), 20).await.unwrap();
        assert_eq!(outcome, Verdict::Accepted(FailOutcome::BackingOff { recur_at: 520 }));

        // Cannot fail again while backing off.
        assert!(matches!(
            ledger.fail(job_key, 0, 0, "boom".into(), 30).await.unwrap(),
            Verdict::Rejected(Rejection { kind: RejectionKind::InvalidState, .. })
        ));
    }

    #[tokio::test]
    async fn test_recur_respects_deadline_and_fires_once() {
        let (store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 3)
            .await
            .unwrap();
        ledger.fail(job_key, 2, 100, "slow".into(), 1_000).await.unwrap();

        assert!(matches!(
            ledger.recur(job_key, 1_099).await.unwrap(),
            Verdict::Rejected(Rejection { kind: RejectionKind::NotYetDue, .. })
        ));
        assert_eq!(ledger.recur(job_key, 1_100).await.unwrap(), Verdict::Accepted(()));
        assert!(matches!(
            ledger.recur(job_key, 1_200).await.unwrap(),
            Verdict::Rejected(Rejection { kind: RejectionKind::InvalidState, .. })
        ));
        let job = store.load_job(job_key).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.recur_at, None);
    }

    #[tokio::test]
    async fn test_exhausted_keeps_instance_pending() {
        let (store, ledger, mut instance) = setup().await;
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 1)
            .await
            .unwrap();
        let outcome = ledger.fail(job_key, 0, 0, "dead".into(), 5).await.unwrap();
        assert!(matches!(
            outcome,
            Verdict::Accepted(FailOutcome::Exhausted {
                activity_type: ActivityType::Regular,
                ..
            })
        ));
        let saved = store.load_instance(instance.key).await.unwrap().unwrap();
        assert_eq!(saved.pending_job_key, Some(job_key));
        assert_eq!(store.load_job(job_key).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_activation_hands_out_visible_variables() {
        let (store, ledger, mut instance) = setup().await;
        store.merge(instance.key, &doc(json!({"order": 7}))).await.unwrap();
        let job_key = ledger
            .create(&mut instance, ActivityType::Regular, "work".into(), 3)
            .await
            .unwrap();

        let polled = ledger.activatable("work", 10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].job_key, job_key);

        let Verdict::Accepted(activation) = ledger.activate(job_key).await.unwrap() else {
            panic!("activation rejected");
        };
        assert_eq!(activation.variables["order"], json!(7));
        assert!(ledger.activatable("work", 10).await.unwrap().is_empty());
    }
}
