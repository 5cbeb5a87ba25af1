//! Incident manager.
//!
//! An incident blocks one element instance until it is resolved. At most
//! one unresolved incident exists per instance.

use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::store::ProcessStore;
use crate::types::*;
use std::sync::Arc;

/// How to pick the interrupted step back up after a resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redrive {
    /// Nothing was created: run the same step again.
    ReEvaluate,
    /// The failed job is replaced by a fresh one for the same step.
    ReplaceJob(Key),
}

pub struct IncidentManager {
    store: Arc<dyn ProcessStore>,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self { store }
    }

    /// Block the instance with a new incident. Returns `None` when the
    /// instance already has an unresolved one. The instance is saved.
    pub async fn raise(
        &self,
        instance: &mut ElementInstance,
        job_key: Option<Key>,
        error_type: ErrorType,
        failed_step: FailedStep,
        error_message: String,
    ) -> Result<Option<Key>, EngineError> {
        if let Some(existing) = instance.incident_key {
            tracing::warn!(
                element_instance_key = instance.key,
                existing,
                ?error_type,
                "instance already blocked by an incident, not raising another"
            );
            return Ok(None);
        }

        let key = self.store.next_key().await?;
        let incident = Incident {
            key,
            element_instance_key: instance.key,
            process_instance_key: instance.process_instance_key,
            element_id: instance.element_id.clone(),
            job_key,
            error_type,
            error_message: error_message.clone(),
            failed_step,
            state: IncidentState::Created,
        };
        self.store.save_incident(&incident).await?;

        instance.incident_key = Some(key);
        self.store.save_instance(instance).await?;

        self.store
            .append_event(&RuntimeEvent::IncidentCreated {
                incident_key: key,
                element_instance_key: instance.key,
                job_key,
                error_type,
                error_message: error_message.clone(),
            })
            .await?;
        tracing::info!(
            incident_key = key,
            element = %instance.element_id,
            ?error_type,
            message = %error_message,
            "incident raised"
        );
        Ok(Some(key))
    }

    /// Mark the incident resolved and unblock its instance. Returns the
    /// saved instance and how to re-drive it.
    pub async fn resolve(
        &self,
        incident_key: Key,
    ) -> Result<Verdict<(ElementInstance, Redrive)>, EngineError> {
        let Some(mut incident) = self.store.load_incident(incident_key).await? else {
            return Ok(reject(incident_key, RejectionKind::NotFound, "unknown incident"));
        };
        if incident.state == IncidentState::Resolved {
            return Ok(reject(
                incident_key,
                RejectionKind::InvalidState,
                "incident already resolved",
            ));
        }
        let mut instance = self
            .store
            .load_instance(incident.element_instance_key)
            .await?
            .ok_or(EngineError::MissingRecord {
                kind: "element instance",
                key: incident.element_instance_key,
            })?;
        if !instance.lifecycle_state.is_live() {
            return Ok(reject(
                incident_key,
                RejectionKind::InvalidState,
                "element instance no longer live",
            ));
        }

        incident.state = IncidentState::Resolved;
        self.store.save_incident(&incident).await?;
        instance.incident_key = None;
        self.store.save_instance(&instance).await?;
        self.store
            .append_event(&RuntimeEvent::IncidentResolved { incident_key })
            .await?;

        let redrive = match incident.job_key {
            Some(job_key) => Redrive::ReplaceJob(job_key),
            None => Redrive::ReEvaluate,
        };
        tracing::info!(incident_key, element = %instance.element_id, ?redrive, "incident resolved");
        Ok(Verdict::Accepted((instance, redrive)))
    }

    /// Drop the instance's unresolved incident, if any, as part of
    /// terminating it. The caller saves the instance.
    pub async fn abandon(&self, instance: &mut ElementInstance) -> Result<Option<Key>, EngineError> {
        let Some(incident_key) = instance.incident_key.take() else {
            return Ok(None);
        };
        let mut incident = self
            .store
            .load_incident(incident_key)
            .await?
            .ok_or(EngineError::MissingRecord {
                kind: "incident",
                key: incident_key,
            })?;
        incident.state = IncidentState::Resolved;
        self.store.save_incident(&incident).await?;
        self.store
            .append_event(&RuntimeEvent::IncidentAbandoned { incident_key })
            .await?;
        tracing::debug!(incident_key, element = %instance.element_id, "incident abandoned");
        Ok(Some(incident_key))
    }

    pub async fn unresolved(&self, process_instance_key: Key) -> Result<Vec<Incident>, EngineError> {
        let incidents = self.store.load_incidents(process_instance_key).await?;
        Ok(incidents
            .into_iter()
            .filter(|i| i.state == IncidentState::Created)
            .collect())
    }
}

fn reject<T>(incident_key: Key, kind: RejectionKind, reason: &str) -> Verdict<T> {
    tracing::warn!(incident_key, ?kind, reason, "resolve rejected");
    Verdict::Rejected(Rejection::new(kind, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    const STEP: FailedStep = FailedStep {
        phase: Phase::StartListeners,
        listener_cursor: 1,
        activity_type: ActivityType::ExecutionListener,
    };

    async fn setup() -> (Arc<MemoryStore>, IncidentManager, ElementInstance) {
        let store = Arc::new(MemoryStore::new());
        let manager = IncidentManager::new(store.clone());
        let key = store.next_key().await.unwrap();
        let instance = ElementInstance::new(key, None, key, "p", "task", ElementType::ServiceTask);
        store.save_instance(&instance).await.unwrap();
        (store, manager, instance)
    }

    #[tokio::test]
    async fn test_at_most_one_unresolved_incident() {
        let (store, manager, mut instance) = setup().await;
        let first = manager
            .raise(&mut instance, None, ErrorType::ExtractValueError, STEP, "x".into())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = manager
            .raise(&mut instance, None, ErrorType::ExtractValueError, STEP, "y".into())
            .await
            .unwrap();
        assert_eq!(second, None);
        assert_eq!(manager.unresolved(instance.key).await.unwrap().len(), 1);
        assert!(store.load_instance(instance.key).await.unwrap().unwrap().is_blocked());
    }

    #[tokio::test]
    async fn test_resolve_unblocks_and_picks_redrive() {
        let (_store, manager, mut instance) = setup().await;
        let key = manager
            .raise(&mut instance, Some(42), ErrorType::JobNoRetries, STEP, "dead".into())
            .await
            .unwrap()
            .unwrap();

        let Verdict::Accepted((instance, redrive)) = manager.resolve(key).await.unwrap() else {
            panic!("resolve rejected");
        };
        assert!(!instance.is_blocked());
        assert_eq!(redrive, Redrive::ReplaceJob(42));

        assert!(matches!(
            manager.resolve(key).await.unwrap(),
            Verdict::Rejected(Rejection { kind: RejectionKind::InvalidState, .. })
        ));
        assert!(matches!(
            manager.resolve(999).await.unwrap(),
            Verdict::Rejected(Rejection { kind: RejectionKind::NotFound, .. })
        ));
    }

    #[tokio::test]
    async fn test_abandon_marks_resolved() {
        let (store, manager, mut instance) = setup().await;
        let key = manager
            .raise(&mut instance, None, ErrorType::ExtractValueError, STEP, "x".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.abandon(&mut instance).await.unwrap(), Some(key));
        assert_eq!(instance.incident_key, None);
        let incident = store.load_incident(key).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Resolved);
        assert_eq!(manager.abandon(&mut instance).await.unwrap(), None);
    }
}
