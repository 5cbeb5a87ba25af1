//! SimulatedWorker: plays every job worker for one process instance.
//!
//! Follows the event log: each `JobCreated` or `JobRecurredAfterBackoff`
//! queues the job, which is then activated and completed (or, when
//! configured, failed once with a backoff). Time is simulated: each tick
//! advances the clock by `tick_ms`, and due backoffs are submitted as
//! recurrence commands stamped with the simulated time.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bpmn_exec_core::{
    ActivityType, Command, Engine, Incident, Key, LifecycleState, RuntimeEvent, Timestamp,
    VariableDocument,
};
use serde_json::json;

use crate::config::RunnerConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub process_instance_key: Key,
    pub state: LifecycleState,
    pub ticks: u64,
    pub simulated_ms: Timestamp,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub open_incidents: Vec<Incident>,
}

pub struct SimulatedWorker {
    engine: Arc<Engine>,
    tick_ms: u64,
    max_ticks: u64,
    fail_first_attempt: bool,
    backoff_ms: u64,
}

impl SimulatedWorker {
    pub fn new(engine: Arc<Engine>, config: &RunnerConfig) -> Self {
        Self {
            engine,
            tick_ms: config.tick_ms,
            max_ticks: config.max_ticks,
            fail_first_attempt: config.fail_first_attempt,
            backoff_ms: config.backoff_ms,
        }
    }

    /// Work the instance until it finishes, gets stuck on an incident, or
    /// runs out of ticks.
    pub async fn run(&self, process_instance_key: Key) -> Result<RunSummary> {
        tracing::info!(
            process_instance_key,
            tick_ms = self.tick_ms,
            max_ticks = self.max_ticks,
            fail_first = self.fail_first_attempt,
            "simulated worker started"
        );
        let mut queue: VecDeque<Key> = VecDeque::new();
        let mut attempted: BTreeSet<Key> = BTreeSet::new();
        let mut next_seq = 1;
        let mut now: Timestamp = 0;
        let mut jobs_completed = 0;
        let mut jobs_failed = 0;
        let mut ticks = 0;

        loop {
            for command in self.engine.due_backoff_commands(now).await? {
                let outcome = self.engine.apply(command).await?;
                if let Some(rejection) = outcome.rejection() {
                    tracing::warn!(reason = %rejection.reason, "recurrence rejected");
                }
            }

            // Drain every job the log offers, including jobs created by
            // completions within this tick.
            loop {
                for (seq, event) in self.engine.events_since(next_seq).await? {
                    next_seq = seq + 1;
                    match event {
                        RuntimeEvent::JobCreated { job_key, .. }
                        | RuntimeEvent::JobRecurredAfterBackoff { job_key } => {
                            queue.push_back(job_key)
                        }
                        _ => {}
                    }
                }
                let Some(job_key) = queue.pop_front() else {
                    break;
                };
                match self.work(job_key, now, &mut attempted).await? {
                    Handled::Completed => jobs_completed += 1,
                    Handled::Failed => jobs_failed += 1,
                    Handled::Skipped => {}
                }
            }

            let state = self
                .engine
                .instance(process_instance_key)
                .await?
                .map(|i| i.lifecycle_state)
                .unwrap_or(LifecycleState::Terminated);
            let open_incidents = self.engine.unresolved_incidents(process_instance_key).await?;
            let finished = state.is_terminal() || !open_incidents.is_empty();
            if finished || ticks >= self.max_ticks {
                if !open_incidents.is_empty() {
                    tracing::warn!(
                        process_instance_key,
                        incidents = open_incidents.len(),
                        "instance blocked by incidents"
                    );
                } else if !finished {
                    tracing::warn!(process_instance_key, ticks, "tick budget exhausted");
                }
                return Ok(RunSummary {
                    process_instance_key,
                    state,
                    ticks,
                    simulated_ms: now,
                    jobs_completed,
                    jobs_failed,
                    open_incidents,
                });
            }

            ticks += 1;
            now += self.tick_ms as Timestamp;
            tokio::time::sleep(Duration::from_millis(self.tick_ms)).await;
        }
    }

    async fn work(&self, job_key: Key, now: Timestamp, attempted: &mut BTreeSet<Key>) -> Result<Handled> {
        let outcome = self.engine.apply(Command::ActivateJob { job_key }).await?;
        if let Some(rejection) = outcome.rejection() {
            tracing::debug!(job_key, reason = %rejection.reason, "job not activatable");
            return Ok(Handled::Skipped);
        }
        let Some(job) = self.engine.job(job_key).await? else {
            return Ok(Handled::Skipped);
        };

        let first_attempt = attempted.insert(job_key);
        if self.fail_first_attempt && first_attempt && job.retries > 1 {
            tracing::debug!(job_key, job_type = %job.job_type, "failing first attempt");
            self.engine
                .apply(Command::FailJob {
                    job_key,
                    retries: job.retries - 1,
                    backoff_ms: self.backoff_ms,
                    error_message: format!("simulated failure of {}", job.job_type),
                    at_ms: now,
                })
                .await?;
            return Ok(Handled::Failed);
        }

        let variables = output(&job.element_id, job.activity_type);
        let outcome = self
            .engine
            .apply(Command::CompleteJob { job_key, variables })
            .await?;
        if let Some(rejection) = outcome.rejection() {
            tracing::warn!(job_key, reason = %rejection.reason, "completion rejected");
            return Ok(Handled::Skipped);
        }
        tracing::debug!(job_key, job_type = %job.job_type, "job completed");
        Ok(Handled::Completed)
    }
}

enum Handled {
    Completed,
    Failed,
    Skipped,
}

/// What the simulated worker reports back: a marker per element for the
/// main job, nothing for listeners.
fn output(element_id: &str, activity_type: ActivityType) -> VariableDocument {
    let mut variables = VariableDocument::new();
    if activity_type == ActivityType::Regular {
        variables.insert(format!("{element_id}Done"), json!(true));
    }
    variables
}
