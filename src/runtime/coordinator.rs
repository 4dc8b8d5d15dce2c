//! Sequential coordinator for one orchestration instance.
//!
//! The coordinator body is deterministic: it reads no clock, draws no random
//! values and performs no I/O of its own. Every effect goes through the
//! activity executor or the instance store, and every activity outcome is
//! recorded in the instance history in the same atomic update that appends
//! it to `output`. Running the coordinator again over a partially recorded
//! history therefore replays the finished steps from history and continues
//! from the first unfinished one.

use std::sync::Arc;

use crate::providers::{InstanceStore, ProviderError};
use crate::runtime::activity::{ActivityContext, ActivityExecutor};
use crate::{durable_error, durable_info, durable_warn};
use crate::{ActivityPlan, Event, OrchestrationInstance, OrchestrationStatus};

/// Prefix of the error recorded when history and plan disagree.
pub const NONDETERMINISM_PREFIX: &str = "nondeterministic";

/// Logging context for the step currently being coordinated.
#[derive(Debug, Clone)]
pub struct CoordinatorContext {
    instance_id: String,
    step: usize,
    replaying: bool,
}

impl CoordinatorContext {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            step: 0,
            replaying: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// True while the current step's outcome is being taken from history.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }
}

#[derive(Debug, Clone, Default)]
struct RecordedStep {
    name: String,
    input: String,
    result: Option<String>,
}

/// Step outcomes recovered from an instance history.
#[derive(Debug, Default)]
struct ReplayState {
    steps: Vec<RecordedStep>,
}

impl ReplayState {
    fn from_history(history: &[Event]) -> Self {
        let mut steps: Vec<RecordedStep> = Vec::new();
        for event in history {
            match event {
                Event::ActivityScheduled { step, name, input, .. } => {
                    if steps.len() <= *step {
                        steps.resize_with(*step + 1, RecordedStep::default);
                    }
                    steps[*step].name = name.clone();
                    steps[*step].input = input.clone();
                }
                Event::ActivityCompleted { step, result, .. } => {
                    if let Some(s) = steps.get_mut(*step) {
                        s.result = Some(result.clone());
                    }
                }
                _ => {}
            }
        }
        Self { steps }
    }

    fn step(&self, k: usize) -> Option<&RecordedStep> {
        self.steps.get(k)
    }
}

/// Drives instances through their activity plans.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn InstanceStore>,
    executor: ActivityExecutor,
}

impl Coordinator {
    pub fn new(store: Arc<dyn InstanceStore>, executor: ActivityExecutor) -> Self {
        Self { store, executor }
    }

    /// Run `plan` for `instance_id` until the instance is terminal.
    ///
    /// Step `k + 1` is never started before step `k` has completed, and the
    /// first activity failure terminates the instance. Returns the final
    /// record, whose `output` is the orchestration's return value. A store
    /// error leaves the instance in its last committed state, from which it
    /// can be resumed.
    pub async fn run(&self, instance_id: &str, plan: &ActivityPlan) -> Result<OrchestrationInstance, ProviderError> {
        let mut ctx = CoordinatorContext::new(instance_id);
        let record = self
            .store
            .read_instance(instance_id)
            .await?
            .ok_or_else(|| ProviderError::not_found("run", instance_id))?;

        if record.status.is_terminal() {
            return Ok(record);
        }
        if record.plan != *plan {
            let error = format!("{NONDETERMINISM_PREFIX}: plan differs from the plan the instance was started with");
            durable_error!(ctx, error = %error, "orchestration failed");
            return self.fail_instance(instance_id, &error).await;
        }

        let replay = ReplayState::from_history(&record.history);
        if record.status == OrchestrationStatus::Pending {
            self.store.update(instance_id, &|r| r.mark_running()).await?;
            durable_info!(ctx, steps = plan.len(), "orchestration started");
        } else {
            durable_info!(ctx, recorded_steps = replay.steps.len(), "orchestration resumed from history");
        }

        for (k, step) in plan.steps().iter().enumerate() {
            ctx.step = k;
            let recorded = replay.step(k);
            ctx.replaying = recorded.is_some_and(|r| r.result.is_some());

            match recorded {
                Some(r) if r.name != step.name || r.input != step.input => {
                    let error = format!(
                        "{NONDETERMINISM_PREFIX}: step {k} recorded {}({}) but plan schedules {}({})",
                        r.name, r.input, step.name, step.input
                    );
                    ctx.replaying = false;
                    durable_error!(ctx, error = %error, "orchestration failed");
                    return self.fail_instance(instance_id, &error).await;
                }
                Some(RecordedStep { result: Some(_), .. }) => continue,
                Some(_) => {
                    durable_warn!(ctx, activity_name = %step.name, "re-running activity scheduled before restart");
                }
                None => {
                    self.store.update(instance_id, &|r| r.record_scheduled(k)).await?;
                }
            }

            durable_info!(ctx, activity_name = %step.name, "calling activity");
            let activity_ctx = ActivityContext::new(instance_id, step.name.clone(), k);
            match self.executor.execute(activity_ctx, step.input.clone()).await {
                Ok(result) => {
                    self.store
                        .update(instance_id, &|r| r.record_completed(k, result.clone()))
                        .await?;
                }
                Err(failure) => {
                    let error = failure.to_string();
                    durable_error!(ctx, activity_name = %step.name, error = %error, "orchestration failed");
                    return self
                        .store
                        .update(instance_id, &|r| r.record_failed(k, error.clone()))
                        .await;
                }
            }
        }

        let done = self.store.update(instance_id, &|r| r.complete()).await?;
        ctx.replaying = false;
        durable_info!(ctx, outputs = done.output.len(), "orchestration completed");
        Ok(done)
    }

    /// Move a non-terminal instance straight to Failed with `error`.
    pub(crate) async fn fail_instance(&self, instance_id: &str, error: &str) -> Result<OrchestrationInstance, ProviderError> {
        self.store
            .update(instance_id, &|r| {
                if r.status == OrchestrationStatus::Pending {
                    r.mark_running()?;
                }
                r.fail(error)
            })
            .await
    }
}
