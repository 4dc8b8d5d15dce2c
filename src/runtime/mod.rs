//! Instance manager: starts orchestrations fire-and-forget and answers
//! status queries from the instance store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::providers::{InstanceStore, ProviderError};
use crate::ActivityPlan;

pub mod activity;
pub mod coordinator;
pub mod limits;
pub mod observability;
pub mod status;

use activity::{ActivityExecutor, ActivityRegistry, RetryPolicy};
use coordinator::Coordinator;
use status::InstanceStatusView;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Deadline for a single activity attempt. `None` disables the deadline.
    /// Default: 30s
    pub activity_timeout: Option<Duration>,
    /// Retry applied by the activity executor. Default: one attempt.
    pub activity_retry: RetryPolicy,
    /// Interval between store reads in `wait_for_orchestration`.
    /// Default: 10ms
    pub wait_poll_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            activity_timeout: Some(Duration::from_secs(30)),
            activity_retry: RetryPolicy::default(),
            wait_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Errors surfaced synchronously by the runtime. Activity failures are not
/// among them: they are recorded on the instance and observed via status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// In-process runtime that runs one coordinator task per active instance.
pub struct Runtime {
    store: Arc<dyn InstanceStore>,
    coordinator: Coordinator,
    registry: ActivityRegistry,
    /// Coordinator tasks for instances launched by this runtime.
    active: Mutex<HashMap<String, JoinHandle<()>>>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime over `store` with default options.
    pub fn start_with_store(store: Arc<dyn InstanceStore>, activities: ActivityRegistry) -> Arc<Self> {
        Self::start_with_options(store, activities, RuntimeOptions::default())
    }

    /// Start a runtime with custom options.
    pub fn start_with_options(
        store: Arc<dyn InstanceStore>,
        activities: ActivityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let executor = ActivityExecutor::new(activities.clone())
            .with_timeout(options.activity_timeout)
            .with_retry(options.activity_retry.clone());
        Arc::new(Self {
            coordinator: Coordinator::new(store.clone(), executor),
            store,
            registry: activities,
            active: Mutex::new(HashMap::new()),
            options,
        })
    }

    pub fn store(&self) -> Arc<dyn InstanceStore> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Create a new instance for `plan` and launch its coordinator.
    ///
    /// Returns the new instance id as soon as the Pending record is stored;
    /// the coordinator runs on its own task and reports progress only
    /// through the store.
    pub async fn start_orchestration(self: &Arc<Self>, plan: ActivityPlan) -> Result<String, RuntimeError> {
        validate_plan(&plan)?;
        for step in plan.steps() {
            if !self.registry.has(&step.name) {
                // Not rejected: the instance fails at that step, like any other activity failure.
                warn!(activity_name = %step.name, "plan references an unregistered activity");
            }
        }
        let instance_id = self.store.create_instance(plan.clone()).await?;
        debug!(instance_id = %instance_id, steps = plan.len(), "instance created");
        self.launch(instance_id.clone(), plan).await;
        Ok(instance_id)
    }

    /// Relaunch the coordinator of a non-terminal instance, e.g. one left
    /// Running by a previous process. Completed steps are replayed from
    /// history, not executed again. Terminal and already-active instances
    /// are left alone.
    pub async fn resume_instance(self: &Arc<Self>, instance_id: &str) -> Result<InstanceStatusView, RuntimeError> {
        let record = self
            .store
            .read_instance(instance_id)
            .await?
            .ok_or_else(|| RuntimeError::InstanceNotFound(instance_id.to_string()))?;
        if !record.status.is_terminal() {
            self.launch(record.id.clone(), record.plan.clone()).await;
        }
        Ok(InstanceStatusView::from(&record))
    }

    async fn launch(self: &Arc<Self>, instance_id: String, plan: ActivityPlan) {
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.is_finished());
        if active.contains_key(&instance_id) {
            debug!(instance_id = %instance_id, "coordinator already running");
            return;
        }
        let coordinator = self.coordinator.clone();
        let id = instance_id.clone();
        let handle = tokio::spawn(supervise(coordinator, id, plan));
        active.insert(instance_id, handle);
    }

    /// Current status of an instance. Never waits on coordinator progress.
    pub async fn get_orchestration_status(&self, instance_id: &str) -> Result<InstanceStatusView, RuntimeError> {
        self.store
            .read_instance(instance_id)
            .await?
            .map(InstanceStatusView::from)
            .ok_or_else(|| RuntimeError::InstanceNotFound(instance_id.to_string()))
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceStatusView, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_orchestration_status(instance_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(self.options.wait_poll_interval).await;
        }
    }

    /// Known instance ids, oldest first.
    pub async fn list_instances(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.store.list_instances().await?)
    }

    /// Abort in-flight coordinators. Their instances keep their last
    /// committed state and can be resumed by another runtime.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (instance_id, handle) in active.drain() {
            if !handle.is_finished() {
                debug!(instance_id = %instance_id, "aborting coordinator");
                handle.abort();
            }
        }
    }
}

/// Run the coordinator until it returns a terminal record or a permanent
/// error. A retryable store error restarts it from history; a panic fails the
/// instance so it cannot stay non-terminal with no coordinator behind it.
async fn supervise(coordinator: Coordinator, instance_id: String, plan: ActivityPlan) {
    loop {
        match AssertUnwindSafe(coordinator.run(&instance_id, &plan)).catch_unwind().await {
            Ok(Ok(record)) => {
                debug!(instance_id = %instance_id, status = %record.status, "coordinator finished");
                return;
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(instance_id = %instance_id, error = %e, "coordinator stopped on retryable store error; restarting");
                tokio::time::sleep(Duration::from_millis(limits::COORDINATOR_RESTART_DELAY_MS)).await;
            }
            Ok(Err(e)) => {
                error!(instance_id = %instance_id, error = %e, "coordinator stopped on store error");
                return;
            }
            Err(panic) => {
                let message = format!("coordinator panicked: {}", activity::panic_message(&*panic));
                error!(instance_id = %instance_id, error = %message, "orchestration failed");
                if let Err(e) = coordinator.fail_instance(&instance_id, &message).await {
                    error!(instance_id = %instance_id, error = %e, "could not record coordinator panic");
                }
                return;
            }
        }
    }
}

fn validate_plan(plan: &ActivityPlan) -> Result<(), RuntimeError> {
    if plan.is_empty() {
        return Err(RuntimeError::InvalidPlan("plan has no steps".to_string()));
    }
    if plan.len() > limits::MAX_PLAN_STEPS {
        return Err(RuntimeError::InvalidPlan(format!(
            "plan has {} steps; the limit is {}",
            plan.len(),
            limits::MAX_PLAN_STEPS
        )));
    }
    if let Some(k) = plan.steps().iter().position(|s| s.name.trim().is_empty()) {
        return Err(RuntimeError::InvalidPlan(format!("step {k} has an empty activity name")));
    }
    Ok(())
}
