//! Sequential durable orchestrations.
//!
//! An orchestration instance runs a fixed [`ActivityPlan`]: an ordered list of
//! named activities, each invoked only after the previous one finished. The
//! pieces are:
//!
//! - [`providers::InstanceStore`] owns every [`OrchestrationInstance`] record and
//!   applies atomic read-modify-write updates to it.
//! - [`runtime::activity`] resolves activity names to handlers and runs them
//!   with a deadline and an optional transparent retry.
//! - [`runtime::coordinator::Coordinator`] drives one instance through its plan,
//!   recording each step in the instance history so a later run can replay it.
//! - [`runtime::Runtime`] starts instances fire-and-forget and answers status
//!   queries from the store.
//! - [`server`] exposes start and status polling over HTTP.
//!
//! ```rust,no_run
//! use durable_sequence::providers::in_memory::InMemoryInstanceStore;
//! use durable_sequence::runtime::{Runtime, RuntimeOptions};
//! use durable_sequence::samples;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryInstanceStore::default());
//! let rt = Runtime::start_with_options(store, samples::activities(), RuntimeOptions::default());
//! let id = rt.start_orchestration(samples::hello_cities_plan()).await?;
//! let status = rt.wait_for_orchestration(&id, Duration::from_secs(5)).await?;
//! assert_eq!(status.output, vec!["Hello Tokyo!", "Hello Seattle!", "Hello London!"]);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;
pub mod providers;
pub mod runtime;
pub mod samples;
pub mod server;

pub use providers::{InstanceStore, ProviderError};
pub use runtime::activity::{ActivityFailure, ActivityRegistry, FailureKind};
pub use runtime::status::InstanceStatusView;
pub use runtime::{Runtime, RuntimeError, RuntimeOptions, WaitError};

/// First event id in an instance history.
pub const INITIAL_EVENT_ID: u64 = 1;

/// Lifecycle state of an orchestration instance.
///
/// Transitions only move forward: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::Failed => "Failed",
        }
    }

    /// Completed and Failed are terminal; records in these states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationStatus::Completed | OrchestrationStatus::Failed)
    }

    /// True while the instance has not reached a terminal state.
    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }

    fn rank(&self) -> u8 {
        match self {
            OrchestrationStatus::Pending => 0,
            OrchestrationStatus::Running => 1,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed => 2,
        }
    }

    /// Whether `self -> next` is a legal single transition.
    pub fn can_transition_to(&self, next: OrchestrationStatus) -> bool {
        matches!(
            (self, next),
            (OrchestrationStatus::Pending, OrchestrationStatus::Running)
                | (OrchestrationStatus::Running, OrchestrationStatus::Completed)
                | (OrchestrationStatus::Running, OrchestrationStatus::Failed)
        )
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity invocation in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub input: String,
}

impl PlanStep {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
        }
    }
}

/// Ordered sequence of activity invocations run by one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityPlan {
    steps: Vec<PlanStep>,
}

impl ActivityPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to the end of the plan.
    pub fn then(mut self, name: impl Into<String>, input: impl Into<String>) -> Self {
        self.steps.push(PlanStep::new(name, input));
        self
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl From<Vec<PlanStep>> for ActivityPlan {
    fn from(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

impl FromIterator<PlanStep> for ActivityPlan {
    fn from_iter<T: IntoIterator<Item = PlanStep>>(iter: T) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

/// Recorded history of an instance, appended as the coordinator makes progress.
///
/// Replaying a history against the same plan reproduces the same scheduling
/// decisions without re-invoking completed activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        steps: usize,
    },
    ActivityScheduled {
        event_id: u64,
        step: usize,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        step: usize,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        step: usize,
        error: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: Vec<String>,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. } => *event_id,
        }
    }
}

/// Rejected mutation of an instance record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("instance {id} is {status}; terminal records are immutable")]
    Terminal { id: String, status: OrchestrationStatus },
    #[error("illegal status transition {from} -> {to}")]
    Illegal {
        from: OrchestrationStatus,
        to: OrchestrationStatus,
    },
    #[error("step {step} recorded out of order (expected step {expected})")]
    OutOfOrder { step: usize, expected: usize },
    #[error("output has {len} entries but the plan only has {steps} steps")]
    OutputOverflow { len: usize, steps: usize },
    #[error("output is append-only while running")]
    OutputRewritten,
    #[error("history is append-only")]
    HistoryRewritten,
    #[error("instance identity or plan changed")]
    IdentityChanged,
}

/// Store-owned record of one orchestration instance.
///
/// Callers only ever see clones; mutation goes through
/// [`InstanceStore::update`], which checks every new revision against the
/// previous one with [`OrchestrationInstance::validate_successor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    pub id: String,
    pub status: OrchestrationStatus,
    pub plan: ActivityPlan,
    pub output: Vec<String>,
    pub error: Option<String>,
    pub history: Vec<Event>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    /// Bumped by the store on every committed update.
    pub revision: u64,
}

impl OrchestrationInstance {
    pub fn new(id: impl Into<String>, plan: ActivityPlan, created_at_ms: u64) -> Self {
        Self {
            id: id.into(),
            status: OrchestrationStatus::Pending,
            plan,
            output: Vec::new(),
            error: None,
            history: Vec::new(),
            created_at_ms,
            completed_at_ms: None,
            revision: 0,
        }
    }

    fn next_event_id(&self) -> u64 {
        INITIAL_EVENT_ID + self.history.len() as u64
    }

    fn ensure_transition(&self, to: OrchestrationStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Illegal { from: self.status, to });
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        match self.status {
            OrchestrationStatus::Running => Ok(()),
            s if s.is_terminal() => Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: s,
            }),
            s => Err(TransitionError::Illegal {
                from: s,
                to: OrchestrationStatus::Running,
            }),
        }
    }

    /// Pending -> Running.
    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.ensure_transition(OrchestrationStatus::Running)?;
        self.status = OrchestrationStatus::Running;
        let event_id = self.next_event_id();
        self.history.push(Event::OrchestrationStarted {
            event_id,
            steps: self.plan.len(),
        });
        Ok(())
    }

    pub fn record_scheduled(&mut self, step: usize) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let expected = self.output.len();
        let Some(plan_step) = self.plan.steps().get(step).cloned() else {
            return Err(TransitionError::OutputOverflow {
                len: step + 1,
                steps: self.plan.len(),
            });
        };
        if step != expected {
            return Err(TransitionError::OutOfOrder { step, expected });
        }
        let event_id = self.next_event_id();
        self.history.push(Event::ActivityScheduled {
            event_id,
            step,
            name: plan_step.name,
            input: plan_step.input,
        });
        Ok(())
    }

    /// Appends the result of `step` to `output`.
    pub fn record_completed(&mut self, step: usize, result: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let expected = self.output.len();
        if step != expected {
            return Err(TransitionError::OutOfOrder { step, expected });
        }
        if step >= self.plan.len() {
            return Err(TransitionError::OutputOverflow {
                len: step + 1,
                steps: self.plan.len(),
            });
        }
        let result = result.into();
        let event_id = self.next_event_id();
        self.history.push(Event::ActivityCompleted {
            event_id,
            step,
            result: result.clone(),
        });
        self.output.push(result);
        Ok(())
    }

    /// Records the failure of `step` and terminates the instance.
    pub fn record_failed(&mut self, step: usize, error: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let expected = self.output.len();
        if step != expected {
            return Err(TransitionError::OutOfOrder { step, expected });
        }
        let error = error.into();
        let event_id = self.next_event_id();
        self.history.push(Event::ActivityFailed {
            event_id,
            step,
            error: error.clone(),
        });
        self.fail(error)
    }

    /// Running -> Completed. Requires every plan step to have produced output.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.ensure_transition(OrchestrationStatus::Completed)?;
        if self.output.len() != self.plan.len() {
            return Err(TransitionError::OutOfOrder {
                step: self.plan.len(),
                expected: self.output.len(),
            });
        }
        self.status = OrchestrationStatus::Completed;
        let event_id = self.next_event_id();
        self.history.push(Event::OrchestrationCompleted {
            event_id,
            output: self.output.clone(),
        });
        Ok(())
    }

    /// Running -> Failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_transition(OrchestrationStatus::Failed)?;
        let error = error.into();
        self.status = OrchestrationStatus::Failed;
        let event_id = self.next_event_id();
        self.history.push(Event::OrchestrationFailed {
            event_id,
            error: error.clone(),
        });
        self.error = Some(error);
        Ok(())
    }

    /// Checks that `next` is a legal successor revision of `self`.
    pub fn validate_successor(&self, next: &OrchestrationInstance) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            if self.same_content(next) {
                return Ok(());
            }
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if next.id != self.id || next.plan != self.plan || next.created_at_ms != self.created_at_ms {
            return Err(TransitionError::IdentityChanged);
        }
        if next.status.rank() < self.status.rank() {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next.status,
            });
        }
        if next.output.len() > next.plan.len() {
            return Err(TransitionError::OutputOverflow {
                len: next.output.len(),
                steps: next.plan.len(),
            });
        }
        if !next.output.starts_with(&self.output) {
            return Err(TransitionError::OutputRewritten);
        }
        if !next.history.starts_with(&self.history) {
            return Err(TransitionError::HistoryRewritten);
        }
        if next.error.is_some() && next.status != OrchestrationStatus::Failed {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next.status,
            });
        }
        Ok(())
    }

    fn same_content(&self, other: &OrchestrationInstance) -> bool {
        self.id == other.id
            && self.status == other.status
            && self.plan == other.plan
            && self.output == other.output
            && self.error == other.error
            && self.history == other.history
            && self.created_at_ms == other.created_at_ms
            && self.completed_at_ms == other.completed_at_ms
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
