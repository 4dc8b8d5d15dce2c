use std::time::Duration;

use tracing::{debug, warn};

use crate::runtime::limits::{
    MAX_CREATE_ATTEMPTS, UPDATE_BACKOFF_BASE_MS, UPDATE_BACKOFF_MAX_MS, UPDATE_CONTENTION_WARN_AFTER,
};
use crate::{now_ms, ActivityPlan, OrchestrationInstance, TransitionError};

pub mod error;
/// In-memory store for tests and single-process deployments.
pub mod in_memory;

pub use error::ProviderError;

/// Mutation applied by [`InstanceStore::update`]. It may run more than once
/// when a concurrent writer wins the race, so it must not have side effects
/// beyond the record it is given.
pub type Mutator<'a> = dyn Fn(&mut OrchestrationInstance) -> Result<(), TransitionError> + Send + Sync + 'a;

/// Storage abstraction owning every orchestration instance record.
///
/// Backends implement four primitives; `create_instance` and `update` are
/// provided on top of them. `update` is linearizable per instance id because
/// every commit is a compare-and-swap on the record's `revision`: two writers
/// racing on the same id cannot both win, and the loser re-reads and
/// re-applies its mutation. Writers on different ids never contend.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a brand-new record. Returns `Ok(false)` if the id is already taken.
    async fn insert_instance(&self, record: OrchestrationInstance) -> Result<bool, ProviderError>;

    /// Read the latest committed revision of a record.
    async fn read_instance(&self, instance: &str) -> Result<Option<OrchestrationInstance>, ProviderError>;

    /// Replace the record with `record` if its committed revision is still
    /// `expected_revision`. A revision mismatch must be reported as a
    /// retryable error (see [`ProviderError::contention`]).
    async fn compare_and_swap(&self, expected_revision: u64, record: OrchestrationInstance) -> Result<(), ProviderError>;

    /// Enumerate known instance ids, oldest first.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Allocate a fresh id, register a Pending record for `plan` and return the id.
    async fn create_instance(&self, plan: ActivityPlan) -> Result<String, ProviderError> {
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let id = uuid::Uuid::new_v4().to_string();
            let record = OrchestrationInstance::new(id.clone(), plan.clone(), now_ms());
            if self.insert_instance(record).await? {
                return Ok(id);
            }
            warn!(instance_id = %id, "generated instance id already taken; regenerating");
        }
        Err(ProviderError::permanent(
            "create_instance",
            "could not allocate a unique instance id",
        ))
    }

    /// Atomic read-modify-write of one record.
    ///
    /// The mutated record is validated against the previous revision, so no
    /// mutator can move a status backwards, rewrite output or touch a
    /// terminal record. The store stamps `completed_at_ms` when the record
    /// enters a terminal state. A retryable compare-and-swap failure is
    /// retried here with capped exponential backoff until it commits; callers
    /// only see permanent errors.
    async fn update(&self, instance: &str, mutator: &Mutator<'_>) -> Result<OrchestrationInstance, ProviderError> {
        let mut attempts: u32 = 0;
        loop {
            let current = self
                .read_instance(instance)
                .await?
                .ok_or_else(|| ProviderError::not_found("update", instance))?;

            let mut next = current.clone();
            mutator(&mut next)?;
            current.validate_successor(&next)?;
            if current.status.is_terminal() {
                return Ok(current);
            }

            next.completed_at_ms = if next.status.is_terminal() { Some(now_ms()) } else { None };
            next.revision = current.revision + 1;

            match self.compare_and_swap(current.revision, next.clone()).await {
                Ok(()) => return Ok(next),
                Err(e) if e.is_retryable() => {
                    attempts = attempts.saturating_add(1);
                    let backoff_ms = update_backoff_ms(attempts);
                    if attempts == UPDATE_CONTENTION_WARN_AFTER {
                        warn!(instance_id = %instance, attempts, error = %e, "update keeps losing races; still retrying");
                    } else {
                        debug!(instance_id = %instance, attempts, backoff_ms, error = %e, "update lost a race; retrying");
                    }
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    warn!(instance_id = %instance, attempts, error = %e, "update failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Backoff before retry number `attempts` (1-based): doubling, capped.
fn update_backoff_ms(attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(16);
    UPDATE_BACKOFF_BASE_MS.saturating_mul(1 << shift).min(UPDATE_BACKOFF_MAX_MS)
}
