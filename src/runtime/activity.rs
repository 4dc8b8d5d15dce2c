//! Activity execution: handler registry, deadlines and transparent retry.
//!
//! The coordinator only sees [`ActivityExecutor::execute`], which returns a
//! result or an [`ActivityFailure`]. Whether that outcome took one attempt or
//! several is invisible to the coordinator's sequencing.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

/// Per-invocation information handed to activity handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    activity_name: String,
    step: usize,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, activity_name: impl Into<String>, step: usize) -> Self {
        Self {
            instance_id: instance_id.into(),
            activity_name: activity_name.into(),
            step,
            attempt: 1,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// 1-based attempt number; greater than 1 only when a retry policy is active.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "durable_sequence::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            step = self.step,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry mapping activity names to handlers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    /// Create a new builder for registering activities.
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Builder for `ActivityRegistry`.
pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Initialize a new builder from an existing registry.
    pub fn from_registry(reg: &ActivityRegistry) -> Self {
        ActivityRegistryBuilder {
            map: reg.inner.as_ref().clone(),
        }
    }

    /// Register a function as an activity. A later registration under the
    /// same name replaces the earlier one.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register an existing handler object.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.map.insert(name.into(), handler);
        self
    }

    /// Finalize and produce an `ActivityRegistry`.
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}

/// Why an activity invocation did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The handler returned `Err`.
    Application,
    /// The handler did not finish within the configured deadline.
    Timeout,
    /// The handler panicked.
    Panicked,
    /// No handler is registered under the requested name.
    Unregistered,
}

impl FailureKind {
    /// Unregistered activities will not start existing on a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Unregistered)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Application => "failed",
            FailureKind::Timeout => "timed out",
            FailureKind::Panicked => "panicked",
            FailureKind::Unregistered => "is not registered",
        })
    }
}

/// Failure of one activity invocation. Fatal to the owning instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activity {activity} {kind}: {message}")]
pub struct ActivityFailure {
    pub activity: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ActivityFailure {
    pub fn new(activity: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    None,
    Fixed { delay: Duration },
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exp);
                if secs.is_nan() || secs <= 0.0 {
                    Duration::ZERO
                } else if secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Retry policy applied inside the executor, invisible to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// A single attempt: failures go straight to the coordinator.
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Up to `max_attempts` attempts in total; zero is treated as one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Runs registered activities by name.
#[derive(Clone)]
pub struct ActivityExecutor {
    registry: ActivityRegistry,
    timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl ActivityExecutor {
    pub fn new(registry: ActivityRegistry) -> Self {
        Self {
            registry,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Deadline applied to each attempt. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run activity `name` with `input`, retrying per the configured policy.
    pub async fn execute(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityFailure> {
        let name = ctx.activity_name().to_string();
        let Some(handler) = self.registry.get(&name) else {
            return Err(ActivityFailure::new(
                name,
                FailureKind::Unregistered,
                "no handler registered under this name",
            ));
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            let mut attempt_ctx = ctx.clone();
            attempt_ctx.attempt = attempt;
            match self.execute_once(handler.as_ref(), attempt_ctx, input.clone()).await {
                Ok(result) => {
                    debug!(
                        instance_id = %ctx.instance_id(),
                        activity_name = %name,
                        step = ctx.step(),
                        attempt,
                        result_size = result.len(),
                        "activity completed"
                    );
                    return Ok(result);
                }
                Err(failure) if failure.kind.is_retryable() && attempt < max_attempts => {
                    let backoff = self.retry.backoff.delay_for_attempt(attempt);
                    warn!(
                        instance_id = %ctx.instance_id(),
                        activity_name = %name,
                        step = ctx.step(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %failure,
                        "activity attempt failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn execute_once(
        &self,
        handler: &dyn ActivityHandler,
        ctx: ActivityContext,
        input: String,
    ) -> Result<String, ActivityFailure> {
        let name = ctx.activity_name().to_string();
        let invocation = AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ActivityFailure::new(
                        name,
                        FailureKind::Timeout,
                        format!("no result within {}ms", limit.as_millis()),
                    ))
                }
            },
            None => invocation.await,
        };
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(ActivityFailure::new(name, FailureKind::Application, message)),
            Err(panic) => Err(ActivityFailure::new(name, FailureKind::Panicked, panic_message(&*panic))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx(name: &str) -> ActivityContext {
        ActivityContext::new("inst-test", name, 0)
    }

    #[tokio::test]
    async fn executes_registered_activity() {
        let reg = ActivityRegistry::builder()
            .register("Upper", |_ctx, input: String| async move { Ok(input.to_uppercase()) })
            .build();
        let exec = ActivityExecutor::new(reg);
        assert_eq!(exec.execute(ctx("Upper"), "abc".into()).await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn unregistered_activity_fails_without_retry() {
        let exec = ActivityExecutor::new(ActivityRegistry::default()).with_retry(RetryPolicy::new(5));
        let err = exec.execute(ctx("Missing"), String::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Unregistered);
        assert_eq!(err.activity, "Missing");
    }

    #[tokio::test]
    async fn application_error_is_propagated() {
        let reg = ActivityRegistry::builder()
            .register("Fail", |_ctx, _input: String| async move { Err("boom".to_string()) })
            .build();
        let err = ActivityExecutor::new(reg).execute(ctx("Fail"), String::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Application);
        assert_eq!(err.to_string(), "activity Fail failed: boom");
    }

    #[tokio::test]
    async fn panicking_activity_becomes_failure() {
        let reg = ActivityRegistry::builder()
            .register("Explode", |_ctx, _input: String| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(String::new())
            })
            .build();
        let err = ActivityExecutor::new(reg).execute(ctx("Explode"), String::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Panicked);
        assert!(err.message.contains("kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_activity_times_out() {
        let reg = ActivityRegistry::builder()
            .register("Slow", |_ctx, _input: String| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("late".to_string())
            })
            .build();
        let exec = ActivityExecutor::new(reg).with_timeout(Some(Duration::from_millis(50)));
        let err = exec.execute(ctx("Slow"), String::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_retries_transparently() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("Flaky", move |ctx: ActivityContext, _input: String| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Err(format!("attempt {} failed", ctx.attempt()))
                    } else {
                        Ok("third time lucky".to_string())
                    }
                }
            })
            .build();
        let exec = ActivityExecutor::new(reg).with_retry(RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(10),
        }));
        assert_eq!(exec.execute(ctx("Flaky"), String::new()).await.unwrap(), "third time lucky");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("AlwaysFail", move |_ctx, _input: String| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<String, String>("nope".to_string())
                }
            })
            .build();
        let exec = ActivityExecutor::new(reg).with_retry(RetryPolicy::new(2).with_backoff(BackoffStrategy::None));
        let err = exec.execute(ctx("AlwaysFail"), String::new()).await.unwrap_err();
        assert_eq!(err.message, "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn negative_multiplier_never_yields_a_negative_delay() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(10),
            multiplier: -2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(40));
        let nan = BackoffStrategy::Exponential {
            base: Duration::from_millis(10),
            multiplier: f64::NAN,
            max: Duration::from_secs(1),
        };
        assert_eq!(nan.delay_for_attempt(2), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_negative_multiplier_still_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("Flaky", move |_ctx, _input: String| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("ok".to_string())
                    }
                }
            })
            .build();
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(5),
            multiplier: -2.0,
            max: Duration::from_secs(1),
        };
        let exec = ActivityExecutor::new(reg).with_retry(RetryPolicy::new(3).with_backoff(backoff));
        assert_eq!(exec.execute(ctx("Flaky"), String::new()).await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::new(4).max_attempts, 4);
    }

    #[test]
    fn builder_from_registry_keeps_existing_handlers() {
        let base = ActivityRegistry::builder()
            .register("A", |_ctx, i: String| async move { Ok(i) })
            .build();
        let extended = ActivityRegistryBuilder::from_registry(&base)
            .register("B", |_ctx, i: String| async move { Ok(i) })
            .build();
        assert_eq!(extended.names(), vec!["A", "B"]);
        assert!(!base.has("B"));
    }
}
