//! Runtime limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find, document,
//! and reference from both runtime code and store implementations.

/// Maximum number of steps accepted in one activity plan.
///
/// Output length is bounded by plan length, so this also bounds the size of
/// a record's output and history.
pub const MAX_PLAN_STEPS: usize = 1024;

/// Lost update races after which `InstanceStore::update` starts logging at
/// warn level. It keeps retrying regardless.
pub const UPDATE_CONTENTION_WARN_AFTER: u32 = 8;

/// First backoff between update attempts; doubles on every retry.
pub const UPDATE_BACKOFF_BASE_MS: u64 = 1;

/// Ceiling for the update backoff.
pub const UPDATE_BACKOFF_MAX_MS: u64 = 50;

/// Delay before a coordinator stopped by a retryable store error is run again.
pub const COORDINATOR_RESTART_DELAY_MS: u64 = 20;

/// Attempts `InstanceStore::create_instance` makes to find an unused id.
pub const MAX_CREATE_ATTEMPTS: u32 = 3;
