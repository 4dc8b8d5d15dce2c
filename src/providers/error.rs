/// Store error with retry classification.
///
/// The store's own update loop uses `is_retryable()` to decide whether a
/// failed compare-and-swap should be attempted again.
///
/// **Retryable**: revision conflicts (another writer committed first), busy
/// backends, transient I/O.
///
/// **Permanent**: missing instances, duplicate ids, rejected state
/// transitions, corrupt records.
///
/// ```rust
/// use durable_sequence::providers::ProviderError;
///
/// let conflict = ProviderError::contention("update", "revision 3 != 4");
/// assert!(conflict.is_retryable());
///
/// let missing = ProviderError::permanent("update", "instance not found: x");
/// assert!(!missing.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g., "create_instance", "compare_and_swap")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// Whether this error should be retried
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Two writers raced on the same instance and this one lost.
    pub fn contention(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::retryable(operation, format!("contention: {}", message.into()))
    }

    pub fn not_found(operation: impl Into<String>, instance: &str) -> Self {
        Self::permanent(operation, format!("instance not found: {instance}"))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<crate::TransitionError> for ProviderError {
    fn from(e: crate::TransitionError) -> Self {
        ProviderError::permanent("update", e.to_string())
    }
}
