//! Store wrappers that inject faults for testing error handling.

use async_trait::async_trait;
use durable_sequence::providers::in_memory::InMemoryInstanceStore;
use durable_sequence::providers::{InstanceStore, ProviderError};
use durable_sequence::OrchestrationInstance;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Wraps an in-memory store and can make compare-and-swap lose races or
/// panic, or reads fail outright.
pub struct FaultInjectingStore {
    inner: Arc<InMemoryInstanceStore>,
    /// Number of upcoming swaps to reject as contention.
    contended_swaps: AtomicU32,
    /// Total swaps attempted.
    swap_attempts: AtomicU32,
    /// Every read returns a permanent error while set.
    fail_reads: AtomicBool,
    /// The next swap panics instead of committing.
    panic_next_swap: AtomicBool,
}

impl FaultInjectingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryInstanceStore::new()),
            contended_swaps: AtomicU32::new(0),
            swap_attempts: AtomicU32::new(0),
            fail_reads: AtomicBool::new(false),
            panic_next_swap: AtomicBool::new(false),
        }
    }

    /// The next `n` swaps report contention instead of committing.
    pub fn contend_next_swaps(&self, n: u32) {
        self.contended_swaps.store(n, Ordering::SeqCst);
    }

    pub fn swap_attempts(&self) -> u32 {
        self.swap_attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// The next swap panics, as a buggy backend would.
    pub fn panic_on_next_swap(&self) {
        self.panic_next_swap.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceStore for FaultInjectingStore {
    async fn insert_instance(&self, record: OrchestrationInstance) -> Result<bool, ProviderError> {
        self.inner.insert_instance(record).await
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<OrchestrationInstance>, ProviderError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ProviderError::permanent("read_instance", "injected read failure"));
        }
        self.inner.read_instance(instance).await
    }

    async fn compare_and_swap(&self, expected_revision: u64, record: OrchestrationInstance) -> Result<(), ProviderError> {
        self.swap_attempts.fetch_add(1, Ordering::SeqCst);
        if self.panic_next_swap.swap(false, Ordering::SeqCst) {
            panic!("injected swap panic");
        }
        let contended = self
            .contended_swaps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if contended {
            return Err(ProviderError::contention("compare_and_swap", "injected"));
        }
        self.inner.compare_and_swap(expected_revision, record).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}
