use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{InstanceStore, ProviderError};
use crate::OrchestrationInstance;

#[derive(Default)]
struct Inner {
    records: HashMap<String, OrchestrationInstance>,
    // insertion order, for list_instances
    order: Vec<String>,
}

/// Process-local instance store. Records live until the store is dropped.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    inner: RwLock<Inner>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held (test utility).
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert_instance(&self, record: OrchestrationInstance) -> Result<bool, ProviderError> {
        let mut g = self.inner.write().await;
        if g.records.contains_key(&record.id) {
            return Ok(false);
        }
        g.order.push(record.id.clone());
        g.records.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<OrchestrationInstance>, ProviderError> {
        Ok(self.inner.read().await.records.get(instance).cloned())
    }

    async fn compare_and_swap(&self, expected_revision: u64, record: OrchestrationInstance) -> Result<(), ProviderError> {
        let mut g = self.inner.write().await;
        let cur = g
            .records
            .get_mut(&record.id)
            .ok_or_else(|| ProviderError::not_found("compare_and_swap", &record.id))?;
        if cur.revision != expected_revision {
            return Err(ProviderError::contention(
                "compare_and_swap",
                format!(
                    "instance {} expected revision {}, found {}",
                    record.id, expected_revision, cur.revision
                ),
            ));
        }
        *cur = record;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.inner.read().await.order.clone())
    }
}
