use serde::{Deserialize, Serialize};

use crate::{OrchestrationInstance, OrchestrationStatus};

/// Read-only snapshot of an instance, as returned by status queries.
///
/// Output is exposed while the instance is still running: a query between
/// two steps sees the results committed so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusView {
    pub instance_id: String,
    pub runtime_status: OrchestrationStatus,
    /// True for Pending and Running.
    pub running: bool,
    pub output: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl InstanceStatusView {
    pub fn is_terminal(&self) -> bool {
        self.runtime_status.is_terminal()
    }
}

impl From<&OrchestrationInstance> for InstanceStatusView {
    fn from(record: &OrchestrationInstance) -> Self {
        Self {
            instance_id: record.id.clone(),
            runtime_status: record.status,
            running: record.status.is_running(),
            output: record.output.clone(),
            error: record.error.clone(),
            created_at: record.created_at_ms,
            completed_at: record.completed_at_ms,
        }
    }
}

impl From<OrchestrationInstance> for InstanceStatusView {
    fn from(record: OrchestrationInstance) -> Self {
        Self::from(&record)
    }
}
