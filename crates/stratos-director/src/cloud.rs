//! Infrastructure (cloud driver) interface.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::env::VmEnv;
use crate::network::NetworkSettings;
use crate::types::{AgentId, VmCid, VmMetadata};

/// Error reported by the cloud driver.
///
/// Only the VM creation retry loop looks at [`CloudError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CloudError {
    /// Driver message.
    pub message: String,
    /// Whether the same call may succeed if repeated.
    pub retryable: bool,
}

impl CloudError {
    /// A failure worth retrying.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the driver flagged this error as retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Arguments for a single `create_vm` call.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateVmRequest {
    /// Agent id the new VM boots with.
    pub agent_id: AgentId,
    /// Base image.
    pub stemcell_cid: String,
    /// VM type cloud properties.
    pub cloud_properties: Map<String, Value>,
    /// Network settings.
    pub network_settings: NetworkSettings,
    /// Persistent disks to attach.
    pub disk_cids: Vec<String>,
    /// Env, owned by this request.
    pub env: VmEnv,
}

/// Cloud driver operations used during provisioning.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Create a VM and return its cid.
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmCid, CloudError>;

    /// Delete a VM.
    async fn delete_vm(&self, vm_cid: &VmCid) -> Result<(), CloudError>;

    /// Tag a VM.
    async fn set_vm_metadata(&self, vm_cid: &VmCid, metadata: &VmMetadata)
        -> Result<(), CloudError>;
}
