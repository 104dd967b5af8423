//! Interfaces to the management agent running inside each VM.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DirectorResult;
use crate::types::{AgentId, Credentials, VmCid};

/// State reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Network settings as the agent sees them, including dynamic addresses.
    #[serde(default)]
    pub networks: Option<Value>,
    /// Aggregate job state (`running`, `failing`, ...).
    #[serde(default)]
    pub job_state: Option<String>,
}

/// Client for one VM's agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Block until the agent responds.
    async fn wait_until_ready(&self) -> DirectorResult<()>;

    /// Push trusted CA certificates.
    async fn update_settings(&self, trusted_certs: &str) -> DirectorResult<()>;

    /// Apply an instance spec.
    async fn apply(&self, spec: &Value) -> DirectorResult<()>;

    /// Fetch current agent state.
    async fn get_state(&self) -> DirectorResult<AgentState>;

    /// Store a blob on the VM. `payload` is base64.
    async fn upload_blob(&self, blob_id: &str, sha1: &str, payload: &str) -> DirectorResult<()>;
}

/// Builds agent clients for freshly created VMs.
pub trait AgentClientFactory: Send + Sync {
    /// Client for the agent with the given id.
    fn for_vm(&self, agent_id: &AgentId, credentials: Option<&Credentials>) -> Arc<dyn AgentClient>;
}

/// Messages sent to every agent in the fleet.
#[async_trait]
pub trait AgentBroadcaster: Send + Sync {
    /// Ask every agent except `exclude_vm_cid` to drop ARP entries for `ips`.
    async fn delete_arp_entries(&self, exclude_vm_cid: &VmCid, ips: &[IpAddr])
        -> DirectorResult<()>;
}
