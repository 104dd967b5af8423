//! Stratos Director Provisioning Core
//!
//! This crate turns a resolved [`InstancePlan`] into a running, bound VM.
//!
//! # Architecture
//!
//! Provisioning one instance involves:
//!
//! - **VM creation**: calling the cloud driver with a bounded retry loop for
//!   retryable failures
//! - **Binding**: recording the VM on the instance, waiting for its agent,
//!   pushing trusted certificates, tagging metadata and applying the initial
//!   spec
//! - **Template delivery**: compressing rendered templates and shipping them
//!   through the shared blobstore or straight to the agent, reusing earlier
//!   archives when the configuration hash is unchanged
//! - **Local DNS**: registering a best-effort record derived from the
//!   instance spec
//!
//! A binding failure deletes the VM again unless `keep_unreachable_vms` is
//! set.
//!
//! # State Machine
//!
//! Each attempt follows a typestate machine:
//!
//! ```text
//! Pending ──▶ Creating ──▶ Created ──▶ Binding ──▶ Ready
//!                │                        │
//!                ▼                        ▼
//!              Failed ◀──── RollingBack ◀─┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stratos_director::{Collaborators, DirectorConfig, InstancePlan, TaskContext, VmCreator};
//!
//! let creator = VmCreator::new(collaborators, &DirectorConfig::default(), TaskContext::new("admin", "42"));
//! let bound = creator.create_for_instance_plan(&plan, &[]).await?;
//! println!("{} is on {}", plan.instance, bound.vm_cid);
//! ```

#![forbid(unsafe_code)]

pub mod agent;
pub mod blobstore;
pub mod cloud;
pub mod config;
pub mod dns;
pub mod env;
pub mod error;
pub mod events;
pub mod locks;
pub mod network;
pub mod persister;
pub mod plan;
pub mod state;
pub mod store;
pub mod types;
pub mod vm_creator;

// Re-export commonly used types at the crate root
pub use agent::{AgentBroadcaster, AgentClient, AgentClientFactory, AgentState};
pub use blobstore::{create_object_store, Blobstore, ObjectStoreBlobstore};
pub use cloud::{Cloud, CloudError, CreateVmRequest};
pub use config::{DeliveryTransport, DirectorConfig, ProvisioningConfig, TemplatesConfig};
pub use dns::LocalDnsRegistrar;
pub use error::{DirectorError, DirectorResult};
pub use events::{EventRecorder, MemoryEventLog, NewEvent, TaskContext};
pub use locks::{InstanceGuard, InstanceLocks};
pub use network::{NetworkReservation, NetworkSettings};
pub use persister::TemplatesPersister;
pub use plan::InstancePlan;
pub use state::{
    AttemptPhase, AttemptState, Binding, Created, Creating, Failed, Pending, ProvisioningAttempt,
    Ready, RollingBack,
};
pub use store::{InstanceStore, MemoryStore, PostgresStore};
pub use types::{
    AgentId, Credentials, InstanceId, InstanceIdentity, InstanceRecord, LocalDnsRecord, VmCid,
    VmMetadata,
};
pub use vm_creator::{BoundInstance, Collaborators, VmCreator};
