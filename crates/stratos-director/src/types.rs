//! Core types for stratos-director.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bytes of randomness behind each credential key.
const CREDENTIAL_KEY_BYTES: usize = 48;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Durable identifier of an instance record.
    InstanceId
);

string_id!(
    /// Opaque VM identifier assigned by the cloud driver.
    VmCid
);

string_id!(
    /// Identifier the agent inside a VM answers to.
    AgentId
);

impl AgentId {
    /// Generate a fresh agent ID (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Who an instance is: the fields every provisioning step needs to name it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// Durable instance id.
    pub id: InstanceId,
    /// Instance UUID, stable across VM recreation.
    pub uuid: String,
    /// Job (instance group) name.
    pub job: String,
    /// Index within the job.
    pub index: u32,
    /// Deployment name.
    pub deployment: String,
}

impl InstanceIdentity {
    /// Create an identity.
    #[must_use]
    pub fn new(
        id: InstanceId,
        uuid: impl Into<String>,
        job: impl Into<String>,
        index: u32,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            job: job.into(),
            index,
            deployment: deployment.into(),
        }
    }

    /// Human-readable instance name, `job/uuid`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.uuid)
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.job, self.uuid, self.index)
    }
}

/// Per-VM agent credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Encryption key, standard base64.
    pub crypt_key: String,
    /// Signing key, standard base64.
    pub sign_key: String,
}

impl Credentials {
    /// Generate a fresh pair of random keys.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            crypt_key: random_key(),
            sign_key: random_key(),
        }
    }
}

fn random_key() -> String {
    let mut bytes = [0u8; CREDENTIAL_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Everything recorded on an instance when a VM is bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBinding {
    /// The VM.
    pub vm_cid: VmCid,
    /// Agent inside the VM.
    pub agent_id: AgentId,
    /// Credentials the agent was configured with, when encryption is on.
    pub credentials: Option<Credentials>,
}

/// Durable instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Durable instance id.
    pub id: InstanceId,
    /// Instance UUID.
    pub uuid: String,
    /// Job name.
    pub job: String,
    /// Index within the job.
    pub index: u32,
    /// Deployment name.
    pub deployment: String,
    /// Currently bound VM.
    pub vm_cid: Option<VmCid>,
    /// Agent of the bound VM.
    pub agent_id: Option<AgentId>,
    /// Credentials of the bound VM.
    pub credentials: Option<Credentials>,
    /// Serialised instance spec last applied to the agent.
    pub spec_json: Option<String>,
    /// Cloud properties the VM was created with.
    pub cloud_properties: Option<Value>,
    /// SHA-1 of the trusted certificates last pushed to the agent.
    pub trusted_certs_sha1: Option<String>,
}

impl InstanceRecord {
    /// Create an unbound record for the given identity.
    #[must_use]
    pub fn new(identity: &InstanceIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            uuid: identity.uuid.clone(),
            job: identity.job.clone(),
            index: identity.index,
            deployment: identity.deployment.clone(),
            vm_cid: None,
            agent_id: None,
            credentials: None,
            spec_json: None,
            cloud_properties: None,
            trusted_certs_sha1: None,
        }
    }

    /// Identity fields of this record.
    #[must_use]
    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity {
            id: self.id.clone(),
            uuid: self.uuid.clone(),
            job: self.job.clone(),
            index: self.index,
            deployment: self.deployment.clone(),
        }
    }

    /// Record a VM binding.
    pub fn bind(&mut self, binding: &VmBinding) {
        self.vm_cid = Some(binding.vm_cid.clone());
        self.agent_id = Some(binding.agent_id.clone());
        self.credentials.clone_from(&binding.credentials);
    }

    /// Clear the VM binding.
    pub fn unbind(&mut self) {
        self.vm_cid = None;
        self.agent_id = None;
        self.credentials = None;
    }
}

/// Durable row pointing at a delivered template archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplatesArchiveRecord {
    /// Row id.
    pub id: i64,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Where the archive lives.
    pub blobstore_id: String,
    /// SHA-1 of the compressed archive.
    pub sha1: String,
    /// Configuration hash of the rendered templates.
    pub content_sha1: String,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl RenderedTemplatesArchiveRecord {
    /// Archive reference handed back to callers.
    #[must_use]
    pub fn archive(&self) -> stratos_templates::RenderedTemplatesArchive {
        stratos_templates::RenderedTemplatesArchive::new(&self.blobstore_id, &self.sha1)
    }
}

/// Values for inserting an archive row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRenderedTemplatesArchive {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Where the archive lives.
    pub blobstore_id: String,
    /// SHA-1 of the compressed archive.
    pub sha1: String,
    /// Configuration hash of the rendered templates.
    pub content_sha1: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Local DNS record for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDnsRecord {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Fully-qualified record name.
    pub name: String,
    /// Address the name resolves to.
    pub ip: String,
}

/// Metadata tags applied to a VM through the cloud driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmMetadata(BTreeMap<String, String>);

impl VmMetadata {
    /// Standard tags for an instance's VM.
    #[must_use]
    pub fn for_instance(
        identity: &InstanceIdentity,
        director_name: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("deployment".to_owned(), identity.deployment.clone());
        tags.insert(
            "created_at".to_owned(),
            created_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        tags.insert("job".to_owned(), identity.job.clone());
        tags.insert("index".to_owned(), identity.index.to_string());
        tags.insert("director".to_owned(), director_name.to_owned());
        tags.insert("id".to_owned(), identity.uuid.clone());
        tags.insert("name".to_owned(), identity.name());
        Self(tags)
    }

    /// Look up a tag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// All tags.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}
