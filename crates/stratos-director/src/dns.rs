//! Best-effort local DNS registration.
//!
//! After a VM is provisioned the instance's stored spec is inspected for a job
//! name and the first network's address. When both are present a record named
//! `<uuid>.<job>.<network>.<deployment>.<tld>` is created. Anything less is
//! logged and skipped; registration never fails provisioning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::error::DirectorError;
use crate::store::InstanceStore;
use crate::types::{InstanceIdentity, LocalDnsRecord};

/// The parts of a stored instance spec that DNS cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InstanceSpec {
    /// Deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    /// Job section.
    #[serde(default)]
    pub job: Option<JobSpec>,
    /// Network settings.
    #[serde(default)]
    pub networks: Option<SpecNetworks>,
}

/// Job section of an instance spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobSpec {
    /// Job name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Networks, either keyed by name or as ordered `[name, settings]` pairs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SpecNetworks {
    /// Ordered pairs.
    Pairs(Vec<(String, NetworkEntry)>),
    /// Name-keyed object (visited in name order).
    Named(BTreeMap<String, NetworkEntry>),
}

impl SpecNetworks {
    fn first(&self) -> Option<(&str, &NetworkEntry)> {
        match self {
            Self::Pairs(pairs) => pairs.first().map(|(name, entry)| (name.as_str(), entry)),
            Self::Named(map) => map.iter().next().map(|(name, entry)| (name.as_str(), entry)),
        }
    }
}

/// One network entry in an instance spec.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetworkEntry {
    /// Address, as a string or a number.
    #[serde(default)]
    pub ip: Option<Value>,
}

/// Why an instance cannot get a DNS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// The instance has no stored spec.
    MissingSpec,
    /// The spec is not valid JSON or has the wrong shape.
    Malformed(String),
    /// The spec has no networks.
    MissingNetworks,
    /// The first network has no address.
    MissingIp,
    /// The spec has no job name.
    MissingJob,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSpec => write!(f, "instance has no spec"),
            Self::Malformed(e) => write!(f, "spec is malformed: {e}"),
            Self::MissingNetworks => write!(f, "spec has no networks"),
            Self::MissingIp => write!(f, "first network has no ip"),
            Self::MissingJob => write!(f, "spec has no job name"),
        }
    }
}

impl From<IneligibleReason> for DirectorError {
    fn from(reason: IneligibleReason) -> Self {
        Self::MalformedSpec(reason.to_string())
    }
}

/// What a DNS record would point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTarget {
    /// Job name from the spec.
    pub job: String,
    /// Name of the first network.
    pub network: String,
    /// Address on that network.
    pub ip: String,
    /// Deployment named in the spec, if any.
    pub deployment: Option<String>,
}

impl DnsTarget {
    /// Fully-qualified record name.
    #[must_use]
    pub fn record_name(&self, identity: &InstanceIdentity, tld: &str) -> String {
        let deployment = self.deployment.as_deref().unwrap_or(&identity.deployment);
        format!(
            "{}.{}.{}.{}.{}",
            identity.uuid, self.job, self.network, deployment, tld
        )
    }
}

/// Decide whether a stored spec can produce a DNS record.
pub fn evaluate(spec_json: Option<&str>) -> Result<DnsTarget, IneligibleReason> {
    let spec_json = spec_json.ok_or(IneligibleReason::MissingSpec)?;
    let spec: InstanceSpec = serde_json::from_str(spec_json)
        .map_err(|e| IneligibleReason::Malformed(e.to_string()))?;

    let (network, entry) = spec
        .networks
        .as_ref()
        .and_then(SpecNetworks::first)
        .ok_or(IneligibleReason::MissingNetworks)?;

    let ip = match &entry.ip {
        Some(Value::String(ip)) => ip.clone(),
        Some(Value::Number(ip)) => ip.to_string(),
        Some(Value::Null) | None => return Err(IneligibleReason::MissingIp),
        Some(other) => {
            return Err(IneligibleReason::Malformed(format!(
                "unexpected ip value {other}"
            )))
        }
    };

    let job = spec
        .job
        .and_then(|job| job.name)
        .ok_or(IneligibleReason::MissingJob)?;

    Ok(DnsTarget {
        job,
        network: network.to_owned(),
        ip,
        deployment: spec.deployment,
    })
}

/// Creates local DNS records for provisioned instances.
pub struct LocalDnsRegistrar {
    store: Arc<dyn InstanceStore>,
    config: DnsConfig,
}

impl LocalDnsRegistrar {
    /// Create a registrar.
    #[must_use]
    pub fn new(store: Arc<dyn InstanceStore>, config: DnsConfig) -> Self {
        Self { store, config }
    }

    /// Register a record for the instance if its stored spec allows one.
    ///
    /// Returns the record when one exists afterwards. Never fails.
    pub async fn register(&self, identity: &InstanceIdentity) -> Option<LocalDnsRecord> {
        if !self.config.enabled {
            return None;
        }

        let spec_json = match self.store.get_instance(&identity.id).await {
            Ok(Some(record)) => record.spec_json,
            Ok(None) => None,
            Err(e) => {
                warn!(instance = %identity.name(), error = %e, "failed to load instance for local DNS");
                return None;
            }
        };

        let target = match evaluate(spec_json.as_deref()) {
            Ok(target) => target,
            Err(reason) => {
                debug!(instance = %identity.name(), %reason, "skipping local DNS record");
                return None;
            }
        };

        let record = LocalDnsRecord {
            instance_id: identity.id.clone(),
            name: target.record_name(identity, &self.config.tld),
            ip: target.ip,
        };

        match self.store.create_local_dns_record(&record).await {
            Ok(created) => {
                if created {
                    info!(instance = %identity.name(), name = %record.name, ip = %record.ip, "registered local DNS record");
                }
                Some(record)
            }
            Err(e) => {
                warn!(instance = %identity.name(), error = %e, "failed to register local DNS record");
                None
            }
        }
    }
}

impl fmt::Debug for LocalDnsRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDnsRegistrar")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
