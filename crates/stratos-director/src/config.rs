//! Configuration for stratos-director.

use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{DirectorError, DirectorResult};

const ENV_PREFIX: &str = "STRATOS_";

/// Top-level configuration for the director.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DirectorConfig {
    /// VM provisioning behaviour.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Rendered template delivery.
    #[serde(default)]
    pub templates: TemplatesConfig,

    /// Shared blobstore configuration.
    #[serde(default)]
    pub blobstore: BlobstoreConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Local DNS registration.
    #[serde(default)]
    pub dns: DnsConfig,
}

impl DirectorConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `director.toml` in the current directory (if present)
    /// 3. Environment variables with `STRATOS_` prefix (`__` separates sections)
    pub fn load() -> DirectorResult<Self> {
        Self::from_file("director.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> DirectorResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| DirectorError::Config(e.to_string()))
    }
}

/// VM provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Name recorded in every VM's `director` metadata tag.
    #[serde(default = "default_director_name")]
    pub director_name: String,

    /// Upper bound on `create_vm` calls per provisioning attempt. Zero is treated as one.
    #[serde(default = "default_max_vm_create_tries")]
    pub max_vm_create_tries: u32,

    /// Broadcast ARP invalidation for the new VM's addresses.
    #[serde(default)]
    pub flush_arp: bool,

    /// Leave VMs in place when binding fails, for debugging.
    #[serde(default)]
    pub keep_unreachable_vms: bool,

    /// Generate a random agent password when the env does not carry one.
    #[serde(default)]
    pub generate_vm_passwords: bool,

    /// Generate per-VM agent credentials.
    #[serde(default)]
    pub encryption: bool,

    /// Env defaults deep-merged under every instance's env.
    #[serde(default)]
    pub agent_env: Map<String, Value>,
}

fn default_director_name() -> String {
    "director".to_owned()
}

const fn default_max_vm_create_tries() -> u32 {
    5
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            director_name: default_director_name(),
            max_vm_create_tries: default_max_vm_create_tries(),
            flush_arp: false,
            keep_unreachable_vms: false,
            generate_vm_passwords: false,
            encryption: false,
            agent_env: Map::new(),
        }
    }
}

/// Rendered template delivery configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TemplatesConfig {
    /// How compressed templates reach the VM.
    #[serde(default)]
    pub delivery: DeliveryTransport,
}

/// Transport used to deliver compressed templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTransport {
    /// Upload to the shared blobstore; the agent fetches by id.
    #[default]
    SharedStore,

    /// Push the archive straight to the agent.
    DirectAgent,
}

/// Shared blobstore configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobstoreConfig {
    /// Storage type: "local", "memory", or "s3".
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    /// Base directory (local) or bucket name (s3).
    #[serde(default = "default_blobstore_path")]
    pub path: String,

    /// Key prefix for every blob.
    pub prefix: Option<String>,

    /// S3 region (for S3 only).
    pub region: Option<String>,

    /// S3 endpoint (for S3-compatible stores).
    pub endpoint: Option<String>,
}

fn default_storage_type() -> String {
    "local".to_owned()
}

fn default_blobstore_path() -> String {
    "/var/lib/stratos/blobstore".to_owned()
}

impl Default for BlobstoreConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            path: default_blobstore_path(),
            prefix: None,
            region: None,
            endpoint: None,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/stratos".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Local DNS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Register local DNS records after provisioning.
    #[serde(default = "default_dns_enabled")]
    pub enabled: bool,

    /// Top-level domain appended to every record name.
    #[serde(default = "default_tld")]
    pub tld: String,
}

const fn default_dns_enabled() -> bool {
    true
}

fn default_tld() -> String {
    "stratos".to_owned()
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_dns_enabled(),
            tld: default_tld(),
        }
    }
}
