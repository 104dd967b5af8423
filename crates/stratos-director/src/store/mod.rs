//! Instance storage backends.
//!
//! This module provides the trait and implementations for persisting
//! instance records, rendered template archive rows, and local DNS records.
//! The primary implementation uses PostgreSQL, but an in-memory implementation
//! is provided for testing.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DirectorResult;
use crate::types::{
    InstanceId, InstanceRecord, LocalDnsRecord, NewRenderedTemplatesArchive,
    RenderedTemplatesArchiveRecord, VmBinding,
};

/// Backend for durable instance state.
///
/// Implementations must make [`InstanceStore::add_rendered_templates_archive`]
/// atomic per instance: concurrent callers with the same content hash must end
/// up with a single latest row.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance record.
    ///
    /// Returns an error if an instance with the same ID already exists.
    async fn insert_instance(&self, record: &InstanceRecord) -> DirectorResult<()>;

    /// Get an instance by ID.
    async fn get_instance(&self, id: &InstanceId) -> DirectorResult<Option<InstanceRecord>>;

    /// Record the VM bound to an instance.
    async fn bind_vm(&self, id: &InstanceId, binding: &VmBinding) -> DirectorResult<()>;

    /// Clear an instance's VM binding.
    async fn unbind_vm(&self, id: &InstanceId) -> DirectorResult<()>;

    /// Store the cloud properties the VM was created with.
    async fn update_cloud_properties(&self, id: &InstanceId, cloud_properties: &Value)
        -> DirectorResult<()>;

    /// Store the SHA-1 of the trusted certificates pushed to the agent.
    async fn update_trusted_certs_sha1(&self, id: &InstanceId, sha1: &str) -> DirectorResult<()>;

    /// Store the serialised spec applied to the agent.
    async fn update_spec(&self, id: &InstanceId, spec_json: &str) -> DirectorResult<()>;

    /// Newest archive row for an instance (by `created_at`, then `id`).
    async fn latest_rendered_templates_archive(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Option<RenderedTemplatesArchiveRecord>>;

    /// Insert an archive row.
    ///
    /// If the instance's latest row already has the same `content_sha1`, that
    /// row's `blobstore_id` and `sha1` are replaced instead and it is returned.
    async fn add_rendered_templates_archive(
        &self,
        archive: &NewRenderedTemplatesArchive,
    ) -> DirectorResult<RenderedTemplatesArchiveRecord>;

    /// Replace the location and checksum of an existing archive row.
    async fn update_rendered_templates_archive(
        &self,
        id: i64,
        blobstore_id: &str,
        sha1: &str,
    ) -> DirectorResult<()>;

    /// Every archive row for an instance, newest first.
    async fn list_rendered_templates_archives(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<RenderedTemplatesArchiveRecord>>;

    /// Insert a local DNS record. Returns `false` if an identical
    /// `(instance_id, name)` record already existed.
    async fn create_local_dns_record(&self, record: &LocalDnsRecord) -> DirectorResult<bool>;

    /// Local DNS records for an instance.
    async fn local_dns_records(&self, instance_id: &InstanceId)
        -> DirectorResult<Vec<LocalDnsRecord>>;
}
