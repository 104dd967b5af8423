//! In-memory instance store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DirectorError, DirectorResult};
use crate::types::{
    InstanceId, InstanceRecord, LocalDnsRecord, NewRenderedTemplatesArchive,
    RenderedTemplatesArchiveRecord, VmBinding,
};

use super::InstanceStore;

/// In-memory instance store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, InstanceRecord>>,
    archives: RwLock<Vec<RenderedTemplatesArchiveRecord>>,
    dns_records: RwLock<Vec<LocalDnsRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update_instance(
        &self,
        id: &InstanceId,
        update: impl FnOnce(&mut InstanceRecord),
    ) -> DirectorResult<()> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let record = instances
            .get_mut(id.as_str())
            .ok_or_else(|| DirectorError::store(format!("instance {id} not found")))?;

        update(record);
        Ok(())
    }
}

fn latest_for<'a>(
    archives: &'a [RenderedTemplatesArchiveRecord],
    instance_id: &InstanceId,
) -> Option<&'a RenderedTemplatesArchiveRecord> {
    archives
        .iter()
        .filter(|a| &a.instance_id == instance_id)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, record: &InstanceRecord) -> DirectorResult<()> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let key = record.id.as_str().to_owned();
        if instances.contains_key(&key) {
            return Err(DirectorError::store(format!("instance {key} already exists")));
        }

        instances.insert(key, record.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> DirectorResult<Option<InstanceRecord>> {
        let instances = self
            .instances
            .read()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        Ok(instances.get(id.as_str()).cloned())
    }

    async fn bind_vm(&self, id: &InstanceId, binding: &VmBinding) -> DirectorResult<()> {
        self.update_instance(id, |record| record.bind(binding))
    }

    async fn unbind_vm(&self, id: &InstanceId) -> DirectorResult<()> {
        self.update_instance(id, InstanceRecord::unbind)
    }

    async fn update_cloud_properties(
        &self,
        id: &InstanceId,
        cloud_properties: &Value,
    ) -> DirectorResult<()> {
        self.update_instance(id, |record| {
            record.cloud_properties = Some(cloud_properties.clone());
        })
    }

    async fn update_trusted_certs_sha1(&self, id: &InstanceId, sha1: &str) -> DirectorResult<()> {
        self.update_instance(id, |record| {
            record.trusted_certs_sha1 = Some(sha1.to_owned());
        })
    }

    async fn update_spec(&self, id: &InstanceId, spec_json: &str) -> DirectorResult<()> {
        self.update_instance(id, |record| record.spec_json = Some(spec_json.to_owned()))
    }

    async fn latest_rendered_templates_archive(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Option<RenderedTemplatesArchiveRecord>> {
        let archives = self
            .archives
            .read()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        Ok(latest_for(&archives, instance_id).cloned())
    }

    async fn add_rendered_templates_archive(
        &self,
        archive: &NewRenderedTemplatesArchive,
    ) -> DirectorResult<RenderedTemplatesArchiveRecord> {
        let mut archives = self
            .archives
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let converged = latest_for(&archives, &archive.instance_id)
            .filter(|latest| latest.content_sha1 == archive.content_sha1)
            .map(|latest| latest.id);

        if let Some(id) = converged {
            let existing = archives
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| DirectorError::internal("archive row vanished"))?;
            existing.blobstore_id.clone_from(&archive.blobstore_id);
            existing.sha1.clone_from(&archive.sha1);
            return Ok(existing.clone());
        }

        let id = archives.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let record = RenderedTemplatesArchiveRecord {
            id,
            instance_id: archive.instance_id.clone(),
            blobstore_id: archive.blobstore_id.clone(),
            sha1: archive.sha1.clone(),
            content_sha1: archive.content_sha1.clone(),
            created_at: archive.created_at,
        };
        archives.push(record.clone());
        Ok(record)
    }

    async fn update_rendered_templates_archive(
        &self,
        id: i64,
        blobstore_id: &str,
        sha1: &str,
    ) -> DirectorResult<()> {
        let mut archives = self
            .archives
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let record = archives
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DirectorError::store(format!("archive {id} not found")))?;

        blobstore_id.clone_into(&mut record.blobstore_id);
        sha1.clone_into(&mut record.sha1);
        Ok(())
    }

    async fn list_rendered_templates_archives(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<RenderedTemplatesArchiveRecord>> {
        let archives = self
            .archives
            .read()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let mut results: Vec<_> = archives
            .iter()
            .filter(|a| &a.instance_id == instance_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(results)
    }

    async fn create_local_dns_record(&self, record: &LocalDnsRecord) -> DirectorResult<bool> {
        let mut records = self
            .dns_records
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        if records
            .iter()
            .any(|r| r.instance_id == record.instance_id && r.name == record.name)
        {
            return Ok(false);
        }

        records.push(record.clone());
        Ok(true)
    }

    async fn local_dns_records(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<LocalDnsRecord>> {
        let records = self
            .dns_records
            .read()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        Ok(records
            .iter()
            .filter(|r| &r.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{AgentId, InstanceIdentity, VmCid};
    use chrono::{Duration, Utc};

    fn identity() -> InstanceIdentity {
        InstanceIdentity::new(InstanceId::new("1"), "uuid-1", "web", 0, "prod")
    }

    fn new_archive(content_sha1: &str, blobstore_id: &str) -> NewRenderedTemplatesArchive {
        NewRenderedTemplatesArchive {
            instance_id: identity().id,
            blobstore_id: blobstore_id.to_owned(),
            sha1: format!("sha-{blobstore_id}"),
            content_sha1: content_sha1.to_owned(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_instance() {
        let store = MemoryStore::new();
        let record = InstanceRecord::new(&identity());

        store.insert_instance(&record).await.unwrap();

        let retrieved = store.get_instance(&record.id).await.unwrap().unwrap();
        assert_eq!(retrieved, record);
        assert!(store.insert_instance(&record).await.is_err());
    }

    #[tokio::test]
    async fn bind_and_unbind_vm() {
        let store = MemoryStore::new();
        let record = InstanceRecord::new(&identity());
        store.insert_instance(&record).await.unwrap();

        let binding = VmBinding {
            vm_cid: VmCid::new("vm-1"),
            agent_id: AgentId::new("agent-1"),
            credentials: None,
        };
        store.bind_vm(&record.id, &binding).await.unwrap();
        let bound = store.get_instance(&record.id).await.unwrap().unwrap();
        assert_eq!(bound.vm_cid, Some(VmCid::new("vm-1")));

        store.unbind_vm(&record.id).await.unwrap();
        let unbound = store.get_instance(&record.id).await.unwrap().unwrap();
        assert!(unbound.vm_cid.is_none());
        assert!(unbound.agent_id.is_none());
    }

    #[tokio::test]
    async fn updating_unknown_instance_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_spec(&InstanceId::new("missing"), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, DirectorError::Store(_)));
    }

    #[tokio::test]
    async fn same_content_converges_on_latest_row() {
        let store = MemoryStore::new();

        let first = store
            .add_rendered_templates_archive(&new_archive("hash-a", "blob-1"))
            .await
            .unwrap();
        let second = store
            .add_rendered_templates_archive(&new_archive("hash-a", "blob-2"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.blobstore_id, "blob-2");
        let rows = store
            .list_rendered_templates_archives(&identity().id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_content_leaves_one_row() {
        let store = std::sync::Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .add_rendered_templates_archive(&new_archive("hash-a", &format!("blob-{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = store
            .list_rendered_templates_archives(&identity().id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn new_content_adds_a_newer_row() {
        let store = MemoryStore::new();

        let mut older = new_archive("hash-a", "blob-1");
        older.created_at = Utc::now() - Duration::minutes(5);
        store.add_rendered_templates_archive(&older).await.unwrap();
        store
            .add_rendered_templates_archive(&new_archive("hash-b", "blob-2"))
            .await
            .unwrap();

        let latest = store
            .latest_rendered_templates_archive(&identity().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.content_sha1, "hash-b");

        let rows = store
            .list_rendered_templates_archives(&identity().id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content_sha1, "hash-b");
    }

    #[tokio::test]
    async fn update_archive_in_place() {
        let store = MemoryStore::new();
        let row = store
            .add_rendered_templates_archive(&new_archive("hash-a", "blob-1"))
            .await
            .unwrap();

        store
            .update_rendered_templates_archive(row.id, "blob-9", "sha-9")
            .await
            .unwrap();

        let latest = store
            .latest_rendered_templates_archive(&identity().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.blobstore_id, "blob-9");
        assert_eq!(latest.sha1, "sha-9");
        assert_eq!(latest.content_sha1, "hash-a");
    }

    #[tokio::test]
    async fn dns_records_are_idempotent() {
        let store = MemoryStore::new();
        let record = LocalDnsRecord {
            instance_id: identity().id,
            name: "uuid-1.web.private.prod.stratos".to_owned(),
            ip: "10.0.0.5".to_owned(),
        };

        assert!(store.create_local_dns_record(&record).await.unwrap());
        assert!(!store.create_local_dns_record(&record).await.unwrap());
        assert_eq!(store.local_dns_records(&identity().id).await.unwrap().len(), 1);
    }
}
