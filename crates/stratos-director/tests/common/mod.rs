//! Fakes and fixtures shared by the provisioning integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::{json, Map, Value};
use stratos_director::agent::{AgentBroadcaster, AgentClient, AgentClientFactory, AgentState};
use stratos_director::blobstore::{Blobstore, ObjectStoreBlobstore};
use stratos_director::cloud::{Cloud, CloudError, CreateVmRequest};
use stratos_director::events::{EventId, EventRecorder, MemoryEventLog, NewEvent, TaskContext};
use stratos_director::network::NetworkReservation;
use stratos_director::store::{InstanceStore, MemoryStore};
use stratos_director::types::{
    AgentId, Credentials, InstanceId, InstanceIdentity, InstanceRecord, LocalDnsRecord,
    NewRenderedTemplatesArchive, RenderedTemplatesArchiveRecord, VmBinding, VmCid, VmMetadata,
};
use stratos_director::{
    Collaborators, DirectorConfig, DirectorError, DirectorResult, InstanceLocks, InstancePlan,
    VmCreator,
};
use stratos_templates::{RenderedJobInstance, RenderedJobTemplate, RenderedTemplateFile};

pub const TRUSTED_CERTS: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Cloud
// =============================================================================

/// Cloud driver that replays scripted `create_vm` results.
#[derive(Default)]
pub struct FakeCloud {
    script: Mutex<VecDeque<Result<VmCid, CloudError>>>,
    created: AtomicUsize,
    delete_error: Mutex<Option<CloudError>>,
    pub requests: Mutex<Vec<CreateVmRequest>>,
    pub deleted: Mutex<Vec<VmCid>>,
    pub metadata: Mutex<Vec<(VmCid, VmMetadata)>>,
}

impl FakeCloud {
    /// Queue results for the next `create_vm` calls. Once the script runs
    /// out, calls succeed with `vm-<n>`.
    pub fn script(&self, results: impl IntoIterator<Item = Result<VmCid, CloudError>>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn fail_deletes(&self, error: CloudError) {
        *self.delete_error.lock().unwrap() = Some(error);
    }

    pub fn create_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CreateVmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<VmCid> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn metadata(&self) -> Vec<(VmCid, VmMetadata)> {
        self.metadata.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmCid, CloudError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(VmCid::new(format!("vm-{n}")))
    }

    async fn delete_vm(&self, vm_cid: &VmCid) -> Result<(), CloudError> {
        self.deleted.lock().unwrap().push(vm_cid.clone());
        match self.delete_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn set_vm_metadata(&self, vm_cid: &VmCid, metadata: &VmMetadata) -> Result<(), CloudError> {
        self.metadata
            .lock()
            .unwrap()
            .push((vm_cid.clone(), metadata.clone()));
        Ok(())
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Agent with failure switches and call recording.
#[derive(Default)]
pub struct FakeAgent {
    pub fail_wait: AtomicBool,
    pub fail_update_settings: AtomicBool,
    pub fail_apply: AtomicBool,
    pub fail_upload: AtomicBool,
    pub reported_networks: Mutex<Option<Value>>,
    pub ready_delay: Mutex<Option<Duration>>,
    pub trusted_certs: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<Value>>,
    pub uploads: Mutex<Vec<(String, String, String)>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeAgent {
    pub fn applied(&self) -> Vec<Value> {
        self.applied.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn report_networks(&self, networks: Value) {
        *self.reported_networks.lock().unwrap() = Some(networks);
    }

    pub fn delay_ready(&self, delay: Duration) {
        *self.ready_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn wait_until_ready(&self) -> DirectorResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.ready_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_wait.load(Ordering::SeqCst) {
            return Err(DirectorError::agent("timed out waiting for agent"));
        }
        Ok(())
    }

    async fn update_settings(&self, trusted_certs: &str) -> DirectorResult<()> {
        if self.fail_update_settings.load(Ordering::SeqCst) {
            return Err(DirectorError::agent("update_settings rejected"));
        }
        self.trusted_certs
            .lock()
            .unwrap()
            .push(trusted_certs.to_owned());
        Ok(())
    }

    async fn apply(&self, spec: &Value) -> DirectorResult<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(DirectorError::agent("apply failed"));
        }
        self.applied.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn get_state(&self) -> DirectorResult<AgentState> {
        Ok(AgentState {
            networks: self.reported_networks.lock().unwrap().clone(),
            job_state: Some("running".to_owned()),
        })
    }

    async fn upload_blob(&self, blob_id: &str, sha1: &str, payload: &str) -> DirectorResult<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(DirectorError::agent("upload_blob failed"));
        }
        self.uploads.lock().unwrap().push((
            blob_id.to_owned(),
            sha1.to_owned(),
            payload.to_owned(),
        ));
        Ok(())
    }
}

/// Hands out the same [`FakeAgent`] for every VM and records the requests.
pub struct FakeAgentFactory {
    pub agent: Arc<FakeAgent>,
    pub clients: Mutex<Vec<(AgentId, Option<Credentials>)>>,
}

impl FakeAgentFactory {
    pub fn new(agent: Arc<FakeAgent>) -> Self {
        Self {
            agent,
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn clients(&self) -> Vec<(AgentId, Option<Credentials>)> {
        self.clients.lock().unwrap().clone()
    }
}

impl AgentClientFactory for FakeAgentFactory {
    fn for_vm(&self, agent_id: &AgentId, credentials: Option<&Credentials>) -> Arc<dyn AgentClient> {
        self.clients
            .lock()
            .unwrap()
            .push((agent_id.clone(), credentials.cloned()));
        self.agent.clone()
    }
}

#[derive(Default)]
pub struct FakeBroadcaster {
    pub calls: Mutex<Vec<(VmCid, Vec<IpAddr>)>>,
}

impl FakeBroadcaster {
    pub fn calls(&self) -> Vec<(VmCid, Vec<IpAddr>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBroadcaster for FakeBroadcaster {
    async fn delete_arp_entries(&self, exclude_vm_cid: &VmCid, ips: &[IpAddr]) -> DirectorResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((exclude_vm_cid.clone(), ips.to_vec()));
        Ok(())
    }
}

// =============================================================================
// Blobstore and events
// =============================================================================

/// In-memory blobstore that counts uploads and can lose or refuse blobs.
pub struct CountingBlobstore {
    memory: Arc<InMemory>,
    inner: ObjectStoreBlobstore,
    pub creates: AtomicUsize,
    pub lost: AtomicBool,
    pub fail_create: AtomicBool,
}

impl Default for CountingBlobstore {
    fn default() -> Self {
        let memory = Arc::new(InMemory::new());
        Self {
            inner: ObjectStoreBlobstore::with_store(memory.clone(), None),
            memory,
            creates: AtomicUsize::new(0),
            lost: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
        }
    }
}

impl CountingBlobstore {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Raw bytes of a stored blob.
    pub async fn read(&self, blob_id: &str) -> Bytes {
        self.memory
            .get(&ObjectPath::from(blob_id))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap()
    }
}

#[async_trait]
impl Blobstore for CountingBlobstore {
    async fn create(&self, data: Bytes) -> DirectorResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DirectorError::cache_transport("blobstore unavailable"));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(data).await
    }

    async fn exists(&self, blob_id: &str) -> DirectorResult<bool> {
        if self.lost.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.exists(blob_id).await
    }
}

/// Event recorder that accepts top-level events and rejects child events.
#[derive(Default)]
pub struct RejectingChildEvents {
    pub log: MemoryEventLog,
}

#[async_trait]
impl EventRecorder for RejectingChildEvents {
    async fn record(&self, event: NewEvent) -> DirectorResult<EventId> {
        if event.parent_id.is_some() {
            return Err(DirectorError::store("events table unavailable"));
        }
        self.log.record(event).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn identity() -> InstanceIdentity {
    identity_for("instance-1", "uuid-1", 0)
}

pub fn identity_for(id: &str, uuid: &str, index: u32) -> InstanceIdentity {
    InstanceIdentity::new(InstanceId::new(id), uuid, "web", index, "prod")
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn private_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
}

pub fn plan_for(identity: InstanceIdentity) -> InstancePlan {
    InstancePlan::new(identity, "stemcell-ubuntu")
        .with_cloud_properties(object(json!({"instance_type": "m1.small"})))
        .with_network(
            NetworkReservation::manual("private", private_ip(), "255.255.255.0")
                .with_default_for(["dns", "gateway"]),
        )
        .with_trusted_certs(TRUSTED_CERTS)
        .with_apply_spec(object(json!({
            "vm_type": {"name": "small"},
            "stemcell": {"name": "ubuntu", "version": "1.0"},
        })))
}

pub fn plan() -> InstancePlan {
    plan_for(identity())
}

pub fn rendered(contents: &str) -> RenderedJobInstance {
    RenderedJobInstance::new(vec![RenderedJobTemplate::new(
        "web",
        "check process web",
        vec![RenderedTemplateFile::new(
            "config.yml.erb",
            "config/config.yml",
            contents,
        )],
    )])
}

// =============================================================================
// Store
// =============================================================================

/// Memory store whose instance reads fail once `fail_reads` is set.
pub struct UnreadableInstances {
    pub inner: Arc<MemoryStore>,
    pub fail_reads: AtomicBool,
}

impl UnreadableInstances {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl InstanceStore for UnreadableInstances {
    async fn insert_instance(&self, record: &InstanceRecord) -> DirectorResult<()> {
        self.inner.insert_instance(record).await
    }

    async fn get_instance(&self, id: &InstanceId) -> DirectorResult<Option<InstanceRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DirectorError::store("connection reset"));
        }
        self.inner.get_instance(id).await
    }

    async fn bind_vm(&self, id: &InstanceId, binding: &VmBinding) -> DirectorResult<()> {
        self.inner.bind_vm(id, binding).await
    }

    async fn unbind_vm(&self, id: &InstanceId) -> DirectorResult<()> {
        self.inner.unbind_vm(id).await
    }

    async fn update_cloud_properties(
        &self,
        id: &InstanceId,
        cloud_properties: &Value,
    ) -> DirectorResult<()> {
        self.inner.update_cloud_properties(id, cloud_properties).await
    }

    async fn update_trusted_certs_sha1(&self, id: &InstanceId, sha1: &str) -> DirectorResult<()> {
        self.inner.update_trusted_certs_sha1(id, sha1).await
    }

    async fn update_spec(&self, id: &InstanceId, spec_json: &str) -> DirectorResult<()> {
        self.inner.update_spec(id, spec_json).await
    }

    async fn latest_rendered_templates_archive(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Option<RenderedTemplatesArchiveRecord>> {
        self.inner.latest_rendered_templates_archive(instance_id).await
    }

    async fn add_rendered_templates_archive(
        &self,
        archive: &NewRenderedTemplatesArchive,
    ) -> DirectorResult<RenderedTemplatesArchiveRecord> {
        self.inner.add_rendered_templates_archive(archive).await
    }

    async fn update_rendered_templates_archive(
        &self,
        id: i64,
        blobstore_id: &str,
        sha1: &str,
    ) -> DirectorResult<()> {
        self.inner
            .update_rendered_templates_archive(id, blobstore_id, sha1)
            .await
    }

    async fn list_rendered_templates_archives(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<RenderedTemplatesArchiveRecord>> {
        self.inner.list_rendered_templates_archives(instance_id).await
    }

    async fn create_local_dns_record(&self, record: &LocalDnsRecord) -> DirectorResult<bool> {
        self.inner.create_local_dns_record(record).await
    }

    async fn local_dns_records(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<LocalDnsRecord>> {
        self.inner.local_dns_records(instance_id).await
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Provisioner wired to fakes and in-memory stores.
pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub agent: Arc<FakeAgent>,
    pub agents: Arc<FakeAgentFactory>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventLog>,
    pub blobstore: Arc<CountingBlobstore>,
    pub locks: InstanceLocks,
    pub config: DirectorConfig,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let agent = Arc::new(FakeAgent::default());
        Self {
            cloud: Arc::new(FakeCloud::default()),
            agents: Arc::new(FakeAgentFactory::new(agent.clone())),
            agent,
            broadcaster: Arc::new(FakeBroadcaster::default()),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(MemoryEventLog::new()),
            blobstore: Arc::new(CountingBlobstore::default()),
            locks: InstanceLocks::new(),
            config: DirectorConfig::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cloud: self.cloud.clone(),
            agents: self.agents.clone(),
            broadcaster: self.broadcaster.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            blobstore: self.blobstore.clone(),
            locks: self.locks.clone(),
        }
    }

    pub fn creator(&self) -> VmCreator {
        self.creator_with(self.collaborators())
    }

    pub fn creator_with(&self, collaborators: Collaborators) -> VmCreator {
        VmCreator::new(
            collaborators,
            &self.config,
            TaskContext::new("admin", "task-42"),
        )
    }

    pub async fn insert(&self, identity: &InstanceIdentity) {
        self.store
            .insert_instance(&InstanceRecord::new(identity))
            .await
            .unwrap();
    }

    pub async fn instance(&self, identity: &InstanceIdentity) -> InstanceRecord {
        self.store.get_instance(&identity.id).await.unwrap().unwrap()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
