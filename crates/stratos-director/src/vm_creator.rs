//! VM provisioning for a single instance.
//!
//! [`VmCreator::create_for_instance_plan`] drives the cloud driver through a
//! bounded retry loop, binds the resulting VM to the instance record,
//! configures the agent, delivers rendered templates and registers local DNS.
//! A failure after the VM exists deletes it again unless
//! `keep_unreachable_vms` is set.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use stratos_templates::RenderedTemplatesArchive;
use tracing::{error, info, warn};

use crate::agent::{AgentBroadcaster, AgentClient, AgentClientFactory};
use crate::blobstore::Blobstore;
use crate::cloud::{Cloud, CreateVmRequest};
use crate::config::{DirectorConfig, ProvisioningConfig};
use crate::dns::LocalDnsRegistrar;
use crate::env::{generate_password, VmEnv};
use crate::error::{DirectorError, DirectorResult};
use crate::events::{EventId, EventRecorder, NewEvent, TaskContext};
use crate::locks::InstanceLocks;
use crate::network::NetworkSettings;
use crate::persister::TemplatesPersister;
use crate::plan::InstancePlan;
use crate::state::{Created, Creating, ProvisioningAttempt};
use crate::store::InstanceStore;
use crate::types::{
    AgentId, Credentials, InstanceIdentity, InstanceRecord, LocalDnsRecord, VmBinding, VmCid,
    VmMetadata,
};

/// Spec keys sent to the agent on first apply.
const AGENT_SPEC_KEYS: &[&str] = &["networks", "deployment", "job", "index", "id"];

/// Spec keys persisted on the instance after first apply.
const INSTANCE_SPEC_KEYS: &[&str] = &[
    "networks",
    "deployment",
    "job",
    "index",
    "id",
    "stemcell",
    "vm_type",
    "env",
];

/// Everything the provisioner talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Infrastructure driver.
    pub cloud: Arc<dyn Cloud>,
    /// Builds clients for new VMs' agents.
    pub agents: Arc<dyn AgentClientFactory>,
    /// Fleet-wide agent messages.
    pub broadcaster: Arc<dyn AgentBroadcaster>,
    /// Durable instance state.
    pub store: Arc<dyn InstanceStore>,
    /// Audit event sink.
    pub events: Arc<dyn EventRecorder>,
    /// Shared blobstore for rendered templates.
    pub blobstore: Arc<dyn Blobstore>,
    /// Per-instance locks, shared by every provisioner in the process.
    pub locks: InstanceLocks,
}

/// Result of a successful provisioning call.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundInstance {
    /// Instance record after binding.
    pub record: InstanceRecord,
    /// The new VM.
    pub vm_cid: VmCid,
    /// Delivered template archive, when the instance has rendered templates.
    pub rendered_templates_archive: Option<RenderedTemplatesArchive>,
    /// Local DNS record, when the instance spec allowed one.
    pub local_dns_record: Option<LocalDnsRecord>,
}

/// Creates and binds VMs for instance plans.
pub struct VmCreator {
    cloud: Arc<dyn Cloud>,
    agents: Arc<dyn AgentClientFactory>,
    broadcaster: Arc<dyn AgentBroadcaster>,
    store: Arc<dyn InstanceStore>,
    events: Arc<dyn EventRecorder>,
    persister: TemplatesPersister,
    dns: LocalDnsRegistrar,
    config: ProvisioningConfig,
    task: TaskContext,
    locks: InstanceLocks,
}

impl VmCreator {
    /// Create a provisioner acting on behalf of `task`.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: &DirectorConfig, task: TaskContext) -> Self {
        let persister = TemplatesPersister::new(
            Arc::clone(&collaborators.store),
            collaborators.blobstore,
            config.templates,
        );
        let dns = LocalDnsRegistrar::new(Arc::clone(&collaborators.store), config.dns.clone());

        Self {
            cloud: collaborators.cloud,
            agents: collaborators.agents,
            broadcaster: collaborators.broadcaster,
            store: collaborators.store,
            events: collaborators.events,
            persister,
            dns,
            config: config.provisioning.clone(),
            task,
            locks: collaborators.locks,
        }
    }

    /// Provision a VM for the plan's instance.
    ///
    /// The instance record must already exist in the store. Attempts for the
    /// same instance are serialised.
    pub async fn create_for_instance_plan(
        &self,
        plan: &InstancePlan,
        disk_cids: &[String],
    ) -> DirectorResult<BoundInstance> {
        let identity = &plan.instance;
        let _guard = self.locks.lock(&identity.id).await;

        let network_settings = NetworkSettings::from_reservations(&plan.network_reservations);
        let (env, credentials) = self.build_env(plan);

        let parent_id = self.events.record(self.vm_event(identity, None, None, None)).await?;

        info!(
            instance = %identity.name(),
            stemcell = %plan.stemcell_cid,
            "creating VM"
        );

        let result = self
            .provision(plan, disk_cids, &network_settings, env, credentials)
            .await;

        let child = match &result {
            Ok(bound) => self.vm_event(
                identity,
                Some(parent_id),
                Some(bound.vm_cid.to_string()),
                None,
            ),
            Err((vm_cid, e)) => self.vm_event(
                identity,
                Some(parent_id),
                vm_cid.as_ref().map(ToString::to_string),
                Some(e.category().to_owned()),
            ),
        };
        if let Err(e) = self.events.record(child).await {
            warn!(instance = %identity.name(), error = %e, "failed to record VM event");
        }

        let mut bound = result.map_err(|(_, e)| {
            error!(instance = %identity.name(), error = %e, "VM creation failed");
            e
        })?;

        bound.local_dns_record = self.dns.register(identity).await;

        info!(instance = %identity.name(), vm_cid = %bound.vm_cid, "VM ready");
        Ok(bound)
    }

    /// Merge the env and attach generated secrets. Each call owns its env.
    fn build_env(&self, plan: &InstancePlan) -> (VmEnv, Option<Credentials>) {
        let mut env = VmEnv::merged(&self.config.agent_env, &plan.env);

        if (self.config.generate_vm_passwords || self.config.encryption) && env.password().is_none()
        {
            env.set_password(generate_password());
        }

        let credentials = self.config.encryption.then(Credentials::generate);
        if let Some(credentials) = &credentials {
            env.set_credentials(credentials);
        }

        (env, credentials)
    }

    async fn provision(
        &self,
        plan: &InstancePlan,
        disk_cids: &[String],
        network_settings: &NetworkSettings,
        env: VmEnv,
        credentials: Option<Credentials>,
    ) -> Result<BoundInstance, (Option<VmCid>, DirectorError)> {
        let identity = &plan.instance;
        let creating = ProvisioningAttempt::new(identity).start_creating();

        let request = CreateVmRequest {
            agent_id: AgentId::generate(),
            stemcell_cid: plan.stemcell_cid.clone(),
            cloud_properties: plan.cloud_properties.clone(),
            network_settings: network_settings.clone(),
            disk_cids: disk_cids.to_vec(),
            env,
        };

        let (created, vm_cid) = self
            .create_vm_with_retries(creating, &request)
            .await
            .map_err(|e| (None, e))?;

        let binding = created.start_binding();
        let bound = self
            .bind(plan, &vm_cid, &request.agent_id, credentials, network_settings)
            .await;

        match bound {
            Ok((record, rendered_templates_archive)) => {
                let _ready = binding.ready();
                Ok(BoundInstance {
                    record,
                    vm_cid,
                    rendered_templates_archive,
                    local_dns_record: None,
                })
            }
            Err(source) => {
                let error = DirectorError::Binding {
                    vm_cid: vm_cid.clone(),
                    source: Box::new(source),
                };

                if self.config.keep_unreachable_vms {
                    warn!(
                        instance = %identity.name(),
                        vm_cid = %vm_cid,
                        error = %error,
                        "keeping unreachable VM"
                    );
                    let _failed = binding.fail(error.to_string());
                } else {
                    let rolling_back = binding.roll_back(error.to_string());
                    self.delete_unbound_vm(identity, &vm_cid).await;
                    let _failed = rolling_back.finish();
                }

                Err((Some(vm_cid), error))
            }
        }
    }

    async fn create_vm_with_retries(
        &self,
        mut attempt: ProvisioningAttempt<Creating>,
        request: &CreateVmRequest,
    ) -> DirectorResult<(ProvisioningAttempt<Created>, VmCid)> {
        let max_tries = self.config.max_vm_create_tries.max(1);

        loop {
            let tries = attempt.record_try();

            match self.cloud.create_vm(request).await {
                Ok(vm_cid) => {
                    info!(
                        agent_id = %request.agent_id,
                        vm_cid = %vm_cid,
                        attempt = tries,
                        "VM created"
                    );
                    return Ok((attempt.created(vm_cid.clone()), vm_cid));
                }
                Err(e) if e.is_retryable() && tries < max_tries => {
                    warn!(
                        agent_id = %request.agent_id,
                        attempt = tries,
                        max_tries,
                        error = %e,
                        "retryable VM creation failure"
                    );
                }
                Err(e) if e.is_retryable() => {
                    let _failed = attempt.fail(e.to_string());
                    return Err(DirectorError::RetryableProvider {
                        attempts: tries,
                        source: e,
                    });
                }
                Err(e) => {
                    let _failed = attempt.fail(e.to_string());
                    return Err(DirectorError::TerminalProvider { source: e });
                }
            }
        }
    }

    /// Every step after the VM exists, ending with the bound instance record.
    /// Any error here triggers rollback.
    async fn bind(
        &self,
        plan: &InstancePlan,
        vm_cid: &VmCid,
        agent_id: &AgentId,
        credentials: Option<Credentials>,
        network_settings: &NetworkSettings,
    ) -> DirectorResult<(InstanceRecord, Option<RenderedTemplatesArchive>)> {
        let identity = &plan.instance;

        let agent = self.agents.for_vm(agent_id, credentials.as_ref());
        self.store
            .bind_vm(
                &identity.id,
                &VmBinding {
                    vm_cid: vm_cid.clone(),
                    agent_id: agent_id.clone(),
                    credentials,
                },
            )
            .await?;

        agent.wait_until_ready().await?;

        if self.config.flush_arp {
            let ips = network_settings.ips();
            if !ips.is_empty() {
                self.broadcaster.delete_arp_entries(vm_cid, &ips).await?;
            }
        }

        self.update_trusted_certs(identity, agent.as_ref(), &plan.trusted_certs)
            .await?;
        self.store
            .update_cloud_properties(&identity.id, &Value::Object(plan.cloud_properties.clone()))
            .await?;

        let metadata = VmMetadata::for_instance(identity, &self.config.director_name, Utc::now());
        self.cloud.set_vm_metadata(vm_cid, &metadata).await?;

        self.apply_initial_vm_state(plan, agent.as_ref(), network_settings)
            .await?;

        let archive = self
            .persister
            .persist(identity, plan.rendered_templates.as_ref(), agent.as_ref())
            .await?;

        let record = self
            .store
            .get_instance(&identity.id)
            .await?
            .ok_or_else(|| DirectorError::store(format!("instance {} not found", identity.id)))?;

        Ok((record, archive))
    }

    async fn update_trusted_certs(
        &self,
        identity: &InstanceIdentity,
        agent: &dyn AgentClient,
        trusted_certs: &str,
    ) -> DirectorResult<()> {
        agent.update_settings(trusted_certs).await?;
        let sha1 = hex::encode(Sha1::digest(trusted_certs.as_bytes()));
        self.store
            .update_trusted_certs_sha1(&identity.id, &sha1)
            .await
    }

    /// Send the minimal spec to the agent, then persist the instance spec with
    /// the networks the agent reports (dynamic addresses are only known there).
    async fn apply_initial_vm_state(
        &self,
        plan: &InstancePlan,
        agent: &dyn AgentClient,
        network_settings: &NetworkSettings,
    ) -> DirectorResult<()> {
        let identity = &plan.instance;
        let full_spec = full_spec(plan, network_settings);

        let agent_spec = select_keys(&full_spec, AGENT_SPEC_KEYS);
        agent.apply(&Value::Object(agent_spec)).await?;

        let mut instance_spec = select_keys(&full_spec, INSTANCE_SPEC_KEYS);
        if let Some(networks) = agent.get_state().await?.networks {
            instance_spec.insert("networks".to_owned(), networks);
        }

        let spec_json = serde_json::to_string(&instance_spec)?;
        self.store.update_spec(&identity.id, &spec_json).await
    }

    /// Delete a VM that failed to bind. Failures are logged, never returned.
    async fn delete_unbound_vm(&self, identity: &InstanceIdentity, vm_cid: &VmCid) {
        match self.cloud.delete_vm(vm_cid).await {
            Ok(()) => {
                info!(instance = %identity.name(), vm_cid = %vm_cid, "deleted VM after binding failure");
                if let Err(e) = self.store.unbind_vm(&identity.id).await {
                    warn!(instance = %identity.name(), error = %e, "failed to clear VM binding");
                }
            }
            Err(e) => {
                warn!(
                    instance = %identity.name(),
                    vm_cid = %vm_cid,
                    error = %e,
                    "failed to delete VM after binding failure"
                );
            }
        }
    }

    fn vm_event(
        &self,
        identity: &InstanceIdentity,
        parent_id: Option<EventId>,
        object_name: Option<String>,
        error: Option<String>,
    ) -> NewEvent {
        NewEvent {
            parent_id,
            user: self.task.user.clone(),
            task: self.task.task_id.clone(),
            action: "create".to_owned(),
            object_type: "vm".to_owned(),
            object_name,
            deployment: identity.deployment.clone(),
            instance: identity.name(),
            error,
        }
    }
}

impl std::fmt::Debug for VmCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmCreator")
            .field("config", &self.config)
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Instance spec: identity fields and networks, plus the plan's extra fields.
fn full_spec(plan: &InstancePlan, network_settings: &NetworkSettings) -> Map<String, Value> {
    let identity = &plan.instance;
    let mut spec = plan.apply_spec.clone().unwrap_or_default();

    spec.insert("deployment".to_owned(), Value::from(identity.deployment.clone()));
    spec.insert("job".to_owned(), serde_json::json!({ "name": identity.job }));
    spec.insert("index".to_owned(), Value::from(identity.index));
    spec.insert("id".to_owned(), Value::from(identity.uuid.clone()));
    spec.insert("networks".to_owned(), network_settings.to_value());
    spec.entry("env")
        .or_insert_with(|| Value::Object(plan.env.clone()));

    spec
}

fn select_keys(spec: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    spec.iter()
        .filter(|(key, _)| keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
