//! Rendered template cache and delivery.
//!
//! Compressed templates are keyed by the instance's configuration hash. When
//! the latest archive row already matches and the transport still holds the
//! archive, nothing is compressed or uploaded.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use stratos_templates::{RenderedJobInstance, RenderedTemplatesArchive};
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::agent::AgentClient;
use crate::blobstore::Blobstore;
use crate::config::{DeliveryTransport, TemplatesConfig};
use crate::error::{DirectorError, DirectorResult};
use crate::store::InstanceStore;
use crate::types::{InstanceIdentity, NewRenderedTemplatesArchive};

/// A compressed archive read into memory.
#[derive(Debug, Clone)]
struct CompressedTemplates {
    contents: Bytes,
    sha1: String,
}

/// Where compressed templates are sent.
enum Delivery<'a> {
    /// Upload to the shared blobstore.
    SharedStore(&'a dyn Blobstore),
    /// Push straight to the VM's agent.
    DirectAgent(&'a dyn AgentClient),
}

impl Delivery<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::SharedStore(_) => "shared_store",
            Self::DirectAgent(_) => "direct_agent",
        }
    }

    /// Whether a previously delivered archive is still retrievable.
    async fn holds(&self, blobstore_id: &str) -> DirectorResult<bool> {
        match self {
            Self::SharedStore(blobstore) => blobstore.exists(blobstore_id).await,
            // A direct transfer cannot be inspected afterwards.
            Self::DirectAgent(_) => Ok(false),
        }
    }

    /// Deliver an archive and return its locator.
    async fn deliver(&self, compressed: &CompressedTemplates) -> DirectorResult<String> {
        match self {
            Self::SharedStore(blobstore) => blobstore
                .create(compressed.contents.clone())
                .await
                .map_err(|e| match e {
                    DirectorError::CacheTransport(_) => e,
                    other => DirectorError::cache_transport(other.to_string()),
                }),
            Self::DirectAgent(agent) => {
                let blob_id = uuid::Uuid::new_v4().to_string();
                let payload = STANDARD.encode(&compressed.contents);
                agent
                    .upload_blob(&blob_id, &compressed.sha1, &payload)
                    .await
                    .map_err(|e| {
                        DirectorError::cache_transport(format!(
                            "failed to upload templates to agent: {e}"
                        ))
                    })?;
                Ok(blob_id)
            }
        }
    }
}

/// Ensures an instance's rendered templates are available to its VM.
pub struct TemplatesPersister {
    store: Arc<dyn InstanceStore>,
    blobstore: Arc<dyn Blobstore>,
    config: TemplatesConfig,
}

impl TemplatesPersister {
    /// Create a persister.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        blobstore: Arc<dyn Blobstore>,
        config: TemplatesConfig,
    ) -> Self {
        Self {
            store,
            blobstore,
            config,
        }
    }

    /// Make sure the rendered templates are delivered and recorded.
    ///
    /// Returns `None` without touching the store or the transport when there
    /// is nothing rendered. `agent` is only used by the direct transport.
    pub async fn persist(
        &self,
        identity: &InstanceIdentity,
        rendered: Option<&RenderedJobInstance>,
        agent: &dyn AgentClient,
    ) -> DirectorResult<Option<RenderedTemplatesArchive>> {
        let Some(rendered) = rendered else {
            debug!(instance = %identity.name(), "no rendered templates to persist");
            return Ok(None);
        };

        let delivery = match self.config.delivery {
            DeliveryTransport::SharedStore => Delivery::SharedStore(self.blobstore.as_ref()),
            DeliveryTransport::DirectAgent => Delivery::DirectAgent(agent),
        };

        let configuration_hash = rendered.configuration_hash();
        let latest = self
            .store
            .latest_rendered_templates_archive(&identity.id)
            .await?
            .filter(|latest| latest.content_sha1 == configuration_hash);

        if let Some(latest) = latest {
            if delivery.holds(&latest.blobstore_id).await? {
                debug!(
                    instance = %identity.name(),
                    blobstore_id = %latest.blobstore_id,
                    "rendered templates already delivered"
                );
                return Ok(Some(latest.archive()));
            }

            let compressed = compress(rendered).await?;
            let blobstore_id = delivery.deliver(&compressed).await?;

            self.store
                .update_rendered_templates_archive(latest.id, &blobstore_id, &compressed.sha1)
                .await?;

            info!(
                instance = %identity.name(),
                transport = delivery.name(),
                blobstore_id = %blobstore_id,
                "redelivered rendered templates"
            );
            return Ok(Some(RenderedTemplatesArchive::new(
                blobstore_id,
                compressed.sha1,
            )));
        }

        let compressed = compress(rendered).await?;
        let blobstore_id = delivery.deliver(&compressed).await?;

        let record = self
            .store
            .add_rendered_templates_archive(&NewRenderedTemplatesArchive {
                instance_id: identity.id.clone(),
                blobstore_id,
                sha1: compressed.sha1,
                content_sha1: configuration_hash,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            instance = %identity.name(),
            transport = delivery.name(),
            blobstore_id = %record.blobstore_id,
            "delivered rendered templates"
        );
        Ok(Some(record.archive()))
    }
}

impl std::fmt::Debug for TemplatesPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplatesPersister")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Build the gzip tarball off the async runtime. The temp file is gone by the
/// time this returns.
async fn compress(rendered: &RenderedJobInstance) -> DirectorResult<CompressedTemplates> {
    let rendered = rendered.clone();
    spawn_blocking(move || -> DirectorResult<CompressedTemplates> {
        let compressed = rendered.generate_compressed_templates()?;
        Ok(CompressedTemplates {
            contents: compressed.contents()?,
            sha1: compressed.sha1().to_owned(),
        })
    })
    .await
    .map_err(|e| DirectorError::internal(format!("compression task failed: {e}")))?
}
