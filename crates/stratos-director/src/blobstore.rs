//! Shared blobstore backed by `object_store`.
//!
//! Supports local filesystem, in-memory, and (with the `aws` feature) S3 backends.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

use crate::config::BlobstoreConfig;
use crate::error::{DirectorError, DirectorResult};

/// Content store for compressed rendered templates.
#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Store `data` under a fresh id and return the id.
    async fn create(&self, data: Bytes) -> DirectorResult<String>;

    /// Whether a blob is present.
    async fn exists(&self, blob_id: &str) -> DirectorResult<bool>;
}

/// [`Blobstore`] over any [`ObjectStore`].
pub struct ObjectStoreBlobstore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectStoreBlobstore {
    /// Create a blobstore from configuration.
    pub fn new(config: &BlobstoreConfig) -> DirectorResult<Self> {
        let store = create_object_store(config)?;
        Ok(Self {
            store,
            prefix: config.prefix.clone(),
        })
    }

    /// Create a blobstore with a pre-configured object store.
    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    fn object_path(&self, blob_id: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => ObjectPath::from(format!("{prefix}/{blob_id}")),
            None => ObjectPath::from(blob_id),
        }
    }
}

impl std::fmt::Debug for ObjectStoreBlobstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBlobstore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl Blobstore for ObjectStoreBlobstore {
    async fn create(&self, data: Bytes) -> DirectorResult<String> {
        let blob_id = uuid::Uuid::new_v4().to_string();
        let path = self.object_path(&blob_id);

        debug!(path = %path, size = data.len(), "uploading blob");
        self.store
            .put(&path, data.into())
            .await
            .map_err(|e| DirectorError::cache_transport(format!("failed to upload blob: {e}")))?;

        Ok(blob_id)
    }

    async fn exists(&self, blob_id: &str) -> DirectorResult<bool> {
        match self.store.head(&self.object_path(blob_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(DirectorError::cache_transport(format!(
                "failed to check blob {blob_id}: {e}"
            ))),
        }
    }
}

/// Create an object store from configuration.
pub fn create_object_store(config: &BlobstoreConfig) -> DirectorResult<Arc<dyn ObjectStore>> {
    match config.storage_type.as_str() {
        "local" => {
            std::fs::create_dir_all(&config.path)?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&config.path)
                .map_err(|e| DirectorError::Config(format!("failed to create local store: {e}")))?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(object_store::memory::InMemory::new())),
        #[cfg(feature = "aws")]
        "s3" => {
            use object_store::aws::AmazonS3Builder;
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.path);

            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint);
            }

            let store = builder
                .build()
                .map_err(|e| DirectorError::Config(format!("failed to create S3 store: {e}")))?;
            Ok(Arc::new(store))
        }
        other => Err(DirectorError::Config(format!(
            "unsupported blobstore type: {other}"
        ))),
    }
}
