//! PostgreSQL instance store implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{DirectorError, DirectorResult};
use crate::types::{
    AgentId, Credentials, InstanceId, InstanceRecord, LocalDnsRecord, NewRenderedTemplatesArchive,
    RenderedTemplatesArchiveRecord, VmBinding, VmCid,
};

use super::InstanceStore;

const ARCHIVE_COLUMNS: &str = "id, instance_id, blobstore_id, sha1, content_sha1, created_at";

/// PostgreSQL-backed instance store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> DirectorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> DirectorResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> DirectorResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                uuid TEXT NOT NULL,
                job TEXT NOT NULL,
                instance_index INTEGER NOT NULL,
                deployment TEXT NOT NULL,
                vm_cid TEXT,
                agent_id TEXT,
                credentials JSONB,
                spec_json TEXT,
                cloud_properties JSONB,
                trusted_certs_sha1 TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS rendered_templates_archives (
                id BIGSERIAL PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
                blobstore_id TEXT NOT NULL,
                sha1 TEXT NOT NULL,
                content_sha1 TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_rendered_templates_archives_latest
            ON rendered_templates_archives (instance_id, created_at DESC, id DESC)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS local_dns_records (
                id BIGSERIAL PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                ip TEXT NOT NULL,
                UNIQUE (instance_id, name)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into an [`InstanceRecord`].
    fn row_to_instance(row: &PgRow) -> DirectorResult<InstanceRecord> {
        let index: i32 = row.get("instance_index");
        let credentials: Option<Value> = row.get("credentials");

        let credentials = credentials
            .map(serde_json::from_value::<Credentials>)
            .transpose()
            .map_err(|e| {
                DirectorError::Serialisation(format!("failed to deserialise credentials: {e}"))
            })?;

        Ok(InstanceRecord {
            id: InstanceId::new(row.get::<String, _>("id")),
            uuid: row.get("uuid"),
            job: row.get("job"),
            index: u32::try_from(index)
                .map_err(|_| DirectorError::Serialisation(format!("negative index {index}")))?,
            deployment: row.get("deployment"),
            vm_cid: row.get::<Option<String>, _>("vm_cid").map(VmCid::new),
            agent_id: row.get::<Option<String>, _>("agent_id").map(AgentId::new),
            credentials,
            spec_json: row.get("spec_json"),
            cloud_properties: row.get("cloud_properties"),
            trusted_certs_sha1: row.get("trusted_certs_sha1"),
        })
    }

    /// Parse a row into a [`RenderedTemplatesArchiveRecord`].
    fn row_to_archive(row: &PgRow) -> RenderedTemplatesArchiveRecord {
        let created_at: DateTime<Utc> = row.get("created_at");
        RenderedTemplatesArchiveRecord {
            id: row.get("id"),
            instance_id: InstanceId::new(row.get::<String, _>("instance_id")),
            blobstore_id: row.get("blobstore_id"),
            sha1: row.get("sha1"),
            content_sha1: row.get("content_sha1"),
            created_at,
        }
    }

    async fn update_instance_column<T>(
        &self,
        id: &InstanceId,
        query: &str,
        value: T,
    ) -> DirectorResult<()>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        let result = sqlx::query(query)
            .bind(value)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DirectorError::store(format!("instance {id} not found")));
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn insert_instance(&self, record: &InstanceRecord) -> DirectorResult<()> {
        let index = i32::try_from(record.index)
            .map_err(|_| DirectorError::store(format!("index {} out of range", record.index)))?;
        let credentials = record
            .credentials
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO instances (
                id, uuid, job, instance_index, deployment, vm_cid, agent_id,
                credentials, spec_json, cloud_properties, trusted_certs_sha1
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(record.id.as_str())
        .bind(&record.uuid)
        .bind(&record.job)
        .bind(index)
        .bind(&record.deployment)
        .bind(record.vm_cid.as_ref().map(VmCid::as_str))
        .bind(record.agent_id.as_ref().map(AgentId::as_str))
        .bind(credentials)
        .bind(&record.spec_json)
        .bind(&record.cloud_properties)
        .bind(&record.trusted_certs_sha1)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> DirectorResult<Option<InstanceRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, uuid, job, instance_index, deployment, vm_cid, agent_id,
                   credentials, spec_json, cloud_properties, trusted_certs_sha1
            FROM instances
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_instance(&r)?)),
            None => Ok(None),
        }
    }

    async fn bind_vm(&self, id: &InstanceId, binding: &VmBinding) -> DirectorResult<()> {
        let credentials = binding
            .credentials
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r"
            UPDATE instances
            SET vm_cid = $1, agent_id = $2, credentials = $3
            WHERE id = $4
            ",
        )
        .bind(binding.vm_cid.as_str())
        .bind(binding.agent_id.as_str())
        .bind(credentials)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectorError::store(format!("instance {id} not found")));
        }

        Ok(())
    }

    async fn unbind_vm(&self, id: &InstanceId) -> DirectorResult<()> {
        let result = sqlx::query(
            r"
            UPDATE instances
            SET vm_cid = NULL, agent_id = NULL, credentials = NULL
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectorError::store(format!("instance {id} not found")));
        }

        Ok(())
    }

    async fn update_cloud_properties(
        &self,
        id: &InstanceId,
        cloud_properties: &Value,
    ) -> DirectorResult<()> {
        self.update_instance_column(
            id,
            "UPDATE instances SET cloud_properties = $1 WHERE id = $2",
            cloud_properties.clone(),
        )
        .await
    }

    async fn update_trusted_certs_sha1(&self, id: &InstanceId, sha1: &str) -> DirectorResult<()> {
        self.update_instance_column(
            id,
            "UPDATE instances SET trusted_certs_sha1 = $1 WHERE id = $2",
            sha1.to_owned(),
        )
        .await
    }

    async fn update_spec(&self, id: &InstanceId, spec_json: &str) -> DirectorResult<()> {
        self.update_instance_column(
            id,
            "UPDATE instances SET spec_json = $1 WHERE id = $2",
            spec_json.to_owned(),
        )
        .await
    }

    async fn latest_rendered_templates_archive(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Option<RenderedTemplatesArchiveRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM rendered_templates_archives
             WHERE instance_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_archive))
    }

    async fn add_rendered_templates_archive(
        &self,
        archive: &NewRenderedTemplatesArchive,
    ) -> DirectorResult<RenderedTemplatesArchiveRecord> {
        let mut tx = self.pool.begin().await?;

        // Serialise writers per instance for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(archive.instance_id.as_str())
            .execute(&mut *tx)
            .await?;

        let latest = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM rendered_templates_archives
             WHERE instance_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1
             FOR UPDATE"
        ))
        .bind(archive.instance_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(Self::row_to_archive);

        let row = match latest {
            Some(latest) if latest.content_sha1 == archive.content_sha1 => {
                sqlx::query(&format!(
                    "UPDATE rendered_templates_archives
                     SET blobstore_id = $1, sha1 = $2
                     WHERE id = $3
                     RETURNING {ARCHIVE_COLUMNS}"
                ))
                .bind(&archive.blobstore_id)
                .bind(&archive.sha1)
                .bind(latest.id)
                .fetch_one(&mut *tx)
                .await?
            }
            _ => {
                sqlx::query(&format!(
                    "INSERT INTO rendered_templates_archives
                        (instance_id, blobstore_id, sha1, content_sha1, created_at)
                     VALUES ($1, $2, $3, $4, $5)
                     RETURNING {ARCHIVE_COLUMNS}"
                ))
                .bind(archive.instance_id.as_str())
                .bind(&archive.blobstore_id)
                .bind(&archive.sha1)
                .bind(&archive.content_sha1)
                .bind(archive.created_at)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(Self::row_to_archive(&row))
    }

    async fn update_rendered_templates_archive(
        &self,
        id: i64,
        blobstore_id: &str,
        sha1: &str,
    ) -> DirectorResult<()> {
        let result = sqlx::query(
            r"
            UPDATE rendered_templates_archives
            SET blobstore_id = $1, sha1 = $2
            WHERE id = $3
            ",
        )
        .bind(blobstore_id)
        .bind(sha1)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectorError::store(format!("archive {id} not found")));
        }

        Ok(())
    }

    async fn list_rendered_templates_archives(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<RenderedTemplatesArchiveRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM rendered_templates_archives
             WHERE instance_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_archive).collect())
    }

    async fn create_local_dns_record(&self, record: &LocalDnsRecord) -> DirectorResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO local_dns_records (instance_id, name, ip)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, name) DO NOTHING
            ",
        )
        .bind(record.instance_id.as_str())
        .bind(&record.name)
        .bind(&record.ip)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn local_dns_records(
        &self,
        instance_id: &InstanceId,
    ) -> DirectorResult<Vec<LocalDnsRecord>> {
        let rows = sqlx::query(
            r"
            SELECT instance_id, name, ip
            FROM local_dns_records
            WHERE instance_id = $1
            ORDER BY id
            ",
        )
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| LocalDnsRecord {
                instance_id: InstanceId::new(row.get::<String, _>("instance_id")),
                name: row.get("name"),
                ip: row.get("ip"),
            })
            .collect())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
