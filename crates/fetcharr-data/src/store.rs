//! Postgres implementation of the pipeline store.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::error::{PipelineError, PipelineResult};
use fetcharr_pipeline::model::{MediaRequest, ProcessingItem};
use fetcharr_pipeline::store::{DownloadRecord, PipelineStore};
use sqlx::{PgPool, types::Json};
use uuid::Uuid;

use crate::rows::{decode_download, decode_item, decode_request};

/// Database-backed pipeline store.
#[derive(Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

const INSERT_REQUEST: &str = r"
    INSERT INTO request (
        id, media_type, catalog_id, external_id, title, year,
        targets, pipeline, status, progress, error, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
";

const UPDATE_REQUEST: &str = r"
    UPDATE request
    SET status = $2, progress = $3, error = $4, updated_at = $5
    WHERE id = $1
";

const DELETE_REQUEST: &str = r"DELETE FROM request WHERE id = $1";

const SELECT_REQUEST: &str = r"SELECT * FROM request WHERE id = $1";

const INSERT_ITEM: &str = r"
    INSERT INTO item (
        id, request_id, kind, catalog_id, title, year, season, episode,
        status, current_step, step_context, checkpoint,
        attempts, max_attempts, last_error, error_history,
        next_retry_at, skip_until, cooldown_ends_at,
        download_id, encoding_job_id,
        progress, last_progress_update, last_progress_value,
        downloaded_at, encoded_at, delivered_at, completed_at,
        created_at, updated_at
    )
    VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8,
        $9, $10, $11, $12,
        $13, $14, $15, $16,
        $17, $18, $19,
        $20, $21,
        $22, $23, $24,
        $25, $26, $27, $28,
        $29, $30
    )
";

const SELECT_ITEM: &str = r"SELECT * FROM item WHERE id = $1";

const SELECT_ITEMS_FOR_REQUEST: &str = r"
    SELECT * FROM item WHERE request_id = $1 ORDER BY created_at
";

const SELECT_ITEMS_WITH_STATUS: &str = r"
    SELECT * FROM item WHERE status = $1 ORDER BY created_at
";

const SELECT_ELIGIBLE_ITEMS: &str = r"
    SELECT * FROM item
    WHERE status = $1
      AND (next_retry_at IS NULL OR next_retry_at <= $2)
      AND (skip_until IS NULL OR skip_until <= $2)
    ORDER BY created_at
";

const UPDATE_ITEM: &str = r"
    UPDATE item
    SET status = $2,
        current_step = $3,
        step_context = $4,
        checkpoint = $5,
        attempts = $6,
        max_attempts = $7,
        last_error = $8,
        error_history = $9,
        next_retry_at = $10,
        skip_until = $11,
        cooldown_ends_at = $12,
        download_id = $13,
        encoding_job_id = $14,
        progress = $15,
        last_progress_update = $16,
        last_progress_value = $17,
        downloaded_at = $18,
        encoded_at = $19,
        delivered_at = $20,
        completed_at = $21,
        updated_at = $22
    WHERE id = $1 AND updated_at = $23
";

const UPSERT_DOWNLOAD: &str = r"
    INSERT INTO download (
        id, request_id, torrent_hash, torrent_name, progress,
        save_path, content_path, created_at, completed_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (torrent_hash) DO UPDATE
    SET torrent_name = EXCLUDED.torrent_name,
        progress = EXCLUDED.progress,
        save_path = EXCLUDED.save_path,
        content_path = EXCLUDED.content_path,
        completed_at = EXCLUDED.completed_at
";

const SELECT_DOWNLOAD_BY_HASH: &str = r"SELECT * FROM download WHERE torrent_hash = $1";

impl PgPipelineStore {
    /// Initialise the store, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> anyhow::Result<Self> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .context("failed to run pipeline migrations")?;
        tracing::debug!("pipeline migrations applied");
        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn progress_i16(value: u8) -> i16 {
    i16::from(value)
}

fn attempts_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn create_request(&self, request: &MediaRequest) -> PipelineResult<()> {
        sqlx::query(INSERT_REQUEST)
            .bind(request.id)
            .bind(request.media_type.as_str())
            .bind(request.catalog_id)
            .bind(request.external_id.as_deref())
            .bind(&request.title)
            .bind(request.year)
            .bind(Json(&request.targets))
            .bind(request.pipeline.as_ref().map(Json))
            .bind(request.status.as_str())
            .bind(progress_i16(request.progress))
            .bind(request.error.as_deref())
            .bind(request.created_at)
            .bind(request.updated_at)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        Ok(())
    }

    async fn update_request(&self, request: &MediaRequest) -> PipelineResult<()> {
        let result = sqlx::query(UPDATE_REQUEST)
            .bind(request.id)
            .bind(request.status.as_str())
            .bind(progress_i16(request.progress))
            .bind(request.error.as_deref())
            .bind(request.updated_at)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::RequestNotFound { id: request.id });
        }
        Ok(())
    }

    async fn delete_request(&self, id: Uuid) -> PipelineResult<()> {
        sqlx::query(DELETE_REQUEST)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        Ok(())
    }

    async fn request(&self, id: Uuid) -> PipelineResult<Option<MediaRequest>> {
        let row = sqlx::query(SELECT_REQUEST)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        row.as_ref()
            .map(decode_request)
            .transpose()
            .map_err(PipelineError::store)
    }

    async fn create_item(&self, item: &ProcessingItem) -> PipelineResult<()> {
        sqlx::query(INSERT_ITEM)
            .bind(item.id)
            .bind(item.request_id)
            .bind(item.kind.as_str())
            .bind(item.catalog_id)
            .bind(&item.title)
            .bind(item.year)
            .bind(item.season)
            .bind(item.episode)
            .bind(item.status.as_str())
            .bind(item.current_step.as_deref())
            .bind(Json(&item.step_context))
            .bind(Json(&item.checkpoint))
            .bind(attempts_i32(item.attempts))
            .bind(attempts_i32(item.max_attempts))
            .bind(item.last_error.as_deref())
            .bind(Json(&item.error_history))
            .bind(item.next_retry_at)
            .bind(item.skip_until)
            .bind(item.cooldown_ends_at)
            .bind(item.download_id.as_deref())
            .bind(item.encoding_job_id)
            .bind(progress_i16(item.progress))
            .bind(item.last_progress_update)
            .bind(item.last_progress_value.map(progress_i16))
            .bind(item.downloaded_at)
            .bind(item.encoded_at)
            .bind(item.delivered_at)
            .bind(item.completed_at)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        Ok(())
    }

    async fn item(&self, id: Uuid) -> PipelineResult<Option<ProcessingItem>> {
        let row = sqlx::query(SELECT_ITEM)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        row.as_ref()
            .map(decode_item)
            .transpose()
            .map_err(PipelineError::store)
    }

    async fn items_for_request(&self, request_id: Uuid) -> PipelineResult<Vec<ProcessingItem>> {
        let rows = sqlx::query(SELECT_ITEMS_FOR_REQUEST)
            .bind(request_id)
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        rows.iter()
            .map(decode_item)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::store)
    }

    async fn items_with_status(&self, status: ItemStatus) -> PipelineResult<Vec<ProcessingItem>> {
        let rows = sqlx::query(SELECT_ITEMS_WITH_STATUS)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        rows.iter()
            .map(decode_item)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::store)
    }

    async fn eligible_items(
        &self,
        status: ItemStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProcessingItem>> {
        let rows = sqlx::query(SELECT_ELIGIBLE_ITEMS)
            .bind(status.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        rows.iter()
            .map(decode_item)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::store)
    }

    async fn update_item(
        &self,
        item: &ProcessingItem,
        expected_updated_at: DateTime<Utc>,
    ) -> PipelineResult<DateTime<Utc>> {
        let now = Utc::now();
        let result = sqlx::query(UPDATE_ITEM)
            .bind(item.id)
            .bind(item.status.as_str())
            .bind(item.current_step.as_deref())
            .bind(Json(&item.step_context))
            .bind(Json(&item.checkpoint))
            .bind(attempts_i32(item.attempts))
            .bind(attempts_i32(item.max_attempts))
            .bind(item.last_error.as_deref())
            .bind(Json(&item.error_history))
            .bind(item.next_retry_at)
            .bind(item.skip_until)
            .bind(item.cooldown_ends_at)
            .bind(item.download_id.as_deref())
            .bind(item.encoding_job_id)
            .bind(progress_i16(item.progress))
            .bind(item.last_progress_update)
            .bind(item.last_progress_value.map(progress_i16))
            .bind(item.downloaded_at)
            .bind(item.encoded_at)
            .bind(item.delivered_at)
            .bind(item.completed_at)
            .bind(now)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;

        if result.rows_affected() == 0 {
            // Distinguish a stale writer from a missing row.
            return match self.item(item.id).await? {
                Some(_) => Err(PipelineError::Conflict { id: item.id }),
                None => Err(PipelineError::ItemNotFound { id: item.id }),
            };
        }
        Ok(now)
    }

    async fn record_download(&self, record: &DownloadRecord) -> PipelineResult<()> {
        sqlx::query(UPSERT_DOWNLOAD)
            .bind(record.id)
            .bind(record.request_id)
            .bind(&record.torrent_hash)
            .bind(&record.torrent_name)
            .bind(progress_i16(record.progress))
            .bind(record.save_path.as_deref())
            .bind(record.content_path.as_deref())
            .bind(record.created_at)
            .bind(record.completed_at)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        Ok(())
    }

    async fn download_by_hash(&self, hash: &str) -> PipelineResult<Option<DownloadRecord>> {
        let row = sqlx::query(SELECT_DOWNLOAD_BY_HASH)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::store)?;
        row.as_ref()
            .map(decode_download)
            .transpose()
            .map_err(PipelineError::store)
    }
}
