//! Persistence seam for the pipeline.
//!
//! The engine is written against this trait; the Postgres implementation
//! lives in `fetcharr-data` and the in-memory implementation used by tests in
//! `fetcharr-test-support`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fetcharr_events::ItemStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::model::{MediaRequest, ProcessingItem};

/// Local record of a torrent admitted (or adopted) for a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    /// Stable identifier of the record.
    pub id: Uuid,
    /// Request the download belongs to.
    pub request_id: Uuid,
    /// Info-hash of the torrent; unique across records.
    pub torrent_hash: String,
    /// Display name reported by the client.
    pub torrent_name: String,
    /// Completion percentage at the last poll (0-100).
    pub progress: u8,
    /// Directory the client saves into, when known.
    pub save_path: Option<String>,
    /// Root path of the downloaded content, when known.
    pub content_path: Option<String>,
    /// When the download was admitted; drives the wall-clock timeout.
    pub created_at: DateTime<Utc>,
    /// When the client reported completion.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistent CRUD and query surface over requests, items and downloads.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persist a new request.
    async fn create_request(&self, request: &MediaRequest) -> PipelineResult<()>;

    /// Overwrite the mutable fields of a request (aggregates).
    async fn update_request(&self, request: &MediaRequest) -> PipelineResult<()>;

    /// Delete a request and its items; used to roll back failed creation.
    async fn delete_request(&self, id: Uuid) -> PipelineResult<()>;

    /// Load a request by id.
    async fn request(&self, id: Uuid) -> PipelineResult<Option<MediaRequest>>;

    /// Persist a new item.
    async fn create_item(&self, item: &ProcessingItem) -> PipelineResult<()>;

    /// Load an item by id.
    async fn item(&self, id: Uuid) -> PipelineResult<Option<ProcessingItem>>;

    /// Load every item owned by a request.
    async fn items_for_request(&self, request_id: Uuid) -> PipelineResult<Vec<ProcessingItem>>;

    /// Load every item holding a status, regardless of retry gates.
    async fn items_with_status(&self, status: ItemStatus) -> PipelineResult<Vec<ProcessingItem>>;

    /// Load items holding a status whose retry gates have elapsed at `now`.
    async fn eligible_items(
        &self,
        status: ItemStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProcessingItem>>;

    /// Overwrite an item's mutable fields.
    ///
    /// Optimistic concurrency: the write only applies when the stored
    /// `updated_at` still equals `expected_updated_at`; otherwise
    /// [`crate::PipelineError::Conflict`] is returned. The store stamps and
    /// returns the new `updated_at`.
    async fn update_item(
        &self,
        item: &ProcessingItem,
        expected_updated_at: DateTime<Utc>,
    ) -> PipelineResult<DateTime<Utc>>;

    /// Persist (or refresh) a download record.
    async fn record_download(&self, record: &DownloadRecord) -> PipelineResult<()>;

    /// Load a download record by torrent hash.
    async fn download_by_hash(&self, hash: &str) -> PipelineResult<Option<DownloadRecord>>;
}
