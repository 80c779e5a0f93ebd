//! In-memory [`PipelineStore`] used by engine tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::error::{PipelineError, PipelineResult};
use fetcharr_pipeline::model::{MediaRequest, ProcessingItem};
use fetcharr_pipeline::store::{DownloadRecord, PipelineStore};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hash-map backed store with the same optimistic-concurrency contract as the
/// Postgres implementation.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<Uuid, MediaRequest>>,
    items: RwLock<HashMap<Uuid, ProcessingItem>>,
    downloads: RwLock<HashMap<String, DownloadRecord>>,
}

impl MemoryStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an item directly, bypassing the orchestrator (test setup only).
    pub async fn seed_item(&self, item: ProcessingItem) {
        self.items.write().await.insert(item.id, item);
    }

    /// Seed a request directly (test setup only).
    pub async fn seed_request(&self, request: MediaRequest) {
        self.requests.write().await.insert(request.id, request);
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_request(&self, request: &MediaRequest) -> PipelineResult<()> {
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn update_request(&self, request: &MediaRequest) -> PipelineResult<()> {
        let mut requests = self.requests.write().await;
        if !requests.contains_key(&request.id) {
            return Err(PipelineError::RequestNotFound { id: request.id });
        }
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn delete_request(&self, id: Uuid) -> PipelineResult<()> {
        self.requests.write().await.remove(&id);
        self.items
            .write()
            .await
            .retain(|_, item| item.request_id != id);
        Ok(())
    }

    async fn request(&self, id: Uuid) -> PipelineResult<Option<MediaRequest>> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn create_item(&self, item: &ProcessingItem) -> PipelineResult<()> {
        self.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn item(&self, id: Uuid) -> PipelineResult<Option<ProcessingItem>> {
        Ok(self.items.read().await.get(&id).cloned())
    }

    async fn items_for_request(&self, request_id: Uuid) -> PipelineResult<Vec<ProcessingItem>> {
        let mut items: Vec<_> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.request_id == request_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn items_with_status(&self, status: ItemStatus) -> PipelineResult<Vec<ProcessingItem>> {
        let mut items: Vec<_> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn eligible_items(
        &self,
        status: ItemStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProcessingItem>> {
        let mut items: Vec<_> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.status == status && item.eligible_at(now))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn update_item(
        &self,
        item: &ProcessingItem,
        expected_updated_at: DateTime<Utc>,
    ) -> PipelineResult<DateTime<Utc>> {
        let mut items = self.items.write().await;
        let stored = items
            .get(&item.id)
            .ok_or(PipelineError::ItemNotFound { id: item.id })?;
        if stored.updated_at != expected_updated_at {
            return Err(PipelineError::Conflict { id: item.id });
        }
        let now = Utc::now();
        let mut updated = item.clone();
        updated.updated_at = now;
        items.insert(item.id, updated);
        Ok(now)
    }

    async fn record_download(&self, record: &DownloadRecord) -> PipelineResult<()> {
        self.downloads
            .write()
            .await
            .insert(record.torrent_hash.clone(), record.clone());
        Ok(())
    }

    async fn download_by_hash(&self, hash: &str) -> PipelineResult<Option<DownloadRecord>> {
        Ok(self.downloads.read().await.get(hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::movie_request;
    use fetcharr_pipeline::model::{ItemKind, ProcessingItem};

    #[tokio::test]
    async fn optimistic_update_rejects_stale_writers() {
        let store = MemoryStore::new();
        let request = movie_request();
        let item = ProcessingItem::new(&request, ItemKind::Movie);
        store.create_item(&item).await.expect("create");

        let first = store
            .update_item(&item, item.updated_at)
            .await
            .expect("first update");

        let stale = store.update_item(&item, item.updated_at).await;
        assert!(matches!(stale, Err(PipelineError::Conflict { .. })));

        let fresh = store
            .item(item.id)
            .await
            .expect("load")
            .expect("item present");
        assert_eq!(fresh.updated_at, first);
    }

    #[tokio::test]
    async fn eligible_items_respect_gates() {
        let store = MemoryStore::new();
        let request = movie_request();
        let mut gated = ProcessingItem::new(&request, ItemKind::Movie);
        gated.skip_until = Some(Utc::now() + chrono::Duration::minutes(5));
        let open = ProcessingItem::new(&request, ItemKind::Movie);
        store.create_item(&gated).await.expect("create");
        store.create_item(&open).await.expect("create");

        let eligible = store
            .eligible_items(ItemStatus::Pending, Utc::now())
            .await
            .expect("query");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, open.id);
    }

    #[tokio::test]
    async fn delete_request_cascades_to_items() {
        let store = MemoryStore::new();
        let request = movie_request();
        store.create_request(&request).await.expect("create request");
        let item = ProcessingItem::new(&request, ItemKind::Movie);
        store.create_item(&item).await.expect("create item");

        store.delete_request(request.id).await.expect("delete");
        assert!(store.request(request.id).await.expect("load").is_none());
        assert!(store.item(item.id).await.expect("load").is_none());
    }
}
