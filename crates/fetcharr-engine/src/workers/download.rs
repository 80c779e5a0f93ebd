//! Download worker: `found` → `downloaded`, monitoring `downloading`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::adapters::{ArchiveTools, DownloadSnapshot, TorrentClient};
use fetcharr_pipeline::context::{DownloadContext, StepContext};
use fetcharr_pipeline::model::{ProcessingItem, Release};
use fetcharr_pipeline::retry::{ErrorKind, StageError, classify_message};
use fetcharr_pipeline::store::DownloadRecord;
use tracing::{debug, info};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, TransitionPatch};
use crate::settings::DownloadSettings;
use crate::workers::{BatchStats, StageWorker, dispatch_items, resolve_source};

/// Submits releases to the torrent client and promotes completed payloads.
pub struct DownloadWorker {
    orchestrator: Arc<Orchestrator>,
    client: Arc<dyn TorrentClient>,
    archive: Arc<dyn ArchiveTools>,
    settings: DownloadSettings,
}

impl DownloadWorker {
    /// Construct the worker over its collaborators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        client: Arc<dyn TorrentClient>,
        archive: Arc<dyn ArchiveTools>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            orchestrator,
            client,
            archive,
            settings,
        }
    }

    async fn process_item(&self, item: ProcessingItem) -> Result<(), StageError> {
        match item.status {
            ItemStatus::Found => self.start_download(item).await,
            ItemStatus::Downloading => self.monitor_download(item).await,
            other => {
                debug!(item_id = %item.id, status = %other, "download worker skipping item");
                Ok(())
            }
        }
    }

    async fn start_download(&self, item: ProcessingItem) -> Result<(), StageError> {
        let search = item.step_context.search.clone().unwrap_or_default();

        // Adopt a torrent that already exists in the client.
        if let Some(existing) = search.existing_download {
            let hash = existing.torrent_hash;
            let snapshot = self
                .client
                .progress(&hash)
                .await
                .map_err(|err| client_error(&err))?
                .ok_or_else(|| {
                    StageError::new(ErrorKind::NotFound, "adopted torrent missing from client")
                })?;
            self.ensure_download_record(&item, &hash, None, &snapshot)
                .await?;
            if snapshot.is_complete {
                return self.complete_download(&item, &hash, &snapshot).await;
            }
            self.begin_monitoring(&item, &hash, &snapshot).await?;
            return Ok(());
        }

        let release = search
            .selected_release
            .or_else(|| search.selected_packs.into_iter().next())
            .ok_or_else(|| {
                StageError::new(
                    ErrorKind::Validation,
                    "validation: no selected release to download",
                )
            })?;

        let added = self
            .client
            .add(&release)
            .await
            .map_err(|err| client_error(&err))?;
        info!(item_id = %item.id, hash = %added.hash, release = %release.title, "torrent admitted");

        let snapshot = self
            .client
            .progress(&added.hash)
            .await
            .map_err(|err| client_error(&err))?
            .unwrap_or_default();
        self.ensure_download_record(&item, &added.hash, Some(&release), &snapshot)
            .await?;
        self.begin_monitoring(&item, &added.hash, &snapshot).await?;
        Ok(())
    }

    async fn begin_monitoring(
        &self,
        item: &ProcessingItem,
        hash: &str,
        snapshot: &DownloadSnapshot,
    ) -> Result<(), StageError> {
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Downloading,
                TransitionPatch {
                    current_step: Some("downloading".to_owned()),
                    download_id: Some(hash.to_owned()),
                    progress: Some(clamp_progress(snapshot.progress)),
                    step_context: Some(StepContext {
                        download: Some(DownloadContext {
                            torrent_hash: Some(hash.to_owned()),
                            ..DownloadContext::default()
                        }),
                        ..StepContext::default()
                    }),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;
        Ok(())
    }

    async fn monitor_download(&self, item: ProcessingItem) -> Result<(), StageError> {
        let Some(hash) = item.download_id.clone() else {
            // Handle lost (e.g. crash before the write); the recovery worker
            // reconciles against the client's session list.
            return Err(StageError::new(
                ErrorKind::NotFound,
                "download handle missing",
            ));
        };

        let snapshot = self
            .client
            .progress(&hash)
            .await
            .map_err(|err| client_error(&err))?
            .ok_or_else(|| {
                StageError::new(ErrorKind::NotFound, "torrent missing from client")
            })?;

        if snapshot.is_complete {
            return self.complete_download(&item, &hash, &snapshot).await;
        }

        // Wall-clock timeout from the download record's admission time.
        if let Some(record) = self
            .orchestrator
            .download_by_hash(&hash)
            .await
            .map_err(to_stage_error)?
        {
            let elapsed = Utc::now() - record.created_at;
            if elapsed.to_std().unwrap_or_default() > self.settings.wall_timeout {
                return Err(StageError::new(
                    ErrorKind::Stalled,
                    "download stalled: wall-clock budget exhausted",
                ));
            }
        }

        let progress = clamp_progress(snapshot.progress);
        if progress.abs_diff(item.progress) >= 1 {
            self.orchestrator
                .update_progress(item.id, progress)
                .await
                .map_err(to_stage_error)?;
            return Ok(());
        }

        // No change; check the no-progress stall window.
        if let Some(last_update) = item.last_progress_update {
            let quiet = (Utc::now() - last_update).to_std().unwrap_or_default();
            if quiet > self.settings.stall_timeout {
                return Err(StageError::new(
                    ErrorKind::Stalled,
                    "download stalled: no progress within the stall window",
                ));
            }
        }
        Ok(())
    }

    async fn complete_download(
        &self,
        item: &ProcessingItem,
        hash: &str,
        snapshot: &DownloadSnapshot,
    ) -> Result<(), StageError> {
        // Adopted-complete payloads still route through `downloading` so the
        // state machine sees only legal edges.
        if item.status == ItemStatus::Found {
            self.begin_monitoring(item, hash, snapshot).await?;
        }

        let files = self
            .client
            .files(hash)
            .await
            .map_err(|err| client_error(&err))?;

        // RAR payloads are extracted in place before file selection.
        let content_root = snapshot
            .content_path
            .as_deref()
            .or(snapshot.save_path.as_deref());
        if let Some(root) = content_root {
            let root_path = std::path::Path::new(root);
            let rar = self
                .archive
                .detect_rar(root_path)
                .await
                .map_err(|err| StageError::from_message(err.to_string()))?;
            if let Some(archive_path) = rar {
                info!(item_id = %item.id, archive = %archive_path.display(), "extracting archive");
                self.archive
                    .extract_rar(&archive_path, root_path)
                    .await
                    .map_err(|err| StageError::from_message(err.to_string()))?;
            }
        }

        let mut resolved = {
            let mut probe = item.clone();
            probe.download_id = Some(hash.to_owned());
            resolve_source(&probe, &files, content_root, &self.archive)?
        };
        resolved.torrent_hash = Some(hash.to_owned());

        self.refresh_download_record(item, hash, snapshot).await?;
        info!(
            item_id = %item.id,
            source = resolved.source_file_path.as_deref().unwrap_or_default(),
            "download complete"
        );
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Downloaded,
                TransitionPatch {
                    current_step: Some("download_complete".to_owned()),
                    download_id: Some(hash.to_owned()),
                    progress: Some(100),
                    step_context: Some(StepContext {
                        download: Some(resolved),
                        ..StepContext::default()
                    }),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;
        Ok(())
    }

    async fn ensure_download_record(
        &self,
        item: &ProcessingItem,
        hash: &str,
        release: Option<&Release>,
        snapshot: &DownloadSnapshot,
    ) -> Result<(), StageError> {
        let existing = self
            .orchestrator
            .download_by_hash(hash)
            .await
            .map_err(to_stage_error)?;
        if existing.is_some() {
            return Ok(());
        }
        let name = release.map_or_else(|| item.title.clone(), |release| release.title.clone());
        let record = DownloadRecord {
            id: Uuid::new_v4(),
            request_id: item.request_id,
            torrent_hash: hash.to_owned(),
            torrent_name: name,
            progress: clamp_progress(snapshot.progress),
            save_path: snapshot.save_path.clone(),
            content_path: snapshot.content_path.clone(),
            created_at: Utc::now(),
            completed_at: snapshot.is_complete.then(Utc::now),
        };
        self.orchestrator
            .record_download(&record)
            .await
            .map_err(to_stage_error)
    }

    async fn refresh_download_record(
        &self,
        item: &ProcessingItem,
        hash: &str,
        snapshot: &DownloadSnapshot,
    ) -> Result<(), StageError> {
        let record = self
            .orchestrator
            .download_by_hash(hash)
            .await
            .map_err(to_stage_error)?;
        let mut record = match record {
            Some(record) => record,
            None => DownloadRecord {
                id: Uuid::new_v4(),
                request_id: item.request_id,
                torrent_hash: hash.to_owned(),
                torrent_name: item.title.clone(),
                progress: 0,
                save_path: None,
                content_path: None,
                created_at: Utc::now(),
                completed_at: None,
            },
        };
        record.progress = 100;
        record.save_path = snapshot.save_path.clone();
        record.content_path = snapshot.content_path.clone();
        record.completed_at.get_or_insert_with(Utc::now);
        self.orchestrator
            .record_download(&record)
            .await
            .map_err(to_stage_error)
    }
}

#[async_trait]
impl StageWorker for DownloadWorker {
    fn name(&self) -> &'static str {
        "download"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.worker.poll_interval
    }

    async fn process_batch(&self) -> anyhow::Result<BatchStats> {
        let mut items = self
            .orchestrator
            .items_for_processing(ItemStatus::Found)
            .await?;
        items.extend(
            self.orchestrator
                .items_for_processing(ItemStatus::Downloading)
                .await?,
        );
        Ok(dispatch_items(
            &self.orchestrator,
            "download",
            items,
            self.settings.worker.max_concurrent_items,
            |item| self.process_item(item),
        )
        .await)
    }
}

fn clamp_progress(progress: f64) -> u8 {
    if !progress.is_finite() || progress <= 0.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        progress.round().min(100.0) as u8
    }
}

fn client_error(err: &anyhow::Error) -> StageError {
    let message = err.to_string();
    StageError::for_service(classify_message(&message), message, "torrent_client")
}

fn to_stage_error(err: fetcharr_pipeline::PipelineError) -> StageError {
    StageError::new(ErrorKind::Unknown, err.to_string())
}
