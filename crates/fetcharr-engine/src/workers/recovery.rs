//! Recovery worker: reconciles items stranded in `downloading` after a crash
//! against the torrent client's session list.
//!
//! Encoding recovery needs no dedicated worker; the encode worker's
//! early-exit probes adopt finished assignments and pre-existing artifacts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::adapters::{ArchiveTools, RemoteTorrent, TorrentClient};
use fetcharr_pipeline::context::StepContext;
use fetcharr_pipeline::media;
use fetcharr_pipeline::model::ProcessingItem;
use fetcharr_pipeline::retry::{ErrorKind, StageError, classify_message};
use tracing::{debug, info};

use crate::orchestrator::{Orchestrator, TransitionPatch};
use crate::settings::WorkerSettings;
use crate::workers::{BatchStats, StageWorker, dispatch_items, resolve_source};

/// Re-attaches orphaned downloads by fuzzy-matching client session names.
pub struct RecoveryWorker {
    orchestrator: Arc<Orchestrator>,
    client: Arc<dyn TorrentClient>,
    archive: Arc<dyn ArchiveTools>,
    settings: WorkerSettings,
}

impl RecoveryWorker {
    /// Construct the worker over its collaborators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        client: Arc<dyn TorrentClient>,
        archive: Arc<dyn ArchiveTools>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            orchestrator,
            client,
            archive,
            settings,
        }
    }

    async fn process_item(&self, item: ProcessingItem) -> Result<(), StageError> {
        // A handle that still resolves needs no recovery.
        if let Some(hash) = item.download_id.as_deref() {
            let known = self
                .client
                .progress(hash)
                .await
                .map_err(|err| client_error(&err))?;
            if known.is_some() {
                return Ok(());
            }
        }

        let Some(release_title) = selected_release_title(&item) else {
            debug!(item_id = %item.id, "no release recorded; cannot match a session");
            return Ok(());
        };

        let torrents = self
            .client
            .all_torrents()
            .await
            .map_err(|err| client_error(&err))?;
        let Some(matched) = best_match(&release_title, &torrents) else {
            debug!(item_id = %item.id, release = %release_title, "no matching session found");
            return Ok(());
        };

        info!(
            item_id = %item.id,
            hash = %matched.hash,
            session = %matched.name,
            "recovered orphaned download"
        );

        if matched.is_complete {
            let files = self
                .client
                .files(&matched.hash)
                .await
                .map_err(|err| client_error(&err))?;
            let mut probe = item.clone();
            probe.download_id = Some(matched.hash.clone());
            let mut resolved =
                resolve_source(&probe, &files, matched.content_path.as_deref(), &self.archive)?;
            resolved.torrent_hash = Some(matched.hash.clone());
            self.orchestrator
                .transition(
                    item.id,
                    ItemStatus::Downloaded,
                    TransitionPatch {
                        current_step: Some("recovered".to_owned()),
                        download_id: Some(matched.hash.clone()),
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
        } else {
            // Re-attach the handle; the download worker resumes monitoring.
            self.orchestrator
                .transition(
                    item.id,
                    ItemStatus::Downloading,
                    TransitionPatch {
                        current_step: Some("recovered_incomplete".to_owned()),
                        download_id: Some(matched.hash.clone()),
                        ..TransitionPatch::default()
                    },
                )
                .await
                .map_err(to_stage_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageWorker for RecoveryWorker {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    async fn process_batch(&self) -> anyhow::Result<BatchStats> {
        // Gated items are swept too: recovery repairs handles, it does not
        // consume retry budget.
        let items = self
            .orchestrator
            .items_with_status(ItemStatus::Downloading)
            .await?;
        Ok(dispatch_items(
            &self.orchestrator,
            "recovery",
            items,
            self.settings.max_concurrent_items,
            |item| self.process_item(item),
        )
        .await)
    }
}

fn selected_release_title(item: &ProcessingItem) -> Option<String> {
    let search = item.step_context.search.as_ref()?;
    search
        .selected_release
        .as_ref()
        .map(|release| release.title.clone())
        .or_else(|| {
            search
                .selected_packs
                .first()
                .map(|release| release.title.clone())
        })
}

/// First session whose normalised name shares at least the recovery threshold
/// of the release's significant words.
fn best_match<'a>(release_title: &str, torrents: &'a [RemoteTorrent]) -> Option<&'a RemoteTorrent> {
    torrents.iter().find(|torrent| {
        media::name_similarity(release_title, &torrent.name) >= media::RECOVERY_MATCH_THRESHOLD
    })
}

fn client_error(err: &anyhow::Error) -> StageError {
    let message = err.to_string();
    StageError::for_service(classify_message(&message), message, "torrent_client")
}

fn to_stage_error(err: fetcharr_pipeline::PipelineError) -> StageError {
    StageError::new(ErrorKind::Unknown, err.to_string())
}
