//! Stage workers: one scheduled actor per pipeline stage plus recovery.
//!
//! Workers share one contract: claim eligible items for their input statuses,
//! process each under a bounded concurrency, and route every raised
//! [`StageError`] through the orchestrator. Workers never write status
//! directly.

mod deliver;
mod download;
mod encode;
mod recovery;
mod search;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use fetcharr_pipeline::adapters::{ArchiveTools, TorrentFileEntry};
use fetcharr_pipeline::context::{DownloadContext, EpisodeFile};
use fetcharr_pipeline::media;
use fetcharr_pipeline::model::{ItemKind, ProcessingItem};
use fetcharr_pipeline::retry::{ErrorKind, StageError};
use futures::StreamExt;
use tracing::warn;
use uuid::Uuid;

pub use deliver::DeliverWorker;
pub use download::DownloadWorker;
pub use encode::EncodeWorker;
pub use recovery::RecoveryWorker;
pub use search::SearchWorker;

use crate::orchestrator::Orchestrator;

/// Counters reported by one batch invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    /// Items claimed for the batch.
    pub claimed: usize,
    /// Items processed without error.
    pub succeeded: usize,
    /// Items whose stage raised an error (routed through the retry policy).
    pub failed: usize,
}

/// A scheduled pipeline actor.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Stable worker name used in scheduling state and logs.
    fn name(&self) -> &'static str;

    /// How often the scheduler invokes [`StageWorker::process_batch`].
    fn poll_interval(&self) -> std::time::Duration;

    /// Claim and process one batch of items.
    async fn process_batch(&self) -> anyhow::Result<BatchStats>;
}

/// Fan a batch of items out to `process` under `limit` concurrency, routing
/// raised stage errors through [`Orchestrator::handle_error`].
pub(crate) async fn dispatch_items<F, Fut>(
    orchestrator: &Orchestrator,
    worker: &'static str,
    items: Vec<ProcessingItem>,
    limit: usize,
    process: F,
) -> BatchStats
where
    F: Fn(ProcessingItem) -> Fut,
    Fut: Future<Output = Result<(), StageError>>,
{
    let claimed = items.len();
    let results: Vec<(Uuid, Result<(), StageError>)> = futures::stream::iter(items)
        .map(|item| {
            let id = item.id;
            let fut = process(item);
            async move { (id, fut.await) }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    let mut stats = BatchStats {
        claimed,
        ..BatchStats::default()
    };
    for (item_id, result) in results {
        match result {
            Ok(()) => stats.succeeded += 1,
            Err(error) => {
                stats.failed += 1;
                if let Err(err) = orchestrator.handle_error(item_id, error).await {
                    warn!(
                        worker,
                        item_id = %item_id,
                        error = %err,
                        "failed to route stage error through the orchestrator"
                    );
                }
            }
        }
    }
    stats
}

/// Resolve the download source for an item from a completed payload.
///
/// Movie items take the main video file; episode items locate their own
/// `SxxEyy` file inside the payload. Paths are rooted at `content_root`.
pub(crate) fn resolve_source(
    item: &ProcessingItem,
    files: &[TorrentFileEntry],
    content_root: Option<&str>,
    archive: &Arc<dyn ArchiveTools>,
) -> Result<DownloadContext, StageError> {
    let join = |name: &str| -> String {
        content_root.map_or_else(
            || name.to_owned(),
            |root| format!("{}/{}", root.trim_end_matches('/'), name),
        )
    };

    match item.kind {
        ItemKind::Movie => {
            let main = media::select_main_video(files, |name| archive.is_sample_file(name))
                .ok_or_else(|| {
                    StageError::new(ErrorKind::NotFound, "no main video file found in payload")
                })?;
            Ok(DownloadContext {
                torrent_hash: item.download_id.clone(),
                source_file_path: Some(join(&main.name)),
                episode_files: Vec::new(),
                is_complete: true,
            })
        }
        ItemKind::Episode => {
            let season = item.season.unwrap_or_default();
            let episode = item.episode.unwrap_or_default();
            let file = media::find_episode_file(files, season, episode, |name| {
                archive.is_sample_file(name)
            })
            .ok_or_else(|| {
                StageError::new(
                    ErrorKind::NotFound,
                    format!("episode S{season:02}E{episode:02} not found in payload"),
                )
            })?;
            let path = join(&file.name);
            Ok(DownloadContext {
                torrent_hash: item.download_id.clone(),
                source_file_path: Some(path.clone()),
                episode_files: vec![EpisodeFile {
                    season,
                    episode,
                    path,
                    size_bytes: file.size_bytes,
                    episode_item_id: Some(item.id),
                }],
                is_complete: true,
            })
        }
    }
}
