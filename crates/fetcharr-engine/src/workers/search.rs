//! Search worker: `pending` → `found`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::adapters::{Indexer, MovieQuery, SeasonQuery, TorrentClient};
use fetcharr_pipeline::context::{ExistingDownload, SearchContext, StepContext};
use fetcharr_pipeline::media;
use fetcharr_pipeline::model::{MediaRequest, MediaType, ProcessingItem, Release, Resolution};
use fetcharr_pipeline::retry::{ErrorKind, StageError, classify_message};
use tracing::{debug, info};

use crate::orchestrator::{Orchestrator, TransitionPatch};
use crate::settings::WorkerSettings;
use crate::workers::{BatchStats, StageWorker, dispatch_items};

const ALTERNATIVES_LIMIT: usize = 5;

/// Queries indexers (or adopts an existing torrent) and selects a release.
pub struct SearchWorker {
    orchestrator: Arc<Orchestrator>,
    indexer: Arc<dyn Indexer>,
    client: Arc<dyn TorrentClient>,
    settings: WorkerSettings,
}

impl SearchWorker {
    /// Construct the worker over its collaborators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        indexer: Arc<dyn Indexer>,
        client: Arc<dyn TorrentClient>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            orchestrator,
            indexer,
            client,
            settings,
        }
    }

    async fn process_item(&self, item: ProcessingItem) -> Result<(), StageError> {
        // An item that already owns a download handle skips the search
        // entirely; the download worker adopts the torrent.
        if let Some(download_id) = item.download_id.clone() {
            self.orchestrator
                .transition(
                    item.id,
                    ItemStatus::Searching,
                    TransitionPatch {
                        current_step: Some("search_skipped".to_owned()),
                        ..TransitionPatch::default()
                    },
                )
                .await
                .map_err(to_stage_error)?;
            self.orchestrator
                .transition(
                    item.id,
                    ItemStatus::Found,
                    TransitionPatch {
                        current_step: Some("search_skipped".to_owned()),
                        step_context: Some(StepContext {
                            search: Some(SearchContext {
                                existing_download: Some(ExistingDownload {
                                    torrent_hash: download_id,
                                    is_complete: false,
                                }),
                                skipped_search: true,
                                ..SearchContext::default()
                            }),
                            ..StepContext::default()
                        }),
                        ..TransitionPatch::default()
                    },
                )
                .await
                .map_err(to_stage_error)?;
            return Ok(());
        }

        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Searching,
                TransitionPatch {
                    current_step: Some("searching".to_owned()),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;

        let request = self
            .orchestrator
            .request(item.request_id)
            .await
            .map_err(to_stage_error)?;
        let required = request.required_resolution();

        // Movies can reuse a torrent already present in the client.
        if request.media_type == MediaType::Movie
            && let Some(existing) = self.find_existing_torrent(&item, required).await?
        {
            info!(item_id = %item.id, hash = %existing.torrent_hash, "adopting existing torrent");
            self.orchestrator
                .transition(
                    item.id,
                    ItemStatus::Found,
                    TransitionPatch {
                        current_step: Some("existing_download".to_owned()),
                        step_context: Some(StepContext {
                            search: Some(SearchContext {
                                existing_download: Some(existing),
                                quality_met: Some(true),
                                ..SearchContext::default()
                            }),
                            ..StepContext::default()
                        }),
                        ..TransitionPatch::default()
                    },
                )
                .await
                .map_err(to_stage_error)?;
            return Ok(());
        }

        let releases = self.query_indexer(&item, &request).await?;
        let candidates = candidate_releases(&item, &request, releases);
        if candidates.is_empty() {
            return Err(StageError::new(
                ErrorKind::NotFound,
                "no releases found for item",
            ));
        }

        let (mut matching, below): (Vec<Release>, Vec<Release>) = candidates
            .into_iter()
            .partition(|release| meets_quality(release, required));

        if matching.is_empty() {
            // Quality unavailable: surface the alternatives and hold the item
            // for operator choice; no automatic retry.
            debug!(item_id = %item.id, "no release meets the quality requirement");
            self.orchestrator
                .update_context(
                    item.id,
                    StepContext {
                        search: Some(SearchContext {
                            alternative_releases: below,
                            quality_met: Some(false),
                            ..SearchContext::default()
                        }),
                        ..StepContext::default()
                    },
                    Some("quality_unavailable".to_owned()),
                )
                .await
                .map_err(to_stage_error)?;
            return Ok(());
        }

        rank_releases(&mut matching);
        let selected = matching.remove(0);
        matching.truncate(ALTERNATIVES_LIMIT);

        let is_pack = request.media_type == MediaType::Tv && media::is_season_pack(&selected.title);
        let search = SearchContext {
            selected_release: (!is_pack).then(|| selected.clone()),
            selected_packs: is_pack.then(|| vec![selected.clone()]).unwrap_or_default(),
            alternative_releases: matching,
            quality_met: Some(true),
            ..SearchContext::default()
        };

        info!(item_id = %item.id, release = %selected.title, "release selected");
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Found,
                TransitionPatch {
                    current_step: Some("release_selected".to_owned()),
                    step_context: Some(StepContext {
                        search: Some(search),
                        ..StepContext::default()
                    }),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;
        Ok(())
    }

    async fn find_existing_torrent(
        &self,
        item: &ProcessingItem,
        required: Option<Resolution>,
    ) -> Result<Option<ExistingDownload>, StageError> {
        let torrents = self
            .client
            .all_torrents()
            .await
            .map_err(|err| service_error("torrent_client", &err))?;

        let wanted = item.year.map_or_else(
            || media::normalize_name(&item.title),
            |year| format!("{} {year}", media::normalize_name(&item.title)),
        );
        for torrent in torrents {
            let name = media::normalize_name(&torrent.name);
            if !name.contains(&wanted) {
                continue;
            }
            if !meets_quality_name(&torrent.name, required) {
                continue;
            }
            return Ok(Some(ExistingDownload {
                torrent_hash: torrent.hash,
                is_complete: torrent.is_complete,
            }));
        }
        Ok(None)
    }

    async fn query_indexer(
        &self,
        item: &ProcessingItem,
        request: &MediaRequest,
    ) -> Result<Vec<Release>, StageError> {
        let response = match request.media_type {
            MediaType::Movie => {
                self.indexer
                    .search_movie(&MovieQuery {
                        catalog_id: request.catalog_id,
                        external_id: request.external_id.clone(),
                        title: request.title.clone(),
                        year: request.year,
                    })
                    .await
            }
            MediaType::Tv => {
                self.indexer
                    .search_tv_season(&SeasonQuery {
                        catalog_id: request.catalog_id,
                        external_id: request.external_id.clone(),
                        title: request.title.clone(),
                        year: request.year,
                        season: item.season.unwrap_or_default(),
                    })
                    .await
            }
        }
        .map_err(|err| service_error("indexer", &err))?;

        debug!(
            item_id = %item.id,
            releases = response.releases.len(),
            queried = response.indexers_queried,
            failed = response.indexers_failed,
            "indexer sweep complete"
        );
        Ok(response.releases)
    }

    fn name_static() -> &'static str {
        "search"
    }
}

#[async_trait]
impl StageWorker for SearchWorker {
    fn name(&self) -> &'static str {
        Self::name_static()
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    async fn process_batch(&self) -> anyhow::Result<BatchStats> {
        let items = self
            .orchestrator
            .items_for_processing(ItemStatus::Pending)
            .await?;
        Ok(dispatch_items(
            &self.orchestrator,
            Self::name_static(),
            items,
            self.settings.max_concurrent_items,
            |item| self.process_item(item),
        )
        .await)
    }
}

/// Filter a sweep's releases down to the candidates relevant for this item:
/// movies take everything; episode items prefer season packs, falling back to
/// individual-episode releases.
fn candidate_releases(
    item: &ProcessingItem,
    request: &MediaRequest,
    releases: Vec<Release>,
) -> Vec<Release> {
    if request.media_type == MediaType::Movie {
        return releases;
    }
    let season = item.season.unwrap_or_default();
    let episode = item.episode.unwrap_or_default();
    let (packs, individual): (Vec<Release>, Vec<Release>) = releases
        .into_iter()
        .partition(|release| media::is_season_pack(&release.title));
    let individual: Vec<Release> = individual
        .into_iter()
        .filter(|release| media::matches_episode(&release.title, season, episode))
        .collect();
    if packs.is_empty() { individual } else { packs }
}

fn release_resolution(release: &Release) -> Option<Resolution> {
    release
        .resolution
        .or_else(|| media::detect_resolution(&release.title))
}

fn meets_quality(release: &Release, required: Option<Resolution>) -> bool {
    match required {
        None => true,
        Some(required) => release_resolution(release).is_some_and(|found| found >= required),
    }
}

fn meets_quality_name(name: &str, required: Option<Resolution>) -> bool {
    match required {
        None => true,
        Some(required) => media::detect_resolution(name).is_some_and(|found| found >= required),
    }
}

/// Rank by resolution preference, then seeders, then size.
fn rank_releases(releases: &mut [Release]) {
    releases.sort_by(|a, b| {
        release_resolution(b)
            .cmp(&release_resolution(a))
            .then_with(|| b.seeders.cmp(&a.seeders))
            .then_with(|| b.size_bytes.cmp(&a.size_bytes))
    });
}

fn service_error(service: &str, err: &anyhow::Error) -> StageError {
    let message = err.to_string();
    StageError::for_service(classify_message(&message), message, service)
}

fn to_stage_error(err: fetcharr_pipeline::PipelineError) -> StageError {
    StageError::new(ErrorKind::Unknown, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(title: &str, seeders: u32, size_bytes: u64) -> Release {
        Release {
            title: title.to_owned(),
            size_bytes,
            seeders,
            leechers: 0,
            indexer: "test".to_owned(),
            magnet_uri: "magnet:?xt=urn:btih:t".to_owned(),
            publish_date: None,
            resolution: None,
        }
    }

    #[test]
    fn ranking_prefers_resolution_then_seeders_then_size() {
        let mut releases = vec![
            release("Movie.720p", 500, 1_000),
            release("Movie.1080p", 10, 900),
            release("Movie.1080p.Remux", 10, 2_000),
            release("Movie.1080p.Popular", 90, 800),
        ];
        rank_releases(&mut releases);
        assert_eq!(releases[0].title, "Movie.1080p.Popular");
        assert_eq!(releases[1].title, "Movie.1080p.Remux");
        assert_eq!(releases[3].title, "Movie.720p");
    }

    #[test]
    fn quality_predicate_compares_resolutions() {
        let hd = release("Movie.1080p", 1, 1);
        assert!(meets_quality(&hd, None));
        assert!(meets_quality(&hd, Some(Resolution::Hd1080)));
        assert!(meets_quality(&hd, Some(Resolution::Hd720)));
        assert!(!meets_quality(&hd, Some(Resolution::Uhd2160)));

        let unknown = release("Movie.DVDRip", 1, 1);
        assert!(!meets_quality(&unknown, Some(Resolution::Hd720)));
        assert!(meets_quality(&unknown, None));
    }
}
