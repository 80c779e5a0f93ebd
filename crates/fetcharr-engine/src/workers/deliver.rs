//! Deliver worker: `encoded` → `completed`.
//!
//! Diverges from the common worker shape: one item fans out to N storage
//! servers with partial success allowed, per-server concurrency caps, and a
//! persistent checkpoint so retries never re-deliver a server. Transfers run
//! as spawned tasks tracked in worker-owned maps; every tick first collects
//! settled transfers, then starts new ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::adapters::{
    DeliveryTransport, LibraryEntry, LibraryIndex, TransferProgress,
};
use fetcharr_pipeline::context::{DeliveryResults, EncodedFile, StepContext};
use fetcharr_pipeline::model::{DeliveryTarget, ItemKind, MediaType, ProcessingItem};
use fetcharr_pipeline::naming;
use fetcharr_pipeline::retry::{ErrorKind, StageError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, TransitionPatch};
use crate::settings::DeliverSettings;
use crate::workers::{BatchStats, StageWorker};

type DeliveryKey = (Uuid, Uuid);

struct ActiveDelivery {
    handle: JoinHandle<Result<(), String>>,
    server_id: Uuid,
    server_name: String,
    dst: PathBuf,
}

/// Streams encoded artifacts to their target servers.
pub struct DeliverWorker {
    orchestrator: Arc<Orchestrator>,
    transport: Arc<dyn DeliveryTransport>,
    library: Arc<dyn LibraryIndex>,
    settings: DeliverSettings,
    active: Mutex<HashMap<DeliveryKey, ActiveDelivery>>,
    throughput: Arc<Mutex<HashMap<DeliveryKey, TransferProgress>>>,
}

impl DeliverWorker {
    /// Construct the worker over its collaborators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        transport: Arc<dyn DeliveryTransport>,
        library: Arc<dyn LibraryIndex>,
        settings: DeliverSettings,
    ) -> Self {
        Self {
            orchestrator,
            transport,
            library,
            settings,
            active: Mutex::new(HashMap::new()),
            throughput: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Transfers currently in flight for a server.
    fn active_count_for(&self, server_id: Uuid) -> usize {
        self.active
            .lock()
            .map(|active| {
                active
                    .values()
                    .filter(|delivery| delivery.server_id == server_id)
                    .count()
            })
            .unwrap_or(0)
    }

    fn take_settled(&self) -> Vec<(DeliveryKey, ActiveDelivery)> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let keys: Vec<DeliveryKey> = active
            .iter()
            .filter(|(_, delivery)| delivery.handle.is_finished())
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| active.remove(&key).map(|delivery| (key, delivery)))
            .collect()
    }

    async fn collect_settled(&self) {
        for ((item_id, server_id), delivery) in self.take_settled() {
            if let Ok(mut throughput) = self.throughput.lock() {
                throughput.remove(&(item_id, server_id));
            }
            let outcome = match delivery.handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(format!("delivery task panicked: {err}")),
            };

            let succeeded = outcome.is_ok();
            match self
                .orchestrator
                .record_delivery_outcome(item_id, server_id, &delivery.server_name, outcome)
                .await
            {
                Ok(item) => {
                    if succeeded {
                        info!(
                            item_id = %item_id,
                            server = %delivery.server_name,
                            dst = %delivery.dst.display(),
                            "delivery complete"
                        );
                        self.index_artifact(&item, server_id, &delivery.dst).await;
                        if let Err(err) = self.try_complete(&item).await {
                            warn!(item_id = %item_id, error = %err, "completion check failed");
                        }
                    } else {
                        debug!(
                            item_id = %item_id,
                            server = %delivery.server_name,
                            "delivery failed; checkpoint retains the server for retry"
                        );
                    }
                }
                Err(err) => {
                    warn!(item_id = %item_id, error = %err, "failed to record delivery outcome");
                }
            }
        }
    }

    async fn index_artifact(&self, item: &ProcessingItem, server_id: Uuid, dst: &Path) {
        let media_type = match item.kind {
            ItemKind::Movie => MediaType::Movie,
            ItemKind::Episode => MediaType::Tv,
        };
        let entry = LibraryEntry {
            catalog_id: item.catalog_id,
            media_type,
            server_id,
            title: item.title.clone(),
            year: item.year,
            season: item.season,
            episode: item.episode,
            path: dst.to_string_lossy().into_owned(),
        };
        if let Err(err) = self.library.upsert(&entry).await {
            warn!(item_id = %item.id, error = %err, "library index upsert failed");
        }
    }

    /// Promote the item to `completed` once the checkpoint covers every
    /// target server.
    async fn try_complete(&self, item: &ProcessingItem) -> anyhow::Result<()> {
        let Some(encoded) = primary_artifact(item) else {
            return Ok(());
        };
        let targets = self.targets_for(item, &encoded).await?;
        let target_ids: Vec<Uuid> = targets.iter().map(|t| t.server_id).collect();
        if target_ids.is_empty() || !item.checkpoint.covers(&target_ids) {
            return Ok(());
        }

        let results = DeliveryResults {
            delivered_servers: item
                .checkpoint
                .delivered
                .iter()
                .map(|entry| entry.server_id)
                .collect(),
            failed_servers: item
                .checkpoint
                .failed
                .iter()
                .map(|entry| entry.server_id)
                .collect(),
            all_deliveries_complete: true,
        };
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Completed,
                TransitionPatch {
                    current_step: Some("delivered".to_owned()),
                    progress: Some(100),
                    step_context: Some(StepContext {
                        delivery_results: Some(results),
                        ..StepContext::default()
                    }),
                    ..TransitionPatch::default()
                },
            )
            .await?;

        // The encoded artifact is retained unless cleanup is opted in.
        if self.settings.cleanup_encoded {
            if let Err(err) = tokio::fs::remove_file(&encoded.path).await {
                warn!(item_id = %item.id, error = %err, "failed to clean up encoded artifact");
            }
        } else {
            debug!(item_id = %item.id, path = %encoded.path, "retaining encoded artifact");
        }
        Ok(())
    }

    async fn targets_for(
        &self,
        item: &ProcessingItem,
        encoded: &EncodedFile,
    ) -> anyhow::Result<Vec<DeliveryTarget>> {
        let request = self.orchestrator.request(item.request_id).await?;
        let targets = if encoded.target_server_ids.is_empty() {
            request.targets
        } else {
            request
                .targets
                .into_iter()
                .filter(|target| encoded.target_server_ids.contains(&target.server_id))
                .collect()
        };
        Ok(targets)
    }

    async fn pump_item(&self, item: ProcessingItem) -> Result<(), StageError> {
        let Some(encoded) = primary_artifact(&item) else {
            return Err(StageError::new(
                ErrorKind::Validation,
                "validation: no encoded artifact recorded for delivery",
            ));
        };
        let targets = self
            .targets_for(&item, &encoded)
            .await
            .map_err(|err| StageError::new(ErrorKind::Unknown, err.to_string()))?;

        // A delivering item whose checkpoint already covers every target
        // (e.g. the completion transition was interrupted) is promoted here.
        if item.status == ItemStatus::Delivering {
            self.try_complete(&item)
                .await
                .map_err(|err| StageError::new(ErrorKind::Unknown, err.to_string()))?;
        }

        let mut item = item;
        for target in targets {
            if item.checkpoint.is_delivered(target.server_id) {
                continue;
            }
            let key = (item.id, target.server_id);
            if self
                .active
                .lock()
                .map(|active| active.contains_key(&key))
                .unwrap_or(true)
            {
                continue;
            }
            let cap = target
                .max_concurrent
                .unwrap_or(self.settings.concurrency_per_server);
            if self.active_count_for(target.server_id) >= cap {
                debug!(
                    item_id = %item.id,
                    server = %target.server_name,
                    cap,
                    "per-server delivery cap reached; deferring"
                );
                continue;
            }

            if item.status != ItemStatus::Delivering {
                item = self
                    .orchestrator
                    .transition(
                        item.id,
                        ItemStatus::Delivering,
                        TransitionPatch {
                            current_step: Some(format!(
                                "delivering to {}",
                                target.server_name
                            )),
                            ..TransitionPatch::default()
                        },
                    )
                    .await
                    .map_err(|err| StageError::new(ErrorKind::Unknown, err.to_string()))?;
            }

            self.spawn_delivery(&item, &encoded, &target);
        }
        Ok(())
    }

    fn spawn_delivery(&self, item: &ProcessingItem, encoded: &EncodedFile, target: &DeliveryTarget) {
        let key = (item.id, target.server_id);
        let src = PathBuf::from(&encoded.path);
        let dst = destination_path(item, encoded, target);
        let transport = Arc::clone(&self.transport);
        let server_id = target.server_id;
        let throughput = Arc::clone(&self.throughput);
        let sink: fetcharr_pipeline::adapters::ProgressSink = Arc::new(move |progress| {
            if let Ok(mut map) = throughput.lock() {
                map.insert(key, progress);
            }
        });

        info!(
            item_id = %item.id,
            server = %target.server_name,
            dst = %dst.display(),
            "starting delivery"
        );
        let task_dst = dst.clone();
        let handle = tokio::spawn(async move {
            match transport
                .deliver(server_id, &src, &task_dst, Some(sink))
                .await
            {
                Ok(receipt) if receipt.success => Ok(()),
                Ok(receipt) => Err(receipt
                    .error
                    .unwrap_or_else(|| "transfer failed".to_owned())),
                Err(err) => Err(err.to_string()),
            }
        });

        if let Ok(mut active) = self.active.lock() {
            active.insert(
                key,
                ActiveDelivery {
                    handle,
                    server_id,
                    server_name: target.server_name.clone(),
                    dst,
                },
            );
        }
    }

    fn in_flight(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StageWorker for DeliverWorker {
    fn name(&self) -> &'static str {
        "deliver"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    async fn process_batch(&self) -> anyhow::Result<BatchStats> {
        self.collect_settled().await;

        let mut items = self
            .orchestrator
            .items_for_processing(ItemStatus::Encoded)
            .await?;
        items.extend(
            self.orchestrator
                .items_for_processing(ItemStatus::Delivering)
                .await?,
        );

        let mut stats = BatchStats {
            claimed: items.len(),
            ..BatchStats::default()
        };
        for item in items {
            let item_id = item.id;
            match self.pump_item(item).await {
                Ok(()) => stats.succeeded += 1,
                Err(error) => {
                    stats.failed += 1;
                    if let Err(err) = self.orchestrator.handle_error(item_id, error).await {
                        warn!(item_id = %item_id, error = %err, "failed to route delivery error");
                    }
                }
            }
        }

        let in_flight = self.in_flight();
        self.orchestrator
            .metrics()
            .set_deliveries_in_flight(i64::try_from(in_flight).unwrap_or(i64::MAX));
        Ok(stats)
    }
}

fn primary_artifact(item: &ProcessingItem) -> Option<EncodedFile> {
    item.step_context
        .encode
        .as_ref()
        .and_then(|encode| encode.encoded_files.first())
        .cloned()
}

fn destination_path(
    item: &ProcessingItem,
    encoded: &EncodedFile,
    target: &DeliveryTarget,
) -> PathBuf {
    let root = Path::new(&target.root_path);
    let extension = Path::new(&encoded.path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mkv");
    match item.kind {
        ItemKind::Movie => naming::movie_path(
            root,
            &item.title,
            item.year,
            encoded.resolution,
            encoded.codec.as_deref(),
            extension,
        ),
        ItemKind::Episode => naming::episode_path(
            root,
            &item.title,
            item.season.unwrap_or_default(),
            item.episode.unwrap_or_default(),
            encoded.resolution,
            encoded.codec.as_deref(),
            extension,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetcharr_pipeline::model::Resolution;
    use fetcharr_test_support::{movie_request, tv_request};

    fn encoded_file() -> EncodedFile {
        EncodedFile {
            path: "/encoded/encoded_x.mkv".to_owned(),
            resolution: Some(Resolution::Hd1080),
            codec: Some("hevc".to_owned()),
            target_server_ids: Vec::new(),
            season: None,
            episode: None,
            size_bytes: None,
            compression_ratio: None,
        }
    }

    #[test]
    fn movie_destinations_follow_the_naming_convention() {
        let request = movie_request();
        let item = ProcessingItem::new(&request, ItemKind::Movie);
        let target = &request.targets[0];
        let dst = destination_path(&item, &encoded_file(), target);
        assert_eq!(
            dst,
            PathBuf::from(format!(
                "{}/Inception (2010)/Inception (2010) 1080p hevc.mkv",
                target.root_path
            ))
        );
    }

    #[test]
    fn episode_destinations_include_season_directories() {
        let request = tv_request();
        let mut item = ProcessingItem::new(&request, ItemKind::Episode);
        item.season = Some(1);
        item.episode = Some(3);
        let target = &request.targets[0];
        let dst = destination_path(&item, &encoded_file(), target);
        assert_eq!(
            dst,
            PathBuf::from(format!(
                "{}/The Wire/Season 01/The Wire - S01E03 1080p hevc.mkv",
                target.root_path
            ))
        );
    }
}
