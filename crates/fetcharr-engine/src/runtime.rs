//! Runtime bootstrap: wires the store, collaborators, event bus, metrics and
//! scheduler into a running pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use fetcharr_events::EventBus;
use fetcharr_pipeline::adapters::{
    ArchiveTools, DeliveryTransport, EncoderDispatcher, Indexer, LibraryIndex, TorrentClient,
};
use fetcharr_pipeline::store::PipelineStore;
use fetcharr_telemetry::Metrics;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::scheduler::{Scheduler, TaskStatus};
use crate::settings::EngineSettings;
use crate::workers::{
    DeliverWorker, DownloadWorker, EncodeWorker, RecoveryWorker, SearchWorker, StageWorker,
};

/// External collaborator implementations supplied by the host process.
#[derive(Clone)]
pub struct Collaborators {
    /// Release search across configured indexers.
    pub indexer: Arc<dyn Indexer>,
    /// Torrent client monitoring API.
    pub torrent_client: Arc<dyn TorrentClient>,
    /// Encoder pool dispatcher.
    pub encoder: Arc<dyn EncoderDispatcher>,
    /// Streaming transfer transport.
    pub transport: Arc<dyn DeliveryTransport>,
    /// Library index.
    pub library: Arc<dyn LibraryIndex>,
    /// Archive probing and extraction.
    pub archive: Arc<dyn ArchiveTools>,
}

/// A started pipeline: the orchestrator handle plus the running scheduler.
pub struct PipelineRuntime {
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
}

impl PipelineRuntime {
    /// Build the workers and start the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics registry cannot be constructed.
    pub async fn start(
        store: Arc<dyn PipelineStore>,
        collaborators: Collaborators,
        settings: EngineSettings,
        events: EventBus,
    ) -> Result<Self> {
        let metrics = Metrics::new().context("failed to build metrics registry")?;
        let orchestrator = Arc::new(Orchestrator::new(store, events, metrics));

        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::new(SearchWorker::new(
            Arc::clone(&orchestrator),
            Arc::clone(&collaborators.indexer),
            Arc::clone(&collaborators.torrent_client),
            settings.search.clone(),
        )) as Arc<dyn StageWorker>);
        scheduler.register(Arc::new(DownloadWorker::new(
            Arc::clone(&orchestrator),
            Arc::clone(&collaborators.torrent_client),
            Arc::clone(&collaborators.archive),
            settings.download.clone(),
        )) as Arc<dyn StageWorker>);
        scheduler.register(Arc::new(EncodeWorker::new(
            Arc::clone(&orchestrator),
            Arc::clone(&collaborators.encoder),
            settings.encode.clone(),
        )) as Arc<dyn StageWorker>);
        scheduler.register(Arc::new(DeliverWorker::new(
            Arc::clone(&orchestrator),
            Arc::clone(&collaborators.transport),
            Arc::clone(&collaborators.library),
            settings.deliver.clone(),
        )) as Arc<dyn StageWorker>);
        scheduler.register(Arc::new(RecoveryWorker::new(
            Arc::clone(&orchestrator),
            Arc::clone(&collaborators.torrent_client),
            Arc::clone(&collaborators.archive),
            settings.recovery.clone(),
        )) as Arc<dyn StageWorker>);

        scheduler.start().await;
        info!("pipeline runtime started");
        Ok(Self {
            orchestrator,
            scheduler,
        })
    }

    /// The orchestrator handle for façade calls.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Scheduling snapshot for every registered worker.
    pub async fn worker_status(&self) -> Vec<TaskStatus> {
        self.scheduler.status().await
    }

    /// Stop every worker loop and join them.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        info!("pipeline runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::NewRequest;
    use crate::settings::WorkerSettings;
    use fetcharr_events::ItemStatus;
    use fetcharr_pipeline::model::MediaType;
    use fetcharr_test_support::{
        MemoryStore, RecordingLibrary, RecordingTransport, StubArchive, StubDispatcher,
        StubIndexer, StubTorrentClient, movie_request, sample_release,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_settings(temp: &TempDir) -> EngineSettings {
        let worker = WorkerSettings {
            poll_interval: Duration::from_millis(20),
            max_concurrent_items: 3,
        };
        let mut settings = EngineSettings::standard(
            temp.path().join("encoded"),
            temp.path().join("encoded/tmp"),
        );
        settings.search = worker.clone();
        settings.download.worker = worker.clone();
        settings.encode.worker = worker.clone();
        settings.deliver.poll_interval = Duration::from_millis(20);
        settings.recovery = worker;
        settings
    }

    #[tokio::test]
    async fn runtime_schedules_workers_and_advances_items() {
        let temp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let indexer = Arc::new(StubIndexer::with_releases(vec![sample_release(
            "Inception.2010.1080p.BluRay.x264",
            2_254_857_830,
            120,
        )]));
        let collaborators = Collaborators {
            indexer: indexer as _,
            torrent_client: Arc::new(StubTorrentClient::with_next_hash("h1")) as _,
            encoder: Arc::new(StubDispatcher::with_encoders(1)) as _,
            transport: Arc::new(RecordingTransport::new()) as _,
            library: Arc::new(RecordingLibrary::default()) as _,
            archive: Arc::new(StubArchive::default()) as _,
        };

        let runtime = PipelineRuntime::start(
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            collaborators,
            fast_settings(&temp),
            EventBus::with_capacity(64),
        )
        .await
        .expect("runtime start");

        let fixture = movie_request();
        let (_, items) = runtime
            .orchestrator()
            .create_request(NewRequest {
                media_type: MediaType::Movie,
                catalog_id: fixture.catalog_id,
                external_id: fixture.external_id,
                title: fixture.title,
                year: fixture.year,
                targets: fixture.targets,
                pipeline: None,
                episodes: Vec::new(),
                max_attempts: None,
            })
            .await
            .expect("create request");
        let item_id = items[0].id;

        // The scheduled search and download workers advance the item on
        // their own ticks.
        let mut reached_downloading = false;
        for _ in 0..100 {
            let item = runtime.orchestrator().item(item_id).await.expect("item");
            if item.status == ItemStatus::Downloading {
                reached_downloading = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reached_downloading, "scheduler never advanced the item");

        let status = runtime.worker_status().await;
        assert_eq!(status.len(), 5);
        assert!(status.iter().any(|task| task.name == "search" && task.runs > 0));

        runtime.shutdown().await;
    }
}
