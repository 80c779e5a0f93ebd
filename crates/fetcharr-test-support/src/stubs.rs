//! Scriptable collaborator stubs.
//!
//! Each stub records the calls it receives behind a `tokio::sync::RwLock` so
//! tests can assert on interactions after driving a worker tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use fetcharr_pipeline::adapters::{
    AddedTorrent, ArchiveTools, AssignmentStatus, DeliveryReceipt, DeliveryTransport,
    DownloadSnapshot, EncodeJob, EncoderAssignment, EncoderDispatcher, Indexer, IndexerResponse,
    LibraryEntry, LibraryIndex, MovieQuery, ProgressSink, RemoteTorrent, SeasonQuery,
    TorrentClient, TorrentFileEntry,
};
use fetcharr_pipeline::model::Release;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Indexer returning a fixed release set, or a scripted error.
#[derive(Default)]
pub struct StubIndexer {
    releases: RwLock<Vec<Release>>,
    error: RwLock<Option<String>>,
    /// Queries received, in order.
    pub queries: RwLock<Vec<String>>,
}

impl StubIndexer {
    /// Construct a stub answering every query with `releases`.
    #[must_use]
    pub fn with_releases(releases: Vec<Release>) -> Self {
        Self {
            releases: RwLock::new(releases),
            ..Self::default()
        }
    }

    /// Replace the release set.
    pub async fn set_releases(&self, releases: Vec<Release>) {
        *self.releases.write().await = releases;
    }

    /// Make every subsequent query fail with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.error.write().await = Some(message.into());
    }

    async fn respond(&self, query: String) -> anyhow::Result<IndexerResponse> {
        self.queries.write().await.push(query);
        if let Some(message) = self.error.read().await.clone() {
            bail!(message);
        }
        Ok(IndexerResponse {
            releases: self.releases.read().await.clone(),
            indexers_queried: 1,
            indexers_failed: 0,
        })
    }
}

#[async_trait]
impl Indexer for StubIndexer {
    async fn search_movie(&self, query: &MovieQuery) -> anyhow::Result<IndexerResponse> {
        self.respond(format!("movie:{}", query.title)).await
    }

    async fn search_tv_season(&self, query: &SeasonQuery) -> anyhow::Result<IndexerResponse> {
        self.respond(format!("tv:{}:s{}", query.title, query.season))
            .await
    }
}

/// Torrent client with scripted per-hash snapshots and file listings.
#[derive(Default)]
pub struct StubTorrentClient {
    next_hash: RwLock<String>,
    snapshots: RwLock<HashMap<String, DownloadSnapshot>>,
    files: RwLock<HashMap<String, Vec<TorrentFileEntry>>>,
    torrents: RwLock<Vec<RemoteTorrent>>,
    /// Releases admitted via `add`, in order.
    pub added: RwLock<Vec<Release>>,
}

impl StubTorrentClient {
    /// Construct an empty client whose next admitted hash is `hash`.
    #[must_use]
    pub fn with_next_hash(hash: impl Into<String>) -> Self {
        Self {
            next_hash: RwLock::new(hash.into()),
            ..Self::default()
        }
    }

    /// Set the hash assigned to the next admitted release.
    pub async fn set_next_hash(&self, hash: impl Into<String>) {
        *self.next_hash.write().await = hash.into();
    }

    /// Script the progress snapshot for a hash.
    pub async fn set_snapshot(&self, hash: impl Into<String>, snapshot: DownloadSnapshot) {
        self.snapshots.write().await.insert(hash.into(), snapshot);
    }

    /// Drop the snapshot for a hash, simulating a removed torrent.
    pub async fn forget(&self, hash: &str) {
        self.snapshots.write().await.remove(hash);
    }

    /// Script the payload file listing for a hash.
    pub async fn set_files(&self, hash: impl Into<String>, files: Vec<TorrentFileEntry>) {
        self.files.write().await.insert(hash.into(), files);
    }

    /// Script the full session listing returned by `all_torrents`.
    pub async fn set_torrents(&self, torrents: Vec<RemoteTorrent>) {
        *self.torrents.write().await = torrents;
    }
}

#[async_trait]
impl TorrentClient for StubTorrentClient {
    async fn add(&self, release: &Release) -> anyhow::Result<AddedTorrent> {
        self.added.write().await.push(release.clone());
        let hash = self.next_hash.read().await.clone();
        if hash.is_empty() {
            bail!("no hash scripted for add");
        }
        Ok(AddedTorrent {
            hash,
            name: release.title.clone(),
        })
    }

    async fn progress(&self, hash: &str) -> anyhow::Result<Option<DownloadSnapshot>> {
        Ok(self.snapshots.read().await.get(hash).cloned())
    }

    async fn files(&self, hash: &str) -> anyhow::Result<Vec<TorrentFileEntry>> {
        Ok(self.files.read().await.get(hash).cloned().unwrap_or_default())
    }

    async fn all_torrents(&self) -> anyhow::Result<Vec<RemoteTorrent>> {
        Ok(self.torrents.read().await.clone())
    }
}

/// Encoder dispatcher with a controllable pool size and assignment map.
#[derive(Default)]
pub struct StubDispatcher {
    encoder_count: AtomicUsize,
    assignments: RwLock<HashMap<Uuid, EncoderAssignment>>,
    /// Jobs queued via `queue_job`, in order.
    pub queued: RwLock<Vec<EncodeJob>>,
}

impl StubDispatcher {
    /// Construct a dispatcher with `count` available encoders.
    #[must_use]
    pub fn with_encoders(count: usize) -> Self {
        let dispatcher = Self::default();
        dispatcher.encoder_count.store(count, Ordering::Relaxed);
        dispatcher
    }

    /// Change the available encoder count.
    pub fn set_encoder_count(&self, count: usize) {
        self.encoder_count.store(count, Ordering::Relaxed);
    }

    /// Overwrite (or seed) an assignment record.
    pub async fn set_assignment(&self, assignment: EncoderAssignment) {
        self.assignments
            .write()
            .await
            .insert(assignment.job_id, assignment);
    }

    /// Mark a queued job completed with the given output path.
    pub async fn complete_job(&self, job_id: Uuid, output_path: impl Into<String>, encoder: &str) {
        let mut assignments = self.assignments.write().await;
        if let Some(assignment) = assignments.get_mut(&job_id) {
            assignment.status = AssignmentStatus::Completed;
            assignment.progress = 100;
            assignment.output_path = Some(output_path.into());
            assignment.encoder_name = Some(encoder.to_owned());
            assignment.compression_ratio = Some(0.55);
            assignment.updated_at = Utc::now();
        }
    }

    /// Mark a queued job failed with the given error.
    pub async fn fail_job(&self, job_id: Uuid, error: impl Into<String>) {
        let mut assignments = self.assignments.write().await;
        if let Some(assignment) = assignments.get_mut(&job_id) {
            assignment.status = AssignmentStatus::Failed;
            assignment.error = Some(error.into());
            assignment.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl EncoderDispatcher for StubDispatcher {
    async fn encoder_count(&self) -> anyhow::Result<usize> {
        Ok(self.encoder_count.load(Ordering::Relaxed))
    }

    async fn queue_job(&self, job: &EncodeJob) -> anyhow::Result<EncoderAssignment> {
        let now = Utc::now();
        let assignment = EncoderAssignment {
            job_id: job.job_id,
            status: AssignmentStatus::Pending,
            progress: 0,
            speed: None,
            eta_seconds: None,
            output_path: None,
            output_size: None,
            compression_ratio: None,
            error: None,
            encoder_name: None,
            created_at: now,
            updated_at: now,
        };
        self.assignments
            .write()
            .await
            .insert(job.job_id, assignment.clone());
        self.queued.write().await.push(job.clone());
        Ok(assignment)
    }

    async fn assignment(&self, job_id: Uuid) -> anyhow::Result<Option<EncoderAssignment>> {
        Ok(self.assignments.read().await.get(&job_id).cloned())
    }
}

/// One recorded delivery call.
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    /// Target server of the transfer.
    pub server_id: Uuid,
    /// Source path streamed from.
    pub src: PathBuf,
    /// Destination path streamed to.
    pub dst: PathBuf,
}

/// Transport that records transfers and fails scripted servers.
#[derive(Default)]
pub struct RecordingTransport {
    failures: RwLock<HashMap<Uuid, String>>,
    delay: RwLock<Option<Duration>>,
    /// Transfers attempted, in order.
    pub deliveries: RwLock<Vec<RecordedDelivery>>,
}

impl RecordingTransport {
    /// Construct a transport that succeeds every transfer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every transfer to `server_id` with `error` until cleared.
    pub async fn fail_server(&self, server_id: Uuid, error: impl Into<String>) {
        self.failures.write().await.insert(server_id, error.into());
    }

    /// Stop failing transfers to `server_id`.
    pub async fn clear_failure(&self, server_id: Uuid) {
        self.failures.write().await.remove(&server_id);
    }

    /// Sleep this long inside each transfer (concurrency tests).
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn deliver(
        &self,
        server_id: Uuid,
        src: &Path,
        dst: &Path,
        on_progress: Option<ProgressSink>,
    ) -> anyhow::Result<DeliveryReceipt> {
        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        self.deliveries.write().await.push(RecordedDelivery {
            server_id,
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        if let Some(sink) = on_progress {
            sink(fetcharr_pipeline::adapters::TransferProgress {
                bytes_sent: 1,
                bytes_total: 1,
                bps: 1,
                eta_seconds: Some(0),
            });
        }
        if let Some(error) = self.failures.read().await.get(&server_id).cloned() {
            return Ok(DeliveryReceipt {
                success: false,
                error: Some(error),
                duration: Duration::from_millis(1),
                bytes_sent: 0,
            });
        }
        Ok(DeliveryReceipt {
            success: true,
            error: None,
            duration: Duration::from_millis(1),
            bytes_sent: 1,
        })
    }
}

/// Library index that records upserts.
#[derive(Default)]
pub struct RecordingLibrary {
    /// Upserted entries, in order.
    pub entries: RwLock<Vec<LibraryEntry>>,
}

#[async_trait]
impl LibraryIndex for RecordingLibrary {
    async fn upsert(&self, entry: &LibraryEntry) -> anyhow::Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}

/// Archive tools with a scriptable RAR location.
#[derive(Default)]
pub struct StubArchive {
    rar: RwLock<Option<PathBuf>>,
    /// Extractions performed, as (archive, destination) pairs.
    pub extracted: RwLock<Vec<(PathBuf, PathBuf)>>,
}

impl StubArchive {
    /// Make `detect_rar` report an archive at `path`.
    pub async fn set_rar(&self, path: PathBuf) {
        *self.rar.write().await = Some(path);
    }
}

#[async_trait]
impl ArchiveTools for StubArchive {
    async fn detect_rar(&self, _dir: &Path) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.rar.read().await.clone())
    }

    async fn extract_rar(&self, archive: &Path, dest: &Path) -> anyhow::Result<()> {
        if self.rar.read().await.is_none() {
            return Err(anyhow!("no archive scripted"));
        }
        self.extracted
            .write()
            .await
            .push((archive.to_path_buf(), dest.to_path_buf()));
        Ok(())
    }
}
