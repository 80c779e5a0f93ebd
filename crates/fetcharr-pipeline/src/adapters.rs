//! Collaborator interfaces the pipeline core consumes.
//!
//! Implementations (tracker scrapers, the torrent client RPC bridge, the
//! encoder pool, transfer transports) live outside the core; the engine is
//! written against these traits and the test-support crate ships scriptable
//! stubs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{MediaType, Release};

/// Lookup keys for a movie search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieQuery {
    /// External catalog identifier.
    pub catalog_id: i64,
    /// Secondary external identifier, when known.
    pub external_id: Option<String>,
    /// Title to match against.
    pub title: String,
    /// Release year, when known.
    pub year: Option<i32>,
}

/// Lookup keys for a TV season search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonQuery {
    /// External catalog identifier.
    pub catalog_id: i64,
    /// Secondary external identifier, when known.
    pub external_id: Option<String>,
    /// Series title to match against.
    pub title: String,
    /// First-air year, when known.
    pub year: Option<i32>,
    /// Season to search for.
    pub season: i32,
}

/// Result of one indexer sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerResponse {
    /// Releases surfaced across the queried indexers.
    pub releases: Vec<Release>,
    /// How many indexers answered the sweep.
    pub indexers_queried: u32,
    /// How many indexers failed during the sweep.
    pub indexers_failed: u32,
}

/// Release search across the configured tracker indexers.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Search for movie releases.
    async fn search_movie(&self, query: &MovieQuery) -> anyhow::Result<IndexerResponse>;

    /// Search for releases covering a TV season.
    async fn search_tv_season(&self, query: &SeasonQuery) -> anyhow::Result<IndexerResponse>;
}

/// Handle returned when a release is admitted into the torrent client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddedTorrent {
    /// Info-hash assigned by the client.
    pub hash: String,
    /// Display name reported by the client.
    pub name: String,
}

/// Snapshot of one download's progress inside the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    /// Completion percentage (0-100).
    pub progress: f64,
    /// Whether the payload finished downloading.
    pub is_complete: bool,
    /// Directory the client saves into.
    pub save_path: Option<String>,
    /// Root path of the downloaded content.
    pub content_path: Option<String>,
    /// Connected seeds.
    pub seeds: u32,
    /// Connected peers.
    pub peers: u32,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
    /// Current download rate in bytes per second.
    pub download_bps: u64,
}

/// A torrent session visible in the client, used by recovery matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTorrent {
    /// Info-hash of the session.
    pub hash: String,
    /// Display name of the session.
    pub name: String,
    /// Whether the payload finished downloading.
    pub is_complete: bool,
    /// Root path of the downloaded content, when complete.
    pub content_path: Option<String>,
}

/// One file inside a torrent payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentFileEntry {
    /// Path of the file relative to the payload root.
    pub name: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Black-box torrent client with a monitoring API.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Admit a release; returns the client-assigned handle.
    async fn add(&self, release: &Release) -> anyhow::Result<AddedTorrent>;

    /// Progress snapshot for a hash; `None` when the client no longer knows it.
    async fn progress(&self, hash: &str) -> anyhow::Result<Option<DownloadSnapshot>>;

    /// File listing of a payload.
    async fn files(&self, hash: &str) -> anyhow::Result<Vec<TorrentFileEntry>>;

    /// Every session currently registered with the client.
    async fn all_torrents(&self) -> anyhow::Result<Vec<RemoteTorrent>>;

    /// Remove a session; default implementation reports lack of support.
    async fn remove(&self, hash: &str) -> anyhow::Result<()> {
        let _ = hash;
        bail!("torrent removal not supported by this client");
    }
}

/// Lifecycle states of an encoder pool assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Queued, waiting for an encoder.
    Pending,
    /// Claimed by an encoder but not yet transcoding.
    Assigned,
    /// Actively transcoding.
    Encoding,
    /// Finished successfully.
    Completed,
    /// Failed with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

/// Persistent encoder assignment record polled by the encode worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderAssignment {
    /// Job identifier supplied at queue time.
    pub job_id: Uuid,
    /// Current lifecycle state.
    pub status: AssignmentStatus,
    /// Completion percentage (0-100).
    pub progress: u8,
    /// Encode speed multiplier, when reported.
    pub speed: Option<f64>,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
    /// Output path once the encoder starts writing.
    pub output_path: Option<String>,
    /// Output size in bytes once complete.
    pub output_size: Option<u64>,
    /// Output/input size ratio once complete.
    pub compression_ratio: Option<f64>,
    /// Failure detail for failed assignments.
    pub error: Option<String>,
    /// Name of the encoder that claimed the job.
    pub encoder_name: Option<String>,
    /// When the assignment was created.
    pub created_at: DateTime<Utc>,
    /// When the assignment record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for queueing an encode job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeJob {
    /// Caller-assigned job identifier.
    pub job_id: Uuid,
    /// Source file to transcode.
    pub input_path: PathBuf,
    /// Temporary output path; renamed to the deterministic slot on success.
    pub output_path: PathBuf,
    /// Stage configuration from the request's pipeline template.
    pub config: serde_json::Value,
}

/// Encoder pool dispatcher.
#[async_trait]
pub trait EncoderDispatcher: Send + Sync {
    /// Number of encoders currently able to accept work.
    async fn encoder_count(&self) -> anyhow::Result<usize>;

    /// Queue a job; returns the initial assignment record.
    async fn queue_job(&self, job: &EncodeJob) -> anyhow::Result<EncoderAssignment>;

    /// Current assignment record; `None` when the job expired.
    async fn assignment(&self, job_id: Uuid) -> anyhow::Result<Option<EncoderAssignment>>;

    /// Cancel a job; default implementation reports lack of support.
    async fn cancel(&self, job_id: Uuid) -> anyhow::Result<()> {
        let _ = job_id;
        bail!("encode cancellation not supported by this dispatcher");
    }
}

/// Throughput snapshot surfaced during a transfer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Bytes sent so far.
    pub bytes_sent: u64,
    /// Total bytes to transfer.
    pub bytes_total: u64,
    /// Current throughput in bytes per second.
    pub bps: u64,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
}

/// Observer invoked with transfer progress snapshots.
pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Outcome of one server delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Whether the transfer completed.
    pub success: bool,
    /// Failure detail when the transfer did not complete.
    pub error: Option<String>,
    /// Wall time the transfer took.
    pub duration: Duration,
    /// Bytes written to the destination.
    pub bytes_sent: u64,
}

/// Streaming file transfer to a storage server.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Stream `src` to `dst` on the given server.
    async fn deliver(
        &self,
        server_id: Uuid,
        src: &Path,
        dst: &Path,
        on_progress: Option<ProgressSink>,
    ) -> anyhow::Result<DeliveryReceipt>;
}

/// One library index record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    /// External catalog identifier.
    pub catalog_id: i64,
    /// Media classification of the artifact.
    pub media_type: MediaType,
    /// Server holding the artifact.
    pub server_id: Uuid,
    /// Title of the artifact.
    pub title: String,
    /// Release year, when known.
    pub year: Option<i32>,
    /// Season for episode artifacts.
    pub season: Option<i32>,
    /// Episode for episode artifacts.
    pub episode: Option<i32>,
    /// Path of the artifact on the server.
    pub path: String,
}

/// Library index keyed on (catalog id, media type, server, season?, episode?).
#[async_trait]
pub trait LibraryIndex: Send + Sync {
    /// Insert or update the record for the entry's key.
    async fn upsert(&self, entry: &LibraryEntry) -> anyhow::Result<()>;
}

/// Archive probing and extraction helpers.
///
/// Extraction is CPU/IO heavy; implementations must not block the scheduler's
/// tick thread (delegate to a blocking pool or child process).
#[async_trait]
pub trait ArchiveTools: Send + Sync {
    /// Locate a RAR archive inside a payload directory, if one exists.
    async fn detect_rar(&self, dir: &Path) -> anyhow::Result<Option<PathBuf>>;

    /// Extract an archive into the destination directory.
    async fn extract_rar(&self, archive: &Path, dest: &Path) -> anyhow::Result<()>;

    /// Whether a file name looks like a sample clip.
    fn is_sample_file(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        lower.contains("sample") || lower.contains("/proof/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubClient;

    #[async_trait]
    impl TorrentClient for StubClient {
        async fn add(&self, _release: &Release) -> anyhow::Result<AddedTorrent> {
            Ok(AddedTorrent {
                hash: "abc".to_string(),
                name: "demo".to_string(),
            })
        }

        async fn progress(&self, _hash: &str) -> anyhow::Result<Option<DownloadSnapshot>> {
            Ok(None)
        }

        async fn files(&self, _hash: &str) -> anyhow::Result<Vec<TorrentFileEntry>> {
            Ok(Vec::new())
        }

        async fn all_torrents(&self) -> anyhow::Result<Vec<RemoteTorrent>> {
            Ok(Vec::new())
        }
    }

    struct StubArchive;

    #[async_trait]
    impl ArchiveTools for StubArchive {
        async fn detect_rar(&self, _dir: &Path) -> anyhow::Result<Option<PathBuf>> {
            Ok(None)
        }

        async fn extract_rar(&self, _archive: &Path, _dest: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn client_default_remove_errors() {
        let client = StubClient;
        assert!(client.remove("abc").await.is_err());
    }

    #[test]
    fn default_sample_heuristic_matches_common_names() {
        let archive = StubArchive;
        assert!(archive.is_sample_file("Movie.2010/Sample/movie-sample.mkv"));
        assert!(!archive.is_sample_file("Movie.2010/movie.mkv"));
    }
}
