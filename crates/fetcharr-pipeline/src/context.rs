//! Step context and delivery checkpoint payloads carried on items.
//!
//! The context is a typed accumulator with well-known sections; unknown keys
//! are preserved through a flattened map so readers tolerate forward-compatible
//! additions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Release, Resolution};

/// Structured accumulator of stage outputs carried on an item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepContext {
    /// Search-stage output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchContext>,
    /// Download-stage output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadContext>,
    /// Encode-stage output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encode: Option<EncodeContext>,
    /// Delivery summary recorded when the item completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_results: Option<DeliveryResults>,
    /// Forward-compatible keys this build does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StepContext {
    /// Shallow-merge `patch` into the context: a present section replaces the
    /// stored one; unknown keys merge entry-by-entry.
    pub fn merge(&mut self, patch: StepContext) {
        if patch.search.is_some() {
            self.search = patch.search;
        }
        if patch.download.is_some() {
            self.download = patch.download;
        }
        if patch.encode.is_some() {
            self.encode = patch.encode;
        }
        if patch.delivery_results.is_some() {
            self.delivery_results = patch.delivery_results;
        }
        for (key, value) in patch.extra {
            self.extra.insert(key, value);
        }
    }

    /// Whether a download source (single file or episode list) is recorded.
    #[must_use]
    pub fn has_download_source(&self) -> bool {
        self.download.as_ref().is_some_and(DownloadContext::has_source)
    }

    /// Path of the first encoded artifact, when one is recorded.
    #[must_use]
    pub fn encoded_path(&self) -> Option<&str> {
        self.encode
            .as_ref()
            .and_then(|encode| encode.encoded_files.first())
            .map(|file| file.path.as_str())
    }
}

/// Search-stage output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchContext {
    /// The release selected for download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_release: Option<Release>,
    /// Season packs selected for a TV item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_packs: Vec<Release>,
    /// An already-present torrent adopted instead of a fresh download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_download: Option<ExistingDownload>,
    /// Runner-up releases retained for operator choice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_releases: Vec<Release>,
    /// Whether any release met the quality requirement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_met: Option<bool>,
    /// Set when the stage was skipped because a download already existed.
    #[serde(default)]
    pub skipped_search: bool,
}

impl SearchContext {
    /// Whether the stage produced anything a download can start from.
    #[must_use]
    pub fn has_candidate(&self) -> bool {
        self.selected_release.is_some()
            || !self.selected_packs.is_empty()
            || self.existing_download.is_some()
            || !self.alternative_releases.is_empty()
    }
}

/// A torrent already present in the client, adopted by the search stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExistingDownload {
    /// Info-hash of the adopted torrent.
    pub torrent_hash: String,
    /// Whether the torrent was already complete when adopted.
    pub is_complete: bool,
}

/// Download-stage output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadContext {
    /// Info-hash of the torrent backing the download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torrent_hash: Option<String>,
    /// Resolved source file for movie items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<String>,
    /// Resolved per-episode files for season packs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episode_files: Vec<EpisodeFile>,
    /// Whether the torrent client reported the payload complete.
    #[serde(default)]
    pub is_complete: bool,
}

impl DownloadContext {
    /// Whether a usable source path (or per-episode list) is recorded.
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.source_file_path
            .as_deref()
            .is_some_and(|path| !path.is_empty())
            || !self.episode_files.is_empty()
    }
}

/// One resolved episode file inside a season pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeFile {
    /// Season number parsed from the file name.
    pub season: i32,
    /// Episode number parsed from the file name.
    pub episode: i32,
    /// Absolute path of the episode file.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Item the file was resolved for, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_item_id: Option<Uuid>,
}

/// Encode-stage output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodeContext {
    /// Encoder pool job identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// Encoded artifacts produced by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encoded_files: Vec<EncodedFile>,
}

/// One encoded artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedFile {
    /// Absolute path of the artifact at its deterministic location.
    pub path: String,
    /// Resolution of the artifact, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Codec derived from the encoder name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Servers the artifact is bound for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_server_ids: Vec<Uuid>,
    /// Season number for episode artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<i32>,
    /// Episode number for episode artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<i32>,
    /// Artifact size in bytes, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Output/input size ratio reported by the encoder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}

/// Delivery summary recorded on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryResults {
    /// Servers that received the artifact.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered_servers: Vec<Uuid>,
    /// Servers whose most recent delivery attempt failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_servers: Vec<Uuid>,
    /// Whether every target server received the artifact.
    #[serde(default)]
    pub all_deliveries_complete: bool,
}

/// Delivery-stage partial-progress record, reflected on retry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryCheckpoint {
    /// Servers that already received the artifact.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered: Vec<DeliveredServer>,
    /// Servers whose most recent attempt failed, with the error retained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedServer>,
}

impl DeliveryCheckpoint {
    /// Whether the server has already received the artifact.
    #[must_use]
    pub fn is_delivered(&self, server_id: Uuid) -> bool {
        self.delivered.iter().any(|entry| entry.server_id == server_id)
    }

    /// Record a successful delivery, clearing any retained failure for the
    /// server. Repeated successes for the same server are collapsed.
    pub fn record_success(&mut self, server_id: Uuid, server_name: &str, completed_at: DateTime<Utc>) {
        self.failed.retain(|entry| entry.server_id != server_id);
        if !self.is_delivered(server_id) {
            self.delivered.push(DeliveredServer {
                server_id,
                server_name: server_name.to_owned(),
                completed_at,
            });
        }
    }

    /// Record a failed delivery attempt, replacing any previous failure entry
    /// for the server.
    pub fn record_failure(&mut self, server_id: Uuid, server_name: &str, error: &str) {
        self.failed.retain(|entry| entry.server_id != server_id);
        self.failed.push(FailedServer {
            server_id,
            server_name: server_name.to_owned(),
            error: error.to_owned(),
        });
    }

    /// Whether every server in `targets` has been delivered to.
    #[must_use]
    pub fn covers(&self, targets: &[Uuid]) -> bool {
        targets.iter().all(|server_id| self.is_delivered(*server_id))
    }
}

/// One delivered-server checkpoint entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveredServer {
    /// Server that received the artifact.
    pub server_id: Uuid,
    /// Server name at delivery time.
    pub server_name: String,
    /// When the transfer completed.
    pub completed_at: DateTime<Utc>,
}

/// One failed-server checkpoint entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedServer {
    /// Server whose delivery failed.
    pub server_id: Uuid,
    /// Server name at failure time.
    pub server_name: String,
    /// Error of the most recent attempt.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_present_sections_only() {
        let mut context = StepContext {
            search: Some(SearchContext {
                skipped_search: true,
                ..SearchContext::default()
            }),
            download: Some(DownloadContext {
                torrent_hash: Some("abc".to_string()),
                ..DownloadContext::default()
            }),
            ..StepContext::default()
        };

        context.merge(StepContext {
            download: Some(DownloadContext {
                source_file_path: Some("/dl/movie.mkv".to_string()),
                is_complete: true,
                ..DownloadContext::default()
            }),
            ..StepContext::default()
        });

        assert!(context.search.as_ref().is_some_and(|s| s.skipped_search));
        let download = context.download.expect("download section");
        assert_eq!(download.source_file_path.as_deref(), Some("/dl/movie.mkv"));
        // The patch section replaced the stored one wholesale.
        assert!(download.torrent_hash.is_none());
    }

    #[test]
    fn unknown_keys_survive_round_trips() {
        let raw = serde_json::json!({
            "download": {"source_file_path": "/dl/movie.mkv", "is_complete": true},
            "scoring": {"model": "v2"}
        });
        let context: StepContext = serde_json::from_value(raw).expect("decode");
        assert!(context.has_download_source());
        assert_eq!(context.extra["scoring"]["model"], "v2");

        let encoded = serde_json::to_value(&context).expect("encode");
        assert_eq!(encoded["scoring"]["model"], "v2");
    }

    #[test]
    fn checkpoint_success_clears_failure() {
        let server = Uuid::new_v4();
        let mut checkpoint = DeliveryCheckpoint::default();
        checkpoint.record_failure(server, "alpha", "connection refused");
        assert_eq!(checkpoint.failed.len(), 1);

        checkpoint.record_success(server, "alpha", Utc::now());
        assert!(checkpoint.failed.is_empty());
        assert!(checkpoint.is_delivered(server));

        // Duplicate successes collapse.
        checkpoint.record_success(server, "alpha", Utc::now());
        assert_eq!(checkpoint.delivered.len(), 1);
    }

    #[test]
    fn checkpoint_coverage_requires_every_target() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut checkpoint = DeliveryCheckpoint::default();
        checkpoint.record_success(a, "alpha", Utc::now());
        assert!(!checkpoint.covers(&[a, b]));
        checkpoint.record_success(b, "beta", Utc::now());
        assert!(checkpoint.covers(&[a, b]));
    }

    #[test]
    fn encoded_path_reads_first_artifact() {
        let context = StepContext {
            encode: Some(EncodeContext {
                job_id: None,
                encoded_files: vec![EncodedFile {
                    path: "/encoded/encoded_x.mkv".to_string(),
                    resolution: Some(Resolution::Hd1080),
                    codec: Some("hevc".to_string()),
                    target_server_ids: Vec::new(),
                    season: None,
                    episode: None,
                    size_bytes: Some(1_000),
                    compression_ratio: Some(0.42),
                }],
            }),
            ..StepContext::default()
        };
        assert_eq!(context.encoded_path(), Some("/encoded/encoded_x.mkv"));
    }
}
