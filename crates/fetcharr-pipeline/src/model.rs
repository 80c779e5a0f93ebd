//! Core pipeline domain types shared across the workspace.

use chrono::{DateTime, Utc};
use fetcharr_events::ItemStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{DeliveryCheckpoint, StepContext};

/// Default retry budget applied to new items.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on retained error-history entries per item.
pub const ERROR_HISTORY_LIMIT: usize = 20;

/// Media classification of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A single feature film.
    Movie,
    /// A television series request covering one or more episodes.
    Tv,
}

impl MediaType {
    /// Machine-friendly label used in persistence and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
        }
    }

    /// Parse a persisted label back into a media type.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "movie" => Some(Self::Movie),
            "tv" => Some(Self::Tv),
            _ => None,
        }
    }
}

/// Kind of the atomic unit the pipeline advances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// One item per movie request.
    Movie,
    /// One item per requested episode.
    Episode,
}

impl ItemKind {
    /// Machine-friendly label used in persistence and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
        }
    }

    /// Parse a persisted label back into an item kind.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "movie" => Some(Self::Movie),
            "episode" => Some(Self::Episode),
            _ => None,
        }
    }
}

/// Aggregate status computed for a request from its items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// No item has started processing yet.
    Pending,
    /// At least one item is actively moving through the pipeline.
    Processing,
    /// Every item completed delivery.
    Completed,
    /// All items are terminal and at least one failed.
    Failed,
    /// All items were cancelled.
    Cancelled,
}

impl RequestStatus {
    /// Machine-friendly label used in persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted label back into a request status.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Video resolution tiers recognised by the quality predicate.
///
/// Ordering follows visual quality, so `Resolution::Hd1080 < Uhd2160`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Standard definition (480p and below).
    Sd480,
    /// 720p high definition.
    Hd720,
    /// 1080p full high definition.
    Hd1080,
    /// 2160p ultra high definition.
    Uhd2160,
}

impl Resolution {
    /// Conventional release-name label for the resolution.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sd480 => "480p",
            Self::Hd720 => "720p",
            Self::Hd1080 => "1080p",
            Self::Uhd2160 => "2160p",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A release candidate surfaced by the indexer layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    /// Raw release title as published by the tracker.
    pub title: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// Seeder count at query time.
    pub seeders: u32,
    /// Leecher count at query time.
    pub leechers: u32,
    /// Name of the indexer that produced the release.
    pub indexer: String,
    /// Magnet URI used to admit the release into the torrent client.
    pub magnet_uri: String,
    /// Publication timestamp when the indexer supplied one.
    pub publish_date: Option<DateTime<Utc>>,
    /// Resolution parsed from the release title, when recognisable.
    pub resolution: Option<Resolution>,
}

/// Storage destination that receives the final artifact for an item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryTarget {
    /// Stable identifier of the storage server.
    pub server_id: Uuid,
    /// Human-readable server name used in checkpoints and logs.
    pub server_name: String,
    /// Library root on the server under which artifacts are placed.
    pub root_path: String,
    /// Optional encoding profile reference applied for this target.
    pub encoding_profile: Option<String>,
    /// Minimum resolution this target requires, if any.
    pub resolution: Option<Resolution>,
    /// Per-server parallel delivery cap; the worker default applies when unset.
    pub max_concurrent: Option<usize>,
}

/// Kind of a pipeline template step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Indexer search stage.
    Search,
    /// Torrent download stage.
    Download,
    /// Encoder stage.
    Encode,
    /// Delivery fan-out stage.
    Deliver,
}

/// One step in a request's pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    /// Stage the step configures.
    pub kind: StepKind,
    /// Free-form stage configuration forwarded to the collaborator.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Nested steps; the tree is walked depth-first.
    #[serde(default)]
    pub children: Vec<PipelineStep>,
}

/// Ordered step tree attached to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineTemplate {
    /// Top-level steps of the template.
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl PipelineTemplate {
    /// Locate the first step of the given kind, walking the tree depth-first.
    #[must_use]
    pub fn find_step(&self, kind: StepKind) -> Option<&PipelineStep> {
        fn walk(steps: &[PipelineStep], kind: StepKind) -> Option<&PipelineStep> {
            for step in steps {
                if step.kind == kind {
                    return Some(step);
                }
                if let Some(found) = walk(&step.children, kind) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.steps, kind)
    }
}

/// A user intent: one movie or a set of episodes bound for one or more
/// storage destinations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRequest {
    /// Stable identifier of the request.
    pub id: Uuid,
    /// Whether the request covers a movie or a TV series.
    pub media_type: MediaType,
    /// External catalog identifier (e.g. TMDB id).
    pub catalog_id: i64,
    /// Secondary external identifier (e.g. IMDB id), when known.
    pub external_id: Option<String>,
    /// Human-readable title.
    pub title: String,
    /// Release year, when known.
    pub year: Option<i32>,
    /// Storage destinations the final artifacts fan out to.
    pub targets: Vec<DeliveryTarget>,
    /// Optional step tree consulted for per-stage configuration.
    pub pipeline: Option<PipelineTemplate>,
    /// Aggregate status recomputed from the request's items.
    pub status: RequestStatus,
    /// Aggregate progress percentage recomputed from the request's items.
    pub progress: u8,
    /// Error of the most recently failed item, if any.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last aggregate recompute.
    pub updated_at: DateTime<Utc>,
}

impl MediaRequest {
    /// Strictest resolution requirement across the request's targets.
    #[must_use]
    pub fn required_resolution(&self) -> Option<Resolution> {
        self.targets.iter().filter_map(|t| t.resolution).max()
    }
}

/// One retained error-history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Classified error kind label.
    pub kind: String,
    /// Human-readable error message.
    pub message: String,
    /// Attempt counter at the time the error was recorded.
    pub attempt: u32,
}

/// The atomic unit the pipeline drives: one per movie, one per episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingItem {
    /// Stable identifier of the item.
    pub id: Uuid,
    /// Owning request identifier.
    pub request_id: Uuid,
    /// Whether the item is a movie or an episode.
    pub kind: ItemKind,
    /// External catalog identifier inherited from the request.
    pub catalog_id: i64,
    /// Title inherited from the request (series title for episodes).
    pub title: String,
    /// Release year, when known.
    pub year: Option<i32>,
    /// Season number for episode items.
    pub season: Option<i32>,
    /// Episode number for episode items.
    pub episode: Option<i32>,
    /// Current position in the state machine.
    pub status: ItemStatus,
    /// Human-readable label of the step currently in flight.
    pub current_step: Option<String>,
    /// Structured accumulator of stage outputs.
    pub step_context: StepContext,
    /// Delivery-stage partial-progress record.
    pub checkpoint: DeliveryCheckpoint,
    /// Consumed retry slots.
    pub attempts: u32,
    /// Retry budget; exceeding it forces terminal failure.
    pub max_attempts: u32,
    /// Most recent error, as shown to users.
    pub last_error: Option<String>,
    /// Bounded chronological error history.
    pub error_history: Vec<ErrorEvent>,
    /// Eligibility gate that consumes an attempt when scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Eligibility gate for service outages; does not consume attempts.
    pub skip_until: Option<DateTime<Utc>>,
    /// Discovery cooldown gate for the `discovered` status.
    pub cooldown_ends_at: Option<DateTime<Utc>>,
    /// Torrent client handle, set once a download begins.
    pub download_id: Option<String>,
    /// Encoder pool handle, set once an encode job is queued.
    pub encoding_job_id: Option<Uuid>,
    /// Stage progress percentage (0-100).
    pub progress: u8,
    /// When `progress` last changed; drives stall detection.
    pub last_progress_update: Option<DateTime<Utc>>,
    /// Progress value at the last change; drives stall detection.
    pub last_progress_value: Option<u8>,
    /// When the payload finished downloading.
    pub downloaded_at: Option<DateTime<Utc>>,
    /// When the encoded artifact was produced.
    pub encoded_at: Option<DateTime<Utc>>,
    /// When the final delivery finished.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the item reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last mutation; used for optimistic concurrency.
    pub updated_at: DateTime<Utc>,
}

impl ProcessingItem {
    /// Construct a fresh pending item owned by `request`.
    #[must_use]
    pub fn new(request: &MediaRequest, kind: ItemKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_id: request.id,
            kind,
            catalog_id: request.catalog_id,
            title: request.title.clone(),
            year: request.year,
            season: None,
            episode: None,
            status: ItemStatus::Pending,
            current_step: None,
            step_context: StepContext::default(),
            checkpoint: DeliveryCheckpoint::default(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            error_history: Vec::new(),
            next_retry_at: None,
            skip_until: None,
            cooldown_ends_at: None,
            download_id: None,
            encoding_job_id: None,
            progress: 0,
            last_progress_update: None,
            last_progress_value: None,
            downloaded_at: None,
            encoded_at: None,
            delivered_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether both retry gates (when present) have elapsed at `now`.
    #[must_use]
    pub fn eligible_at(&self, now: DateTime<Utc>) -> bool {
        let retry_open = self.next_retry_at.is_none_or(|at| at <= now);
        let skip_open = self.skip_until.is_none_or(|at| at <= now);
        retry_open && skip_open
    }

    /// Append an error-history entry, retaining only the most recent entries.
    pub fn push_error(&mut self, event: ErrorEvent) {
        self.error_history.push(event);
        if self.error_history.len() > ERROR_HISTORY_LIMIT {
            let excess = self.error_history.len() - ERROR_HISTORY_LIMIT;
            self.error_history.drain(..excess);
        }
    }
}

/// Aggregate fields recomputed for a request from its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAggregates {
    /// Derived request status.
    pub status: RequestStatus,
    /// Mean item progress (0-100).
    pub progress: u8,
    /// Error of the most recently failed item, if any.
    pub error: Option<String>,
}

impl RequestAggregates {
    /// Derive request aggregates from the request's current items.
    #[must_use]
    pub fn compute(items: &[ProcessingItem]) -> Self {
        if items.is_empty() {
            return Self {
                status: RequestStatus::Pending,
                progress: 0,
                error: None,
            };
        }

        let total: u32 = items
            .iter()
            .map(|item| {
                if item.status == ItemStatus::Completed {
                    100
                } else {
                    u32::from(item.progress)
                }
            })
            .sum();
        let count = u32::try_from(items.len()).unwrap_or(u32::MAX);
        let progress = u8::try_from(total / count).unwrap_or(100);

        let error = items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .max_by_key(|item| item.updated_at)
            .and_then(|item| item.last_error.clone());

        let all_terminal = items.iter().all(|item| item.status.is_terminal());
        let status = if items.iter().all(|item| item.status == ItemStatus::Completed) {
            RequestStatus::Completed
        } else if !all_terminal {
            if items
                .iter()
                .all(|item| item.status == ItemStatus::Pending)
            {
                RequestStatus::Pending
            } else {
                RequestStatus::Processing
            }
        } else if items.iter().any(|item| item.status == ItemStatus::Failed) {
            RequestStatus::Failed
        } else if items.iter().all(|item| item.status == ItemStatus::Cancelled) {
            RequestStatus::Cancelled
        } else {
            // Mixed completed/cancelled terminal set.
            RequestStatus::Completed
        };

        Self {
            status,
            progress,
            error,
        }
    }
}
