//! Single entry point for request creation, status transitions, progress,
//! cancellation and retry.
//!
//! Every item mutation flows through this type: structural legality comes
//! from the state machine, payload completeness from the validation
//! framework, and failure handling from the retry policy. Workers never write
//! status directly.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fetcharr_events::{Event, EventBus, ItemStatus};
use fetcharr_pipeline::context::{DeliveryCheckpoint, StepContext};
use fetcharr_pipeline::error::{PipelineError, PipelineResult};
use fetcharr_pipeline::model::{
    DeliveryTarget, ErrorEvent, ItemKind, MediaRequest, MediaType, PipelineTemplate,
    ProcessingItem, RequestAggregates, RequestStatus,
};
use fetcharr_pipeline::retry::{RetryPolicy, StageError};
use fetcharr_pipeline::state_machine;
use fetcharr_pipeline::store::{DownloadRecord, PipelineStore};
use fetcharr_pipeline::validation::{self, ValidationPhase};
use fetcharr_telemetry::Metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One episode of a TV request.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeSpec {
    /// Season number.
    pub season: i32,
    /// Episode number.
    pub episode: i32,
}

/// Parameters for creating a request with its items.
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// Whether the request covers a movie or a TV series.
    pub media_type: MediaType,
    /// External catalog identifier.
    pub catalog_id: i64,
    /// Secondary external identifier, when known.
    pub external_id: Option<String>,
    /// Human-readable title.
    pub title: String,
    /// Release year, when known.
    pub year: Option<i32>,
    /// Storage destinations for the final artifacts.
    pub targets: Vec<DeliveryTarget>,
    /// Optional per-stage configuration tree.
    pub pipeline: Option<PipelineTemplate>,
    /// Explicit episode list; empty for movies.
    pub episodes: Vec<EpisodeSpec>,
    /// Retry budget override for the request's items.
    pub max_attempts: Option<u32>,
}

/// Fields a caller may write alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    /// Human-readable step label.
    pub current_step: Option<String>,
    /// Step-context sections to merge in.
    pub step_context: Option<StepContext>,
    /// Delivery checkpoint replacement.
    pub checkpoint: Option<DeliveryCheckpoint>,
    /// Stage progress percentage.
    pub progress: Option<u8>,
    /// Error message to record as `last_error`.
    pub error: Option<String>,
    /// Torrent client handle.
    pub download_id: Option<String>,
    /// Encoder pool handle.
    pub encoding_job_id: Option<Uuid>,
    /// Discovery cooldown deadline.
    pub cooldown_ends_at: Option<DateTime<Utc>>,
}

/// Coordinates the state machine, validation, retry policy and store.
pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    events: EventBus,
    metrics: Metrics,
    retry_policy: RetryPolicy,
}

impl Orchestrator {
    /// Construct an orchestrator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>, events: EventBus, metrics: Metrics) -> Self {
        Self {
            store,
            events,
            metrics,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Replace the default retry policy (tests tune the delays).
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Access the shared event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Access the shared metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn publish(&self, event: Event) {
        self.metrics.record_event(event.kind());
        let _ = self.events.publish(event);
    }

    async fn load_item(&self, item_id: Uuid) -> PipelineResult<ProcessingItem> {
        self.store
            .item(item_id)
            .await?
            .ok_or(PipelineError::ItemNotFound { id: item_id })
    }

    /// Load the request owning an item.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RequestNotFound`] when the id does not resolve.
    pub async fn request(&self, request_id: Uuid) -> PipelineResult<MediaRequest> {
        self.store
            .request(request_id)
            .await?
            .ok_or(PipelineError::RequestNotFound { id: request_id })
    }

    /// Load an item by id.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ItemNotFound`] when the id does not resolve.
    pub async fn item(&self, item_id: Uuid) -> PipelineResult<ProcessingItem> {
        self.load_item(item_id).await
    }

    /// Create a request with one item per unit of work.
    ///
    /// Movies fan out into a single item; TV requests produce one item per
    /// listed episode. The request is rolled back if any item fails to
    /// persist.
    ///
    /// # Errors
    ///
    /// Returns the store failure that aborted creation.
    pub async fn create_request(
        &self,
        new: NewRequest,
    ) -> PipelineResult<(MediaRequest, Vec<ProcessingItem>)> {
        let now = Utc::now();
        let request = MediaRequest {
            id: Uuid::new_v4(),
            media_type: new.media_type,
            catalog_id: new.catalog_id,
            external_id: new.external_id,
            title: new.title,
            year: new.year,
            targets: new.targets,
            pipeline: new.pipeline,
            status: RequestStatus::Pending,
            progress: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_request(&request).await?;

        let specs: Vec<Option<EpisodeSpec>> = match new.media_type {
            MediaType::Movie => vec![None],
            MediaType::Tv => new.episodes.iter().copied().map(Some).collect(),
        };

        let mut items = Vec::with_capacity(specs.len());
        for spec in specs {
            let kind = if spec.is_some() {
                ItemKind::Episode
            } else {
                ItemKind::Movie
            };
            let mut item = ProcessingItem::new(&request, kind);
            if let Some(spec) = spec {
                item.season = Some(spec.season);
                item.episode = Some(spec.episode);
            }
            if let Some(max_attempts) = new.max_attempts {
                item.max_attempts = max_attempts;
            }
            if let Err(err) = self.store.create_item(&item).await {
                warn!(
                    request_id = %request.id,
                    error = %err,
                    "item creation failed; rolling back request"
                );
                self.store.delete_request(request.id).await?;
                return Err(err);
            }
            items.push(item);
        }

        info!(
            request_id = %request.id,
            media_type = request.media_type.as_str(),
            items = items.len(),
            "request created"
        );
        self.publish(Event::RequestCreated {
            request_id: request.id,
            item_count: items.len(),
        });
        Ok((request, items))
    }

    /// Move an item to a new status, writing the supplied context atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] when the edge does not
    /// exist and [`PipelineError::ValidationFailed`] when entry or exit
    /// preconditions are unmet; the item is left untouched in both cases.
    pub async fn transition(
        &self,
        item_id: Uuid,
        to: ItemStatus,
        patch: TransitionPatch,
    ) -> PipelineResult<ProcessingItem> {
        let item = self.load_item(item_id).await?;
        let from = item.status;
        if !state_machine::can_transition(from, to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }

        let mut merged = apply_patch(item.clone(), patch);

        // Entry validation always runs; exit validation is skipped for the
        // terminal escape and for progress self-loops.
        let entry = validation::validate_entry(to, &merged);
        if !entry.is_valid() {
            return Err(PipelineError::ValidationFailed {
                phase: ValidationPhase::Entry,
                status: to,
                errors: entry.errors,
            });
        }
        if !to.is_terminal() && to != from {
            let exit = validation::validate_exit(from, &merged);
            if !exit.is_valid() {
                return Err(PipelineError::ValidationFailed {
                    phase: ValidationPhase::Exit,
                    status: from,
                    errors: exit.errors,
                });
            }
        }

        merged.status = to;
        stamp_stage_timestamps(&mut merged, to);

        let updated_at = self.store.update_item(&merged, item.updated_at).await?;
        merged.updated_at = updated_at;
        self.recompute_aggregates(merged.request_id).await?;

        if from == to {
            debug!(item_id = %item_id, status = %to, progress = merged.progress, "progress transition");
        } else {
            info!(item_id = %item_id, from = %from, to = %to, "status transition");
            self.metrics.record_transition(to.as_str());
            self.publish(Event::StatusChanged {
                item_id,
                request_id: merged.request_id,
                from,
                to,
            });
            match to {
                ItemStatus::Completed => self.publish(Event::ItemCompleted { item_id }),
                ItemStatus::Failed => self.publish(Event::ItemFailed {
                    item_id,
                    message: merged.last_error.clone().unwrap_or_default(),
                }),
                _ => {}
            }
        }
        Ok(merged)
    }

    /// Route a stage error through the retry policy.
    ///
    /// Skip-until decisions preserve the attempt counter; next-retry-at
    /// decisions consume one. Worker input statuses are preserved so the
    /// owning worker re-claims the item; `searching` (which no worker polls)
    /// resets to `pending`. Terminal decisions move the item to `failed`.
    ///
    /// # Errors
    ///
    /// Returns store failures; a terminal item is returned unchanged.
    pub async fn handle_error(
        &self,
        item_id: Uuid,
        error: StageError,
    ) -> PipelineResult<ProcessingItem> {
        let mut item = self.load_item(item_id).await?;
        if item.status.is_terminal() {
            debug!(item_id = %item_id, status = %item.status, "ignoring error for terminal item");
            return Ok(item);
        }

        self.metrics
            .record_stage_failure(item.status.as_str(), error.kind.as_str());

        let now = Utc::now();
        item.push_error(ErrorEvent {
            at: now,
            kind: error.kind.as_str().to_owned(),
            message: error.message.clone(),
            attempt: item.attempts,
        });
        item.last_error = Some(error.message.clone());

        let decision = self
            .retry_policy
            .decide(&error, item.attempts, item.max_attempts);
        let expected = item.updated_at;

        if !decision.should_retry {
            warn!(
                item_id = %item_id,
                kind = error.kind.as_str(),
                reason = %decision.reason,
                "terminal failure"
            );
            item.status = ItemStatus::Failed;
            let updated_at = self.store.update_item(&item, expected).await?;
            item.updated_at = updated_at;
            self.recompute_aggregates(item.request_id).await?;
            self.metrics.record_transition(ItemStatus::Failed.as_str());
            self.publish(Event::ItemFailed {
                item_id,
                message: error.message,
            });
            return Ok(item);
        }

        let delay = ChronoDuration::from_std(decision.delay).unwrap_or_default();
        let eligible_at = now + delay;
        if decision.use_skip_until {
            item.skip_until = Some(eligible_at);
        } else {
            item.attempts += 1;
            item.next_retry_at = Some(eligible_at);
        }

        // Searching has no polling worker; retries land back in pending.
        if item.status == ItemStatus::Searching {
            item.status = ItemStatus::Pending;
        }

        debug!(
            item_id = %item_id,
            kind = error.kind.as_str(),
            skip = decision.use_skip_until,
            eligible_at = %eligible_at,
            attempts = item.attempts,
            reason = %decision.reason,
            "retry scheduled"
        );
        let updated_at = self.store.update_item(&item, expected).await?;
        item.updated_at = updated_at;
        self.recompute_aggregates(item.request_id).await?;
        self.metrics.record_retry_scheduled(decision.use_skip_until);
        self.publish(Event::RetryScheduled {
            item_id,
            skip: decision.use_skip_until,
            eligible_at,
            kind: error.kind.as_str().to_owned(),
        });
        Ok(item)
    }

    /// Cancel an item. In-flight external work is not aborted; workers drop
    /// the item on their next tick.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TerminalStatus`] when the item is already
    /// terminal.
    pub async fn cancel(&self, item_id: Uuid) -> PipelineResult<ProcessingItem> {
        let item = self.load_item(item_id).await?;
        if item.status.is_terminal() {
            return Err(PipelineError::TerminalStatus {
                id: item_id,
                status: item.status,
            });
        }
        self.transition(item_id, ItemStatus::Cancelled, TransitionPatch::default())
            .await
    }

    /// Reset a failed item for another pass through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RetryFromNonFailed`] unless the item is in
    /// `failed`.
    pub async fn retry(&self, item_id: Uuid) -> PipelineResult<ProcessingItem> {
        let mut item = self.load_item(item_id).await?;
        if item.status != ItemStatus::Failed {
            return Err(PipelineError::RetryFromNonFailed {
                id: item_id,
                status: item.status,
            });
        }

        let expected = item.updated_at;
        item.status = ItemStatus::Pending;
        item.attempts = 0;
        item.last_error = None;
        item.next_retry_at = None;
        item.skip_until = None;
        item.progress = 0;
        item.current_step = None;

        let updated_at = self.store.update_item(&item, expected).await?;
        item.updated_at = updated_at;
        self.recompute_aggregates(item.request_id).await?;
        info!(item_id = %item_id, "manual retry; item returned to pending");
        self.metrics.record_transition(ItemStatus::Pending.as_str());
        self.publish(Event::StatusChanged {
            item_id,
            request_id: item.request_id,
            from: ItemStatus::Failed,
            to: ItemStatus::Pending,
        });
        Ok(item)
    }

    /// Items holding `status` whose retry gates have elapsed.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn items_for_processing(
        &self,
        status: ItemStatus,
    ) -> PipelineResult<Vec<ProcessingItem>> {
        self.store.eligible_items(status, Utc::now()).await
    }

    /// Items holding `status` regardless of gates (recovery sweeps).
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn items_with_status(
        &self,
        status: ItemStatus,
    ) -> PipelineResult<Vec<ProcessingItem>> {
        self.store.items_with_status(status).await
    }

    /// Record stage progress, debounced: equal values are a no-op and the
    /// persisted value never decreases.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn update_progress(
        &self,
        item_id: Uuid,
        progress: u8,
    ) -> PipelineResult<ProcessingItem> {
        let mut item = self.load_item(item_id).await?;
        let progress = progress.min(100);
        // Debounce equal values; never decrease the persisted progress.
        if progress <= item.progress {
            return Ok(item);
        }

        let now = Utc::now();
        let expected = item.updated_at;
        item.progress = progress;
        item.last_progress_update = Some(now);
        item.last_progress_value = Some(progress);
        let updated_at = self.store.update_item(&item, expected).await?;
        item.updated_at = updated_at;
        self.recompute_aggregates(item.request_id).await?;
        self.publish(Event::StageProgress {
            item_id,
            status: item.status,
            progress,
        });
        Ok(item)
    }

    /// Merge step-context sections without changing status.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn update_context(
        &self,
        item_id: Uuid,
        context: StepContext,
        current_step: Option<String>,
    ) -> PipelineResult<ProcessingItem> {
        let mut item = self.load_item(item_id).await?;
        let expected = item.updated_at;
        item.step_context.merge(context);
        if let Some(step) = current_step {
            item.current_step = Some(step);
        }
        let updated_at = self.store.update_item(&item, expected).await?;
        item.updated_at = updated_at;
        Ok(item)
    }

    /// Record the outcome of one server delivery into the item's checkpoint.
    ///
    /// Failures never fail the item; subsequent ticks retry the server.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn record_delivery_outcome(
        &self,
        item_id: Uuid,
        server_id: Uuid,
        server_name: &str,
        outcome: Result<(), String>,
    ) -> PipelineResult<ProcessingItem> {
        let mut item = self.load_item(item_id).await?;
        let expected = item.updated_at;
        match &outcome {
            Ok(()) => {
                item.checkpoint
                    .record_success(server_id, server_name, Utc::now());
            }
            Err(error) => {
                item.checkpoint.record_failure(server_id, server_name, error);
                item.last_error = Some(format!("delivery to {server_name} failed: {error}"));
            }
        }
        let updated_at = self.store.update_item(&item, expected).await?;
        item.updated_at = updated_at;
        match outcome {
            Ok(()) => self.publish(Event::DeliveryCompleted { item_id, server_id }),
            Err(message) => self.publish(Event::DeliveryFailed {
                item_id,
                server_id,
                message,
            }),
        }
        Ok(item)
    }

    /// Persist (or refresh) a local download record.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn record_download(&self, record: &DownloadRecord) -> PipelineResult<()> {
        self.store.record_download(record).await
    }

    /// Load a download record by torrent hash.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn download_by_hash(&self, hash: &str) -> PipelineResult<Option<DownloadRecord>> {
        self.store.download_by_hash(hash).await
    }

    /// Recompute a request's aggregate status/progress/error from its items.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn recompute_aggregates(&self, request_id: Uuid) -> PipelineResult<()> {
        let Some(mut request) = self.store.request(request_id).await? else {
            return Ok(());
        };
        let items = self.store.items_for_request(request_id).await?;
        let aggregates = RequestAggregates::compute(&items);
        request.status = aggregates.status;
        request.progress = aggregates.progress;
        request.error = aggregates.error;
        request.updated_at = Utc::now();
        self.store.update_request(&request).await
    }
}

fn apply_patch(mut item: ProcessingItem, patch: TransitionPatch) -> ProcessingItem {
    if let Some(step) = patch.current_step {
        item.current_step = Some(step);
    }
    if let Some(context) = patch.step_context {
        item.step_context.merge(context);
    }
    if let Some(checkpoint) = patch.checkpoint {
        item.checkpoint = checkpoint;
    }
    if let Some(progress) = patch.progress {
        let progress = progress.min(100);
        // Transitions reset the stall baseline even when the value repeats.
        item.last_progress_update = Some(Utc::now());
        item.last_progress_value = Some(progress);
        item.progress = progress.max(item.progress);
    }
    if let Some(error) = patch.error {
        item.last_error = Some(error);
    }
    if let Some(download_id) = patch.download_id {
        item.download_id = Some(download_id);
    }
    if let Some(job_id) = patch.encoding_job_id {
        item.encoding_job_id = Some(job_id);
    }
    if let Some(deadline) = patch.cooldown_ends_at {
        item.cooldown_ends_at = Some(deadline);
    }
    item
}

fn stamp_stage_timestamps(item: &mut ProcessingItem, to: ItemStatus) {
    let now = Utc::now();
    match to {
        ItemStatus::Downloaded => {
            item.downloaded_at.get_or_insert(now);
        }
        ItemStatus::Encoded => {
            item.encoded_at.get_or_insert(now);
        }
        ItemStatus::Completed => {
            item.delivered_at.get_or_insert(now);
            item.completed_at.get_or_insert(now);
            item.progress = 100;
        }
        _ => {}
    }
}
