//! Orchestrator behaviour: transition legality, validation, error routing,
//! manual retry and progress bookkeeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use fetcharr_engine::{EpisodeSpec, NewRequest, Orchestrator, TransitionPatch};
use fetcharr_events::{EventBus, ItemStatus};
use fetcharr_pipeline::context::{EncodeContext, SearchContext, StepContext};
use fetcharr_pipeline::error::PipelineError;
use fetcharr_pipeline::model::{ItemKind, MediaType, ProcessingItem};
use fetcharr_pipeline::retry::{ErrorKind, StageError};
use fetcharr_pipeline::store::PipelineStore;
use fetcharr_pipeline::validation::ValidationPhase;
use fetcharr_telemetry::Metrics;
use fetcharr_test_support::{MemoryStore, movie_request, sample_release, target, tv_request};

fn harness() -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn PipelineStore>,
        EventBus::with_capacity(256),
        Metrics::new().expect("metrics registry"),
    ));
    (orchestrator, store)
}

fn movie_new_request() -> NewRequest {
    let request = movie_request();
    NewRequest {
        media_type: MediaType::Movie,
        catalog_id: request.catalog_id,
        external_id: request.external_id,
        title: request.title,
        year: request.year,
        targets: request.targets,
        pipeline: None,
        episodes: Vec::new(),
        max_attempts: None,
    }
}

async fn seed_item(store: &MemoryStore, status: ItemStatus) -> ProcessingItem {
    let request = movie_request();
    store.seed_request(request.clone()).await;
    let mut item = ProcessingItem::new(&request, ItemKind::Movie);
    item.status = status;
    store.seed_item(item.clone()).await;
    item
}

#[tokio::test]
async fn create_request_fans_out_one_item_per_unit() {
    let (orchestrator, _) = harness();

    let (request, items) = orchestrator
        .create_request(movie_new_request())
        .await
        .expect("movie request");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].kind, ItemKind::Movie);
    assert_eq!(items[0].status, ItemStatus::Pending);
    assert_eq!(items[0].request_id, request.id);

    let tv = tv_request();
    let (_, episodes) = orchestrator
        .create_request(NewRequest {
            media_type: MediaType::Tv,
            catalog_id: tv.catalog_id,
            external_id: tv.external_id,
            title: tv.title,
            year: tv.year,
            targets: tv.targets,
            pipeline: None,
            episodes: vec![
                EpisodeSpec { season: 1, episode: 1 },
                EpisodeSpec { season: 1, episode: 2 },
                EpisodeSpec { season: 1, episode: 3 },
            ],
            max_attempts: Some(3),
        })
        .await
        .expect("tv request");
    assert_eq!(episodes.len(), 3);
    assert!(episodes.iter().all(|item| item.kind == ItemKind::Episode));
    assert!(episodes.iter().all(|item| item.max_attempts == 3));
    assert_eq!(episodes[2].episode, Some(3));
}

#[tokio::test]
async fn illegal_edges_are_rejected_with_invalid_transition() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Pending).await;

    let result = orchestrator
        .transition(item.id, ItemStatus::Found, TransitionPatch::default())
        .await;
    assert!(matches!(
        result,
        Err(PipelineError::InvalidTransition {
            from: ItemStatus::Pending,
            to: ItemStatus::Found,
        })
    ));

    // The item is untouched.
    let unchanged = orchestrator.item(item.id).await.expect("load");
    assert_eq!(unchanged.status, ItemStatus::Pending);
}

#[tokio::test]
async fn empty_encoded_files_fail_entry_validation() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Encoding).await;

    let result = orchestrator
        .transition(
            item.id,
            ItemStatus::Encoded,
            TransitionPatch {
                step_context: Some(StepContext {
                    encode: Some(EncodeContext {
                        job_id: None,
                        encoded_files: Vec::new(),
                    }),
                    ..StepContext::default()
                }),
                ..TransitionPatch::default()
            },
        )
        .await;

    match result {
        Err(PipelineError::ValidationFailed {
            phase: ValidationPhase::Entry,
            status: ItemStatus::Encoded,
            errors,
        }) => {
            assert_eq!(
                errors,
                vec!["Encoded file path required for encoded state".to_string()]
            );
        }
        other => panic!("expected entry validation failure, got {other:?}"),
    }

    let unchanged = orchestrator.item(item.id).await.expect("load");
    assert_eq!(unchanged.status, ItemStatus::Encoding);
}

#[tokio::test]
async fn service_tagged_errors_skip_without_consuming_attempts() {
    let (orchestrator, store) = harness();
    let mut item = seed_item(&store, ItemStatus::Searching).await;
    item.attempts = 2;
    store.seed_item(item.clone()).await;

    let before = Utc::now();
    let updated = orchestrator
        .handle_error(
            item.id,
            StageError::for_service(ErrorKind::NetworkTimeout, "request timed out", "indexer"),
        )
        .await
        .expect("handle error");

    assert_eq!(updated.attempts, 2, "skip-until must not consume attempts");
    assert!(updated.skip_until.expect("skip gate") > before);
    assert!(updated.next_retry_at.is_none());
    // Searching has no polling worker; the retry lands back in pending.
    assert_eq!(updated.status, ItemStatus::Pending);
    assert_eq!(updated.error_history.len(), 1);
    assert_eq!(updated.error_history[0].kind, "network_timeout");
}

#[tokio::test]
async fn transient_errors_consume_an_attempt_and_gate_the_item() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Downloading).await;

    let before = Utc::now();
    let updated = orchestrator
        .handle_error(
            item.id,
            StageError::new(ErrorKind::Stalled, "download stalled"),
        )
        .await
        .expect("handle error");

    assert_eq!(updated.attempts, item.attempts + 1);
    assert!(updated.next_retry_at.expect("retry gate") > before);
    assert!(updated.skip_until.is_none());
    // Processing statuses are preserved so the same worker re-claims the item.
    assert_eq!(updated.status, ItemStatus::Downloading);
}

#[tokio::test]
async fn exhausted_retry_budget_turns_terminal() {
    let (orchestrator, store) = harness();
    let mut item = seed_item(&store, ItemStatus::Downloading).await;
    item.attempts = item.max_attempts;
    store.seed_item(item.clone()).await;

    let updated = orchestrator
        .handle_error(
            item.id,
            StageError::new(ErrorKind::Stalled, "download stalled"),
        )
        .await
        .expect("handle error");
    assert_eq!(updated.status, ItemStatus::Failed);
    assert_eq!(updated.attempts, item.max_attempts);
}

#[tokio::test]
async fn terminal_kinds_fail_immediately() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Encoding).await;

    let updated = orchestrator
        .handle_error(
            item.id,
            StageError::new(ErrorKind::DiskFull, "no space left on device"),
        )
        .await
        .expect("handle error");
    assert_eq!(updated.status, ItemStatus::Failed);
    assert_eq!(updated.last_error.as_deref(), Some("no space left on device"));
}

#[tokio::test]
async fn manual_retry_resets_the_item() {
    let (orchestrator, store) = harness();
    let mut item = seed_item(&store, ItemStatus::Failed).await;
    item.attempts = 4;
    item.progress = 80;
    item.last_error = Some("encode failed".to_string());
    item.next_retry_at = Some(Utc::now() + Duration::hours(1));
    store.seed_item(item.clone()).await;

    let updated = orchestrator.retry(item.id).await.expect("retry");
    assert_eq!(updated.status, ItemStatus::Pending);
    assert_eq!(updated.attempts, 0);
    assert_eq!(updated.progress, 0);
    assert!(updated.last_error.is_none());
    assert!(updated.next_retry_at.is_none());
    assert!(updated.skip_until.is_none());

    // Retry is only legal from failed.
    let denied = orchestrator.retry(item.id).await;
    assert!(matches!(
        denied,
        Err(PipelineError::RetryFromNonFailed { .. })
    ));
}

#[tokio::test]
async fn cancel_refuses_terminal_items_and_flips_active_ones() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Delivering).await;

    let cancelled = orchestrator.cancel(item.id).await.expect("cancel");
    assert_eq!(cancelled.status, ItemStatus::Cancelled);

    let denied = orchestrator.cancel(item.id).await;
    assert!(matches!(denied, Err(PipelineError::TerminalStatus { .. })));
}

#[tokio::test]
async fn skip_until_does_not_block_cancellation() {
    let (orchestrator, store) = harness();
    let mut item = seed_item(&store, ItemStatus::Downloaded).await;
    item.skip_until = Some(Utc::now() + Duration::minutes(5));
    store.seed_item(item.clone()).await;

    let cancelled = orchestrator.cancel(item.id).await.expect("cancel");
    assert_eq!(cancelled.status, ItemStatus::Cancelled);
}

#[tokio::test]
async fn progress_is_debounced_and_monotonic() {
    let (orchestrator, store) = harness();
    let mut item = seed_item(&store, ItemStatus::Downloading).await;
    item.progress = 50;
    item.last_progress_value = Some(50);
    store.seed_item(item.clone()).await;

    let same = orchestrator
        .update_progress(item.id, 50)
        .await
        .expect("same value");
    assert_eq!(same.progress, 50);

    let lower = orchestrator
        .update_progress(item.id, 40)
        .await
        .expect("lower value");
    assert_eq!(lower.progress, 50, "persisted progress must never decrease");

    let higher = orchestrator
        .update_progress(item.id, 51)
        .await
        .expect("higher value");
    assert_eq!(higher.progress, 51);
    assert_eq!(higher.last_progress_value, Some(51));
    assert!(higher.last_progress_update.is_some());
}

#[tokio::test]
async fn retry_gate_boundary_controls_eligibility() {
    let (orchestrator, store) = harness();
    let request = movie_request();
    store.seed_request(request.clone()).await;

    let mut past = ProcessingItem::new(&request, ItemKind::Movie);
    past.next_retry_at = Some(Utc::now() - Duration::seconds(1));
    store.seed_item(past.clone()).await;

    let mut future = ProcessingItem::new(&request, ItemKind::Movie);
    future.next_retry_at = Some(Utc::now() + Duration::seconds(1));
    store.seed_item(future.clone()).await;

    let eligible = orchestrator
        .items_for_processing(ItemStatus::Pending)
        .await
        .expect("query");
    let ids: Vec<_> = eligible.iter().map(|item| item.id).collect();
    assert!(ids.contains(&past.id));
    assert!(!ids.contains(&future.id));
}

#[tokio::test]
async fn aggregates_follow_item_outcomes() {
    let (orchestrator, _) = harness();
    let (request, items) = orchestrator
        .create_request(movie_new_request())
        .await
        .expect("request");
    let item = &items[0];

    orchestrator
        .transition(
            item.id,
            ItemStatus::Searching,
            TransitionPatch::default(),
        )
        .await
        .expect("searching");
    orchestrator
        .transition(
            item.id,
            ItemStatus::Found,
            TransitionPatch {
                step_context: Some(StepContext {
                    search: Some(SearchContext {
                        selected_release: Some(sample_release(
                            "Inception.2010.1080p.BluRay",
                            2_254_857_830,
                            120,
                        )),
                        ..SearchContext::default()
                    }),
                    ..StepContext::default()
                }),
                ..TransitionPatch::default()
            },
        )
        .await
        .expect("found");

    let loaded = orchestrator.request(request.id).await.expect("request");
    assert_eq!(
        loaded.status,
        fetcharr_pipeline::model::RequestStatus::Processing
    );
}

#[tokio::test]
async fn rate_limit_retry_after_is_honoured() {
    let (orchestrator, store) = harness();
    let item = seed_item(&store, ItemStatus::Pending).await;

    let before = Utc::now();
    let updated = orchestrator
        .handle_error(
            item.id,
            StageError::for_service(ErrorKind::RateLimited, "429 too many requests", "indexer")
                .with_retry_after(StdDuration::from_secs(90)),
        )
        .await
        .expect("handle error");

    let gate = updated.skip_until.expect("skip gate");
    let delta = gate - before;
    assert!(delta >= Duration::seconds(85) && delta <= Duration::seconds(95));
}

#[tokio::test]
async fn per_request_target_helper_survives_round_trip() {
    // Guard against target fixture drift breaking the quality requirement.
    let t = target("alpha", fetcharr_pipeline::model::Resolution::Uhd2160);
    assert_eq!(t.server_name, "alpha");
    assert_eq!(
        t.resolution,
        Some(fetcharr_pipeline::model::Resolution::Uhd2160)
    );
}
