//! Row decoding helpers shared by the store queries.

use anyhow::Context;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::context::{DeliveryCheckpoint, StepContext};
use fetcharr_pipeline::model::{
    DeliveryTarget, ErrorEvent, ItemKind, MediaRequest, MediaType, PipelineTemplate,
    ProcessingItem, RequestStatus,
};
use fetcharr_pipeline::store::DownloadRecord;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Row, types::Json};

fn clamp_u8(value: i16) -> u8 {
    u8::try_from(value).unwrap_or(0)
}

fn clamp_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub(crate) fn decode_request(row: &PgRow) -> anyhow::Result<MediaRequest> {
    let media_type: String = row.try_get("media_type")?;
    let status: String = row.try_get("status")?;
    let Json(targets): Json<Vec<DeliveryTarget>> = row.try_get("targets")?;
    let pipeline = match row.try_get::<Option<Json<Value>>, _>("pipeline")? {
        Some(Json(value)) if !value.is_null() => Some(
            serde_json::from_value::<PipelineTemplate>(value)
                .context("failed to decode persisted pipeline template")?,
        ),
        _ => None,
    };

    Ok(MediaRequest {
        id: row.try_get("id")?,
        media_type: MediaType::parse(&media_type)
            .with_context(|| format!("unknown media type label {media_type:?}"))?,
        catalog_id: row.try_get("catalog_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        year: row.try_get("year")?,
        targets,
        pipeline,
        status: RequestStatus::parse(&status)
            .with_context(|| format!("unknown request status label {status:?}"))?,
        progress: clamp_u8(row.try_get("progress")?),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn decode_item(row: &PgRow) -> anyhow::Result<ProcessingItem> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let Json(step_context): Json<StepContext> = row.try_get("step_context")?;
    let Json(checkpoint): Json<DeliveryCheckpoint> = row.try_get("checkpoint")?;
    let Json(error_history): Json<Vec<ErrorEvent>> = row.try_get("error_history")?;

    Ok(ProcessingItem {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        kind: ItemKind::parse(&kind)
            .with_context(|| format!("unknown item kind label {kind:?}"))?,
        catalog_id: row.try_get("catalog_id")?,
        title: row.try_get("title")?,
        year: row.try_get("year")?,
        season: row.try_get("season")?,
        episode: row.try_get("episode")?,
        status: ItemStatus::parse(&status)
            .with_context(|| format!("unknown item status label {status:?}"))?,
        current_step: row.try_get("current_step")?,
        step_context,
        checkpoint,
        attempts: clamp_u32(row.try_get("attempts")?),
        max_attempts: clamp_u32(row.try_get("max_attempts")?),
        last_error: row.try_get("last_error")?,
        error_history,
        next_retry_at: row.try_get("next_retry_at")?,
        skip_until: row.try_get("skip_until")?,
        cooldown_ends_at: row.try_get("cooldown_ends_at")?,
        download_id: row.try_get("download_id")?,
        encoding_job_id: row.try_get("encoding_job_id")?,
        progress: clamp_u8(row.try_get("progress")?),
        last_progress_update: row.try_get("last_progress_update")?,
        last_progress_value: row
            .try_get::<Option<i16>, _>("last_progress_value")?
            .map(clamp_u8),
        downloaded_at: row.try_get("downloaded_at")?,
        encoded_at: row.try_get("encoded_at")?,
        delivered_at: row.try_get("delivered_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn decode_download(row: &PgRow) -> anyhow::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        torrent_hash: row.try_get("torrent_hash")?,
        torrent_name: row.try_get("torrent_name")?,
        progress: clamp_u8(row.try_get("progress")?),
        save_path: row.try_get("save_path")?,
        content_path: row.try_get("content_path")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
