//! Encode worker: `downloaded` → `encoded`, monitoring `encoding`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fetcharr_events::ItemStatus;
use fetcharr_pipeline::adapters::{
    AssignmentStatus, EncodeJob, EncoderAssignment, EncoderDispatcher,
};
use fetcharr_pipeline::context::{EncodeContext, EncodedFile, StepContext};
use fetcharr_pipeline::media;
use fetcharr_pipeline::model::{ItemKind, ProcessingItem, StepKind};
use fetcharr_pipeline::naming;
use fetcharr_pipeline::retry::{ErrorKind, StageError, classify_message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, TransitionPatch};
use crate::settings::EncodeSettings;
use crate::workers::{BatchStats, StageWorker, dispatch_items};

/// Queues encode jobs with the dispatcher and promotes finished assignments.
pub struct EncodeWorker {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<dyn EncoderDispatcher>,
    settings: EncodeSettings,
}

impl EncodeWorker {
    /// Construct the worker over its collaborators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<dyn EncoderDispatcher>,
        settings: EncodeSettings,
    ) -> Self {
        Self {
            orchestrator,
            dispatcher,
            settings,
        }
    }

    fn final_path(&self, item_id: Uuid) -> PathBuf {
        self.settings.output_dir.join(naming::encoded_file_name(item_id))
    }

    fn temp_path(&self, item_id: Uuid) -> PathBuf {
        self.settings.temp_dir.join(naming::encoded_temp_name(item_id))
    }

    async fn process_item(&self, item: ProcessingItem) -> Result<(), StageError> {
        match item.status {
            ItemStatus::Downloaded => self.start_encode(item).await,
            ItemStatus::Encoding => self.monitor_encode(item).await,
            other => {
                debug!(item_id = %item.id, status = %other, "encode worker skipping item");
                Ok(())
            }
        }
    }

    async fn start_encode(&self, item: ProcessingItem) -> Result<(), StageError> {
        // Early exit: a previously queued job already finished.
        if let Some(job_id) = item.encoding_job_id {
            let assignment = self
                .dispatcher
                .assignment(job_id)
                .await
                .map_err(|err| dispatcher_error(&err))?;
            if let Some(assignment) = assignment
                && assignment.status == AssignmentStatus::Completed
            {
                info!(item_id = %item.id, job_id = %job_id, "adopting completed encode assignment");
                self.enter_encoding(&item, job_id).await?;
                return self.complete_encode(&item, &assignment).await;
            }
        }

        // Early exit: the deterministic output already exists on disk.
        let final_path = self.final_path(item.id);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            info!(item_id = %item.id, path = %final_path.display(), "reusing existing encoded artifact");
            let job_id = item.encoding_job_id.unwrap_or_else(Uuid::new_v4);
            self.enter_encoding(&item, job_id).await?;
            return self
                .promote(&item, job_id, &final_path, None, None, None)
                .await;
        }

        let encoders = self
            .dispatcher
            .encoder_count()
            .await
            .map_err(|err| dispatcher_error(&err))?;
        if encoders == 0 {
            return Err(StageError::for_service(
                ErrorKind::EncoderUnavailable,
                "no encoder available",
                "encoder",
            ));
        }

        let request = self
            .orchestrator
            .request(item.request_id)
            .await
            .map_err(to_stage_error)?;
        let config = request
            .pipeline
            .as_ref()
            .and_then(|template| template.find_step(StepKind::Encode))
            .map_or_else(|| serde_json::json!({}), |step| step.config.clone());

        let input = source_path(&item).ok_or_else(|| {
            StageError::new(
                ErrorKind::Validation,
                "validation: no download source recorded for encode",
            )
        })?;

        // Stale temp outputs from a crashed attempt are discarded.
        let temp = self.temp_path(item.id);
        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!(item_id = %item.id, error = %err, "failed to remove stale temp output");
            }
        }

        let job_id = Uuid::new_v4();
        let job = EncodeJob {
            job_id,
            input_path: PathBuf::from(&input),
            output_path: temp,
            config,
        };
        self.dispatcher
            .queue_job(&job)
            .await
            .map_err(|err| dispatcher_error(&err))?;
        info!(item_id = %item.id, job_id = %job_id, input = %input, "encode job queued");
        self.enter_encoding(&item, job_id).await?;
        Ok(())
    }

    async fn enter_encoding(&self, item: &ProcessingItem, job_id: Uuid) -> Result<(), StageError> {
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Encoding,
                TransitionPatch {
                    current_step: Some("encoding".to_owned()),
                    encoding_job_id: Some(job_id),
                    progress: Some(0),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;
        Ok(())
    }

    async fn monitor_encode(&self, item: ProcessingItem) -> Result<(), StageError> {
        let Some(job_id) = item.encoding_job_id else {
            return Err(StageError::new(
                ErrorKind::NotFound,
                "encoding job handle missing",
            ));
        };
        let assignment = self
            .dispatcher
            .assignment(job_id)
            .await
            .map_err(|err| dispatcher_error(&err))?
            .ok_or_else(|| {
                StageError::new(ErrorKind::NotFound, "encoder assignment expired")
            })?;

        match assignment.status {
            AssignmentStatus::Completed => self.complete_encode(&item, &assignment).await,
            AssignmentStatus::Failed => Err(StageError::from_message(
                assignment
                    .error
                    .unwrap_or_else(|| "encode failed".to_owned()),
            )),
            AssignmentStatus::Cancelled => Err(StageError::new(
                ErrorKind::Unknown,
                "encode assignment cancelled upstream",
            )),
            AssignmentStatus::Pending | AssignmentStatus::Assigned | AssignmentStatus::Encoding => {
                let elapsed = (Utc::now() - assignment.created_at).to_std().unwrap_or_default();
                if elapsed > self.settings.wall_timeout {
                    return Err(StageError::new(
                        ErrorKind::Stalled,
                        "encode stalled: wall-clock budget exhausted",
                    ));
                }

                if assignment.progress.abs_diff(item.progress) >= 1 {
                    self.orchestrator
                        .update_progress(item.id, assignment.progress)
                        .await
                        .map_err(to_stage_error)?;
                    return Ok(());
                }

                if let Some(last_update) = item.last_progress_update {
                    let quiet = (Utc::now() - last_update).to_std().unwrap_or_default();
                    if quiet > self.settings.stall_timeout {
                        return Err(StageError::new(
                            ErrorKind::Stalled,
                            "encode stalled: no progress within the stall window",
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    async fn complete_encode(
        &self,
        item: &ProcessingItem,
        assignment: &EncoderAssignment,
    ) -> Result<(), StageError> {
        let final_path = self.final_path(item.id);
        let output = assignment
            .output_path
            .clone()
            .map_or_else(|| self.temp_path(item.id), PathBuf::from);

        // Temp outputs are renamed into the deterministic slot atomically.
        if output != final_path && tokio::fs::try_exists(&output).await.unwrap_or(false) {
            tokio::fs::rename(&output, &final_path)
                .await
                .map_err(|err| {
                    StageError::from_message(format!("failed to finalise encode output: {err}"))
                })?;
        }

        let codec = assignment
            .encoder_name
            .as_deref()
            .and_then(media::codec_from_encoder);
        self.promote(
            item,
            assignment.job_id,
            &final_path,
            codec,
            assignment.output_size,
            assignment.compression_ratio,
        )
        .await
    }

    async fn promote(
        &self,
        item: &ProcessingItem,
        job_id: Uuid,
        path: &Path,
        codec: Option<String>,
        size_bytes: Option<u64>,
        compression_ratio: Option<f64>,
    ) -> Result<(), StageError> {
        let request = self
            .orchestrator
            .request(item.request_id)
            .await
            .map_err(to_stage_error)?;
        let resolution = source_path(item)
            .as_deref()
            .and_then(media::detect_resolution)
            .or_else(|| request.required_resolution());

        let encoded = EncodedFile {
            path: path.to_string_lossy().into_owned(),
            resolution,
            codec,
            target_server_ids: request.targets.iter().map(|t| t.server_id).collect(),
            season: (item.kind == ItemKind::Episode).then(|| item.season).flatten(),
            episode: (item.kind == ItemKind::Episode).then(|| item.episode).flatten(),
            size_bytes,
            compression_ratio,
        };

        info!(item_id = %item.id, path = %encoded.path, "encode complete");
        self.orchestrator
            .transition(
                item.id,
                ItemStatus::Encoded,
                TransitionPatch {
                    current_step: Some("encode_complete".to_owned()),
                    progress: Some(100),
                    encoding_job_id: Some(job_id),
                    step_context: Some(StepContext {
                        encode: Some(EncodeContext {
                            job_id: Some(job_id),
                            encoded_files: vec![encoded],
                        }),
                        ..StepContext::default()
                    }),
                    ..TransitionPatch::default()
                },
            )
            .await
            .map_err(to_stage_error)?;
        Ok(())
    }
}

#[async_trait]
impl StageWorker for EncodeWorker {
    fn name(&self) -> &'static str {
        "encode"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.worker.poll_interval
    }

    async fn process_batch(&self) -> anyhow::Result<BatchStats> {
        let mut items = self
            .orchestrator
            .items_for_processing(ItemStatus::Downloaded)
            .await?;
        items.extend(
            self.orchestrator
                .items_for_processing(ItemStatus::Encoding)
                .await?,
        );
        Ok(dispatch_items(
            &self.orchestrator,
            "encode",
            items,
            self.settings.worker.max_concurrent_items,
            |item| self.process_item(item),
        )
        .await)
    }
}

/// Source file the encode reads: the item's own episode file when present,
/// otherwise the single resolved source path.
fn source_path(item: &ProcessingItem) -> Option<String> {
    let download = item.step_context.download.as_ref()?;
    if item.kind == ItemKind::Episode {
        let matched = download.episode_files.iter().find(|file| {
            Some(file.season) == item.season && Some(file.episode) == item.episode
        });
        if let Some(file) = matched {
            return Some(file.path.clone());
        }
    }
    download.source_file_path.clone()
}

fn dispatcher_error(err: &anyhow::Error) -> StageError {
    let message = err.to_string();
    StageError::for_service(classify_message(&message), message, "encoder")
}

fn to_stage_error(err: fetcharr_pipeline::PipelineError) -> StageError {
    StageError::new(ErrorKind::Unknown, err.to_string())
}
