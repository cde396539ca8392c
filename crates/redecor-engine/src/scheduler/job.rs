use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use redecor_contracts::catalog::normalize;
use redecor_contracts::plan::{compile_plan, EditPlan, Preferences};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backends::{Detector, GenerativeBackend};
use crate::error::{error_chain_text, EngineError, EngineResult};
use crate::pipeline::{execute_pipeline, PipelineContext, PipelineOutcome};
use crate::progress::{ProgressSink, ProgressStatus, ProgressUpdate};
use crate::retry::{with_retries, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators shared by every job a scheduler runs.
#[derive(Clone)]
pub struct JobResources {
    pub detector: Arc<dyn Detector>,
    pub backend: Arc<dyn GenerativeBackend>,
    pub sink: Arc<dyn ProgressSink>,
    pub detector_retry: RetryPolicy,
    pub inference_retry: RetryPolicy,
}

/// The unit of GPU work a job carries.
#[derive(Debug, Clone)]
pub enum JobWork {
    /// Run an already compiled plan.
    Edit {
        plan: EditPlan,
        image: DynamicImage,
        target_id: String,
    },
    /// Detect, compile, then run.
    PromptEdit {
        prompt: String,
        image_bytes: Vec<u8>,
        preferences: Option<Preferences>,
        target_id: String,
    },
}

impl JobWork {
    pub fn target_id(&self) -> &str {
        match self {
            Self::Edit { target_id, .. } | Self::PromptEdit { target_id, .. } => target_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Edit { .. } => "edit",
            Self::PromptEdit { .. } => "prompt_edit",
        }
    }

    /// Checks that can be made before the job is queued.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Edit { plan, .. } => {
                if !plan.is_valid() {
                    let reason = if plan.validation.warnings.is_empty() {
                        "edit plan has no operations".to_string()
                    } else {
                        plan.validation.warnings.join("; ")
                    };
                    return Err(EngineError::Validation(reason));
                }
            }
            Self::PromptEdit {
                prompt,
                image_bytes,
                ..
            } => {
                if prompt.trim().is_empty() {
                    return Err(EngineError::Validation("prompt is empty".to_string()));
                }
                if image_bytes.is_empty() {
                    return Err(EngineError::Validation("image is empty".to_string()));
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn execute(
        self,
        job_id: &str,
        cancel: &CancellationToken,
        resources: &JobResources,
    ) -> EngineResult<WorkOutcome> {
        let target_id = self.target_id().to_string();
        let (plan, image) = match self {
            Self::Edit { plan, image, .. } => (plan, image),
            Self::PromptEdit {
                prompt,
                image_bytes,
                preferences,
                ..
            } => {
                let prepared =
                    prepare_prompt_edit(&prompt, &image_bytes, preferences.as_ref(), resources)
                        .await;
                match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        resources
                            .sink
                            .notify(
                                &target_id,
                                ProgressUpdate::new(
                                    ProgressStatus::Failed,
                                    0,
                                    error_chain_text(&err, 480),
                                ),
                            )
                            .await;
                        return Err(err);
                    }
                }
            }
        };

        let ctx = PipelineContext {
            job_id: job_id.to_string(),
            target_id,
            backend: resources.backend.clone(),
            sink: resources.sink.clone(),
            retry: resources.inference_retry,
            cancel: cancel.clone(),
        };
        let outcome = execute_pipeline(&ctx, image, &plan).await?;
        Ok(WorkOutcome { plan, outcome })
    }
}

async fn prepare_prompt_edit(
    prompt: &str,
    image_bytes: &[u8],
    preferences: Option<&Preferences>,
    resources: &JobResources,
) -> EngineResult<(EditPlan, DynamicImage)> {
    let image = image::load_from_memory(image_bytes)
        .map_err(|err| EngineError::Validation(format!("image could not be decoded: {err}")))?;

    let detector = resources.detector.as_ref();
    let analysis = with_retries(detector.name(), &resources.detector_retry, || {
        detector.analyze(image_bytes)
    })
    .await?;
    let catalog = normalize(&analysis.objects);
    let plan = compile_plan(prompt, &catalog, &analysis.room_type, preferences);
    info!(
        room_type = %plan.room_type,
        operations = plan.operations.len(),
        warnings = plan.validation.warnings.len(),
        "compiled edit plan"
    );
    if !plan.is_valid() {
        return Err(EngineError::Validation(plan.validation.warnings.join("; ")));
    }
    Ok((plan, image))
}

pub(crate) struct WorkOutcome {
    pub plan: EditPlan,
    pub outcome: PipelineOutcome,
}

/// How a job ended, delivered once through its ticket.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { image: DynamicImage, plan: EditPlan },
    Failed(String),
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Handle returned by a successful submit.
#[derive(Debug)]
pub struct JobTicket {
    pub id: String,
    pub outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub async fn wait(self) -> JobOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("job was dropped by the scheduler".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Running; it stops at the next step boundary.
    Cancelling,
    /// Still queued; it will be skipped.
    Dequeued,
    /// Not queued or running.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub active_count: usize,
    pub queue_depth: usize,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub kind: &'static str,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SchedulerTelemetry {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    /// Every job that ended cancelled, discarded ones included.
    pub cancelled: u64,
    /// Queued jobs skipped at admission because they were cancelled.
    pub discarded: u64,
}
