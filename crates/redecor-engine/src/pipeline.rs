use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use redecor_contracts::plan::{EditOperation, EditPlan, OperationKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backends::{GenerativeBackend, InpaintRequest};
use crate::error::{error_chain_text, EngineError, EngineResult};
use crate::mask::resolve_mask;
use crate::progress::{ProgressSink, ProgressStatus, ProgressUpdate};
use crate::retry::{with_retries, RetryPolicy};

const QUALITY_SUFFIX: &str = "realistic, high quality, professional photography";

/// Everything one pipeline run needs besides the plan and the image.
#[derive(Clone)]
pub struct PipelineContext {
    pub job_id: String,
    /// Id progress is reported under; usually the caller's project.
    pub target_id: String,
    pub backend: Arc<dyn GenerativeBackend>,
    pub sink: Arc<dyn ProgressSink>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed(DynamicImage),
    /// Cancellation was observed after `completed_steps` steps finished.
    Cancelled { completed_steps: usize },
}

pub fn build_prompt(operation: &EditOperation, room_type: &str) -> String {
    let room = room_type.replace('_', " ");
    let target = operation.target_label.as_str();
    let param = |key: &str| operation.text_param(key).unwrap_or("");
    match operation.kind {
        OperationKind::Recolor => format!(
            "{target} in {} color, {room}, {QUALITY_SUFFIX}",
            param("color")
        ),
        OperationKind::Texture => format!(
            "{target} with {} texture, {room}, {QUALITY_SUFFIX}",
            param("material")
        ),
        OperationKind::Lighting => format!(
            "{target} with {} lighting, {room}, {QUALITY_SUFFIX}",
            param("style")
        ),
        OperationKind::General => {
            let subject = operation
                .text_param("prompt")
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .unwrap_or(target);
            format!("{subject} in {room}, {QUALITY_SUFFIX}")
        }
    }
}

/// Applies the plan's operations in order, each to the previous step's output.
///
/// The cancellation token is checked before every step and again after each
/// backend call. A step already handed to the backend always runs to
/// completion, but its result is dropped once cancellation is seen.
pub async fn execute_pipeline(
    ctx: &PipelineContext,
    source: DynamicImage,
    plan: &EditPlan,
) -> EngineResult<PipelineOutcome> {
    if plan.operations.is_empty() {
        return Err(EngineError::Validation(
            "edit plan has no operations".to_string(),
        ));
    }

    let total = plan.operations.len();
    let mut current = source;
    for (index, operation) in plan.operations.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            info!(job_id = %ctx.job_id, completed_steps = index, "pipeline cancelled");
            ctx.sink
                .notify(
                    &ctx.target_id,
                    ProgressUpdate::new(
                        ProgressStatus::Cancelled,
                        percent(index, total),
                        format!("Cancelled after {index}/{total} edits"),
                    ),
                )
                .await;
            return Ok(PipelineOutcome::Cancelled {
                completed_steps: index,
            });
        }

        let step = index + 1;
        let mask = resolve_mask(operation, current.dimensions());
        let prompt = build_prompt(operation, &plan.room_type);
        info!(
            job_id = %ctx.job_id,
            step,
            total,
            operation = %operation.kind,
            target = %operation.target_label,
            "applying edit"
        );

        let request = InpaintRequest::new(current, mask, prompt, operation.strength());
        let backend = ctx.backend.as_ref();
        match with_retries(backend.name(), &ctx.retry, || backend.inpaint(&request)).await {
            Ok(image) => current = image,
            Err(err) => {
                let err = EngineError::Execution {
                    job_id: ctx.job_id.clone(),
                    step,
                    operation: operation.kind.to_string(),
                    source: Box::new(err),
                };
                let message = error_chain_text(&err, 480);
                warn!(job_id = %ctx.job_id, step, error = %message, "edit failed");
                ctx.sink
                    .notify(
                        &ctx.target_id,
                        ProgressUpdate::new(ProgressStatus::Failed, percent(index, total), message)
                            .with_step(step),
                    )
                    .await;
                return Err(err);
            }
        }

        if ctx.cancel.is_cancelled() {
            info!(job_id = %ctx.job_id, completed_steps = step, "pipeline cancelled");
            ctx.sink
                .notify(
                    &ctx.target_id,
                    ProgressUpdate::new(
                        ProgressStatus::Cancelled,
                        percent(step, total),
                        format!("Cancelled after {step}/{total} edits"),
                    )
                    .with_step(step),
                )
                .await;
            return Ok(PipelineOutcome::Cancelled {
                completed_steps: step,
            });
        }

        let status = if step == total {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Processing
        };
        ctx.sink
            .notify(
                &ctx.target_id,
                ProgressUpdate::new(
                    status,
                    percent(step, total),
                    format!("Completed {step}/{total} edits"),
                )
                .with_step(step),
            )
            .await;
    }

    Ok(PipelineOutcome::Completed(current))
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (done * 100 / total).min(100) as u8
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use redecor_contracts::catalog::Catalog;
    use redecor_contracts::plan::{compile_plan, EditOperation, OperationKind, Parameters, Scalar};
    use tokio_util::sync::CancellationToken;

    use super::{build_prompt, execute_pipeline, PipelineContext, PipelineOutcome};
    use crate::backends::{GenerativeBackend, InpaintRequest};
    use crate::error::EngineError;
    use crate::progress::{ChannelProgressSink, NullProgressSink, ProgressStatus};
    use crate::retry::{HttpStatusError, RetryPolicy};

    /// Records every request and returns the input with one pixel bumped.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub calls: Mutex<Vec<(Vec<u8>, String)>>,
        pub fail_on_call: Option<usize>,
        pub cancel_after_call: Option<CancellationToken>,
    }

    #[async_trait]
    impl GenerativeBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn inpaint(&self, request: &InpaintRequest) -> anyhow::Result<DynamicImage> {
            let mut image = request.image.to_rgb8();
            let call = {
                let mut calls = self
                    .calls
                    .lock()
                    .map_err(|_| anyhow!("recording lock poisoned"))?;
                calls.push((image.as_raw().clone(), request.prompt.clone()));
                calls.len()
            };
            if let Some(token) = &self.cancel_after_call {
                token.cancel();
            }
            if self.fail_on_call == Some(call) {
                return Err(anyhow::Error::new(HttpStatusError {
                    status: 400,
                    body: "unsupported mask".to_string(),
                }));
            }
            let pixel = image.get_pixel_mut(0, 0);
            pixel[0] = pixel[0].wrapping_add(1);
            Ok(DynamicImage::ImageRgb8(image))
        }
    }

    pub(crate) fn test_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])))
    }

    fn context(backend: Arc<RecordingBackend>) -> PipelineContext {
        PipelineContext {
            job_id: "job-1".to_string(),
            target_id: "project-1".to_string(),
            backend,
            sink: Arc::new(NullProgressSink),
            retry: RetryPolicy::new(2, Duration::from_secs(5), Duration::ZERO),
            cancel: CancellationToken::new(),
        }
    }

    fn two_step_plan() -> redecor_contracts::plan::EditPlan {
        compile_plan(
            "make the wall white, add warm lighting",
            &Catalog::new(),
            "living_room",
            None,
        )
    }

    fn operation(kind: OperationKind, key: &str, value: &str) -> EditOperation {
        let mut parameters = Parameters::new();
        parameters.insert(key.to_string(), Scalar::from(value));
        EditOperation {
            target_label: "wall".to_string(),
            kind,
            parameters,
            resolved_mask: None,
            confidence: 0.9,
            warning: None,
        }
    }

    #[test]
    fn prompts_follow_operation_templates() {
        assert_eq!(
            build_prompt(&operation(OperationKind::Recolor, "color", "sage"), "living_room"),
            "wall in sage color, living room, realistic, high quality, professional photography"
        );
        assert_eq!(
            build_prompt(&operation(OperationKind::Texture, "material", "oak"), "kitchen"),
            "wall with oak texture, kitchen, realistic, high quality, professional photography"
        );
        assert_eq!(
            build_prompt(&operation(OperationKind::Lighting, "style", "warm"), "bedroom"),
            "wall with warm lighting, bedroom, realistic, high quality, professional photography"
        );
        assert_eq!(
            build_prompt(
                &operation(OperationKind::General, "prompt", "cozier vibe"),
                "dining_room"
            ),
            "cozier vibe in dining room, realistic, high quality, professional photography"
        );
    }

    #[tokio::test]
    async fn steps_chain_through_the_backend() -> anyhow::Result<()> {
        let backend = Arc::new(RecordingBackend::default());
        let plan = two_step_plan();
        assert_eq!(plan.operations.len(), 2);

        let outcome = execute_pipeline(&context(backend.clone()), test_image(), &plan).await?;
        let PipelineOutcome::Completed(image) = outcome else {
            panic!("pipeline did not complete");
        };

        let calls = backend.calls.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0[0], 100);
        // The second call saw the first call's output.
        assert_eq!(calls[1].0[0], 101);
        assert!(calls[0].1.starts_with("wall in white color"));
        assert!(calls[1].1.starts_with("ceiling with warm lighting"));
        assert_eq!(image.to_rgb8().get_pixel(0, 0)[0], 102);
        Ok(())
    }

    #[tokio::test]
    async fn progress_reaches_one_hundred() -> anyhow::Result<()> {
        let backend = Arc::new(RecordingBackend::default());
        let (sink, mut rx) = ChannelProgressSink::new();
        let mut ctx = context(backend);
        ctx.sink = Arc::new(sink);

        execute_pipeline(&ctx, test_image(), &two_step_plan()).await?;
        drop(ctx);

        let mut updates = Vec::new();
        while let Some((target, update)) = rx.recv().await {
            assert_eq!(target, "project-1");
            updates.push((update.status, update.progress));
        }
        assert_eq!(
            updates,
            vec![
                (ProgressStatus::Processing, 50),
                (ProgressStatus::Completed, 100)
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_step_aborts_the_rest() {
        let backend = Arc::new(RecordingBackend {
            fail_on_call: Some(1),
            ..RecordingBackend::default()
        });
        let (sink, mut rx) = ChannelProgressSink::new();
        let mut ctx = context(backend.clone());
        ctx.sink = Arc::new(sink);

        let result = execute_pipeline(&ctx, test_image(), &two_step_plan()).await;
        match result {
            Err(EngineError::Execution { step, operation, .. }) => {
                assert_eq!(step, 1);
                assert_eq!(operation, "recolor");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(backend.calls.lock().map(|calls| calls.len()).unwrap_or(0), 1);
        let failed = rx.recv().await.map(|(_, update)| update.status);
        assert_eq!(failed, Some(ProgressStatus::Failed));
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_steps() -> anyhow::Result<()> {
        let mut ctx = context(Arc::new(RecordingBackend::default()));
        let token = ctx.cancel.clone();
        let backend = Arc::new(RecordingBackend {
            cancel_after_call: Some(token),
            ..RecordingBackend::default()
        });
        ctx.backend = backend.clone();

        let outcome = execute_pipeline(&ctx, test_image(), &two_step_plan()).await?;
        assert!(matches!(
            outcome,
            PipelineOutcome::Cancelled { completed_steps: 1 }
        ));
        assert_eq!(backend.calls.lock().map(|calls| calls.len()).unwrap_or(0), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_during_the_last_step_reports_cancelled() -> anyhow::Result<()> {
        let (sink, mut rx) = ChannelProgressSink::new();
        let mut ctx = context(Arc::new(RecordingBackend::default()));
        ctx.sink = Arc::new(sink);
        ctx.backend = Arc::new(RecordingBackend {
            cancel_after_call: Some(ctx.cancel.clone()),
            ..RecordingBackend::default()
        });
        let plan = compile_plan("make the wall white", &Catalog::new(), "living_room", None);

        let outcome = execute_pipeline(&ctx, test_image(), &plan).await?;
        assert!(matches!(
            outcome,
            PipelineOutcome::Cancelled { completed_steps: 1 }
        ));
        drop(ctx);

        let mut statuses = Vec::new();
        while let Some((_, update)) = rx.recv().await {
            statuses.push(update.status);
        }
        assert_eq!(statuses, vec![ProgressStatus::Cancelled]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let mut plan = two_step_plan();
        plan.operations.clear();
        let result =
            execute_pipeline(&context(Arc::new(RecordingBackend::default())), test_image(), &plan)
                .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
