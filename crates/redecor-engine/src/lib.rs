pub mod backends;
pub mod config;
pub mod error;
pub mod mask;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use image::DynamicImage;
use redecor_contracts::catalog::{normalize, SceneAnalysis};
use redecor_contracts::plan::{self, EditPlan, Preferences};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::{
    Detector, DryrunBackend, GenerativeBackend, HttpDetector, HttpInpaintBackend, StaticDetector,
};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::pipeline::{PipelineContext, PipelineOutcome};
use crate::progress::ProgressSink;
use crate::retry::with_retries;
use crate::scheduler::{
    CancelOutcome, JobResources, JobSnapshot, JobTicket, JobWork, QueueStatus, Scheduler,
    SchedulerTelemetry,
};

pub use crate::error::EngineError;

/// Entry point for callers: planning, scene analysis and GPU job admission.
#[derive(Clone)]
pub struct EditService {
    scheduler: Scheduler,
    resources: JobResources,
}

impl EditService {
    pub fn new(config: &EngineConfig, resources: JobResources) -> Self {
        Self {
            scheduler: Scheduler::new(config.scheduler.clone(), resources.clone()),
            resources,
        }
    }

    /// Wires HTTP collaborators where the config names them and local
    /// stand-ins everywhere else.
    pub fn from_config(config: &EngineConfig, sink: Arc<dyn ProgressSink>) -> Self {
        let detector: Arc<dyn Detector> = match &config.detector_url {
            Some(url) => Arc::new(HttpDetector::new(url.clone(), config.detector_api_key.clone())),
            None => {
                warn!("DETECTOR_URL is not set; scenes will have no detected objects");
                Arc::new(StaticDetector::empty("unknown"))
            }
        };
        Self::with_detector(config, detector, sink)
    }

    pub fn with_detector(
        config: &EngineConfig,
        detector: Arc<dyn Detector>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let backend: Arc<dyn GenerativeBackend> = match &config.inference_url {
            Some(url) => Arc::new(HttpInpaintBackend::new(url.clone())),
            None => {
                info!("INFERENCE_SERVICE_URL is not set; using the dry-run backend");
                Arc::new(DryrunBackend)
            }
        };
        Self::new(
            config,
            JobResources {
                detector,
                backend,
                sink,
                detector_retry: config.detector_retry,
                inference_retry: config.inference_retry,
            },
        )
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn submit_job(&self, work: JobWork) -> EngineResult<JobTicket> {
        self.scheduler.submit(work).await
    }

    pub fn cancel_job(&self, job_id: &str) -> CancelOutcome {
        self.scheduler.cancel(job_id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.queue_status()
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.scheduler.job_status(job_id)
    }

    pub fn telemetry(&self) -> SchedulerTelemetry {
        self.scheduler.telemetry()
    }

    pub fn compile_plan(
        &self,
        prompt: &str,
        analysis: &SceneAnalysis,
        preferences: Option<&Preferences>,
    ) -> EditPlan {
        let catalog = normalize(&analysis.objects);
        plan::compile_plan(prompt, &catalog, &analysis.room_type, preferences)
    }

    pub async fn analyze_scene(&self, image: &[u8]) -> EngineResult<SceneAnalysis> {
        let detector = self.resources.detector.as_ref();
        with_retries(detector.name(), &self.resources.detector_retry, || {
            detector.analyze(image)
        })
        .await
    }

    /// Runs a plan right away, outside the scheduler's admission control.
    pub async fn execute_pipeline(
        &self,
        source: DynamicImage,
        plan: &EditPlan,
        target_id: &str,
        cancel: CancellationToken,
    ) -> EngineResult<PipelineOutcome> {
        let ctx = PipelineContext {
            job_id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            backend: self.resources.backend.clone(),
            sink: self.resources.sink.clone(),
            retry: self.resources.inference_retry,
            cancel,
        };
        pipeline::execute_pipeline(&ctx, source, plan).await
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
