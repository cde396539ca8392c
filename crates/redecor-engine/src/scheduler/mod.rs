mod job;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use job::{
    CancelOutcome, JobOutcome, JobResources, JobSnapshot, JobStatus, JobTicket, JobWork,
    QueueStatus, SchedulerTelemetry,
};

use crate::config::SchedulerConfig;
use crate::error::{error_chain_text, EngineError, EngineResult};
use crate::pipeline::PipelineOutcome;
use crate::progress::{ProgressStatus, ProgressUpdate};

struct QueuedJob {
    id: String,
    work: JobWork,
    created_at: DateTime<Utc>,
    outcome_tx: oneshot::Sender<JobOutcome>,
}

struct ActiveJob {
    status: JobStatus,
    kind: &'static str,
    target_id: String,
    created_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    active: HashMap<String, ActiveJob>,
    pending: VecDeque<QueuedJob>,
    cancelled: HashSet<String>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    resources: JobResources,
    permits: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    counters: Counters,
    shut_down: AtomicBool,
}

/// Admission control for GPU work.
///
/// At most `max_concurrent` jobs hold a slot at once; a finished job keeps its
/// slot through the completion grace period. Further jobs wait in FIFO order,
/// up to `max_queue_depth` of them.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, resources: JobResources) -> Self {
        let slots = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                permits: Arc::new(Semaphore::new(slots)),
                config: SchedulerConfig {
                    max_concurrent: slots,
                    ..config
                },
                resources,
                state: Mutex::new(SchedulerState::default()),
                counters: Counters::default(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub async fn submit(&self, work: JobWork) -> EngineResult<JobTicket> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::ShutDown);
        }
        if let Err(err) = work.validate() {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let id = Uuid::new_v4().to_string();
        let target_id = work.target_id().to_string();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let queue_depth = {
            let mut state = inner.state();
            let active = state.active.len();
            let queued = state.pending.len();
            let limit = inner.config.max_concurrent + inner.config.max_queue_depth;
            if active + queued >= limit {
                inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(active, queued, limit, "GPU queue full, rejecting job");
                return Err(EngineError::CapacityExceeded {
                    active,
                    queued,
                    limit,
                });
            }
            state.pending.push_back(QueuedJob {
                id: id.clone(),
                work,
                created_at: Utc::now(),
                outcome_tx,
            });
            state.pending.len()
        };
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %id, queue_depth, "job queued");

        inner
            .resources
            .sink
            .notify(
                &target_id,
                ProgressUpdate::new(ProgressStatus::Queued, 0, "Waiting for a GPU slot"),
            )
            .await;
        inner.drain();

        Ok(JobTicket {
            id,
            outcome: outcome_rx,
        })
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.inner.state();
        if let Some(active) = state.active.get_mut(job_id) {
            if active.status.is_terminal() {
                return CancelOutcome::Unknown;
            }
            active.status = JobStatus::Cancelling;
            active.cancel.cancel();
            info!(job_id, "cancelling running job");
            return CancelOutcome::Cancelling;
        }
        if state.pending.iter().any(|job| job.id == job_id) {
            state.cancelled.insert(job_id.to_string());
            info!(job_id, "queued job marked cancelled");
            return CancelOutcome::Dequeued;
        }
        CancelOutcome::Unknown
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.inner.state();
        QueueStatus {
            active_count: state.active.len(),
            queue_depth: state.pending.len(),
            max_concurrent: self.inner.config.max_concurrent,
            max_queue_depth: self.inner.config.max_queue_depth,
        }
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobSnapshot> {
        let state = self.inner.state();
        if let Some(active) = state.active.get(job_id) {
            return Some(JobSnapshot {
                id: job_id.to_string(),
                status: active.status,
                kind: active.kind,
                target_id: active.target_id.clone(),
                created_at: active.created_at,
                started_at: Some(active.started_at),
                finished_at: active.finished_at,
                error: active.error.clone(),
            });
        }
        state.pending.iter().find(|job| job.id == job_id).map(|job| {
            let status = if state.cancelled.contains(job_id) {
                JobStatus::Cancelling
            } else {
                JobStatus::Queued
            };
            JobSnapshot {
                id: job.id.clone(),
                status,
                kind: job.work.kind(),
                target_id: job.work.target_id().to_string(),
                created_at: job.created_at,
                started_at: None,
                finished_at: None,
                error: None,
            }
        })
    }

    pub fn telemetry(&self) -> SchedulerTelemetry {
        let counters = &self.inner.counters;
        SchedulerTelemetry {
            submitted: counters.submitted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Refuses new work, resolves queued jobs as cancelled and asks running
    /// jobs to stop at their next step boundary.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = inner.state();
        let pending: Vec<QueuedJob> = state.pending.drain(..).collect();
        state.cancelled.clear();
        for job in pending {
            inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            let _ = job.outcome_tx.send(JobOutcome::Cancelled);
        }
        for active in state.active.values_mut() {
            if !active.status.is_terminal() {
                active.status = JobStatus::Cancelling;
                active.cancel.cancel();
            }
        }
        info!(active = state.active.len(), "scheduler shut down");
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves queued jobs into free slots. Safe to call from anywhere, any
    /// number of times; admission happens entirely under the state lock.
    fn drain(self: &Arc<Self>) {
        let mut state = self.state();
        while !state.pending.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = state.pending.pop_front() else {
                break;
            };

            if state.cancelled.remove(&job.id) {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.id, "skipping cancelled job");
                let _ = job.outcome_tx.send(JobOutcome::Cancelled);
                drop(permit);
                continue;
            }

            let cancel = CancellationToken::new();
            state.active.insert(
                job.id.clone(),
                ActiveJob {
                    status: JobStatus::Processing,
                    kind: job.work.kind(),
                    target_id: job.work.target_id().to_string(),
                    created_at: job.created_at,
                    started_at: Utc::now(),
                    finished_at: None,
                    error: None,
                    cancel: cancel.clone(),
                },
            );
            info!(
                job_id = %job.id,
                active = state.active.len(),
                queued = state.pending.len(),
                "job started"
            );
            tokio::spawn(Arc::clone(self).run(job, cancel, permit));
        }
    }

    async fn run(self: Arc<Self>, job: QueuedJob, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
        let QueuedJob {
            id,
            work,
            outcome_tx,
            ..
        } = job;
        let mut slot = JobSlot {
            inner: Arc::clone(&self),
            id: id.clone(),
            permit: Some(permit),
            reported: false,
        };

        let target_id = work.target_id().to_string();
        let result = work.execute(&id, &cancel, &self.resources).await;
        let outcome = match result {
            Ok(done) => match done.outcome {
                PipelineOutcome::Completed(image) if !cancel.is_cancelled() => {
                    JobOutcome::Completed {
                        image,
                        plan: done.plan,
                    }
                }
                PipelineOutcome::Completed(_) => {
                    // Cancelled after the last step reported; correct the stream.
                    self.resources
                        .sink
                        .notify(
                            &target_id,
                            ProgressUpdate::new(
                                ProgressStatus::Cancelled,
                                100,
                                "Cancelled after all edits finished",
                            ),
                        )
                        .await;
                    JobOutcome::Cancelled
                }
                PipelineOutcome::Cancelled { .. } => JobOutcome::Cancelled,
            },
            Err(err) => JobOutcome::Failed(error_chain_text(&err, 2048)),
        };
        let status = outcome.status();
        match status {
            JobStatus::Completed => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            JobStatus::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };

        {
            let mut state = self.state();
            if let Some(active) = state.active.get_mut(&id) {
                active.status = status;
                active.finished_at = Some(Utc::now());
                if let JobOutcome::Failed(message) = &outcome {
                    active.error = Some(message.clone());
                }
            }
        }
        match &outcome {
            JobOutcome::Failed(message) => warn!(job_id = %id, error = %message, "job failed"),
            _ => info!(job_id = %id, status = %status, "job finished"),
        }
        slot.reported = true;
        let _ = outcome_tx.send(outcome);

        tokio::time::sleep(self.config.completion_grace).await;
        drop(slot);
    }
}

/// A running job's hold on the active table and its semaphore permit.
/// Dropping it frees both, including when the job's task unwinds.
struct JobSlot {
    inner: Arc<SchedulerInner>,
    id: String,
    permit: Option<OwnedSemaphorePermit>,
    reported: bool,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if !self.reported {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(job_id = %self.id, "job ended without reporting an outcome");
        }
        self.inner.state().active.remove(&self.id);
        drop(self.permit.take());
        debug!(job_id = %self.id, "job slot released");
        if tokio::runtime::Handle::try_current().is_ok() {
            self.inner.drain();
        }
    }
}
