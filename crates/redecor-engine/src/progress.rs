use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use redecor_contracts::events::{EventPayload, ProgressLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Queued,
    Analyzing,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

impl ProgressUpdate {
    pub fn new(status: ProgressStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: progress.min(100),
            message: message.into(),
            step: None,
        }
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }
}

/// Where a job reports progress. Delivery is best effort: implementations log
/// their own failures and never surface them to the pipeline.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(&self, target_id: &str, update: ProgressUpdate);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn notify(&self, _target_id: &str, _update: ProgressUpdate) {}
}

/// Appends one `progress` event per update to a JSONL log.
#[derive(Debug, Clone)]
pub struct JsonlProgressSink {
    log: ProgressLog,
}

impl JsonlProgressSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: ProgressLog::new(path),
        }
    }
}

#[async_trait]
impl ProgressSink for JsonlProgressSink {
    async fn notify(&self, target_id: &str, update: ProgressUpdate) {
        let payload = match serde_json::to_value(&update) {
            Ok(Value::Object(map)) => map,
            _ => EventPayload::new(),
        };
        let log = self.log.clone();
        let job_id = target_id.to_string();
        let written =
            tokio::task::spawn_blocking(move || log.emit("progress", &job_id, payload)).await;
        let err = match written {
            Ok(Ok(_)) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(err) => err.to_string(),
        };
        warn!(
            target_id,
            path = %self.log.path().display(),
            error = %err,
            "failed to append progress event"
        );
    }
}

/// Forwards updates to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<(String, ProgressUpdate)>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, ProgressUpdate)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn notify(&self, target_id: &str, update: ProgressUpdate) {
        if self.tx.send((target_id.to_string(), update)).is_err() {
            warn!(target_id, "progress receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{ChannelProgressSink, JsonlProgressSink, ProgressSink, ProgressStatus, ProgressUpdate};

    #[tokio::test]
    async fn jsonl_sink_writes_progress_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let sink = JsonlProgressSink::new(&path);

        sink.notify(
            "project-7",
            ProgressUpdate::new(ProgressStatus::Processing, 50, "Completed 1/2 edits").with_step(1),
        )
        .await;

        let raw = std::fs::read_to_string(&path)?;
        let event: Value = serde_json::from_str(raw.lines().next().unwrap_or(""))?;
        assert_eq!(event["type"], json!("progress"));
        assert_eq!(event["job_id"], json!("project-7"));
        assert_eq!(event["status"], json!("processing"));
        assert_eq!(event["progress"], json!(50));
        assert_eq!(event["step"], json!(1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_updates_land_as_whole_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let sink = JsonlProgressSink::new(&path);

        let mut handles = Vec::new();
        for step in 1..=8usize {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.notify(
                    "project-3",
                    ProgressUpdate::new(ProgressStatus::Processing, 10, "working").with_step(step),
                )
                .await;
            }));
        }
        for handle in handles {
            handle.await?;
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut steps = Vec::new();
        for line in raw.lines() {
            let event: Value = serde_json::from_str(line)?;
            steps.push(event["step"].as_u64().unwrap_or(0));
        }
        steps.sort_unstable();
        assert_eq!(steps, (1..=8).collect::<Vec<u64>>());
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_log_does_not_panic() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x")?;
        let sink = JsonlProgressSink::new(blocker.join("events.jsonl"));
        sink.notify("job", ProgressUpdate::new(ProgressStatus::Failed, 0, "boom"))
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_survives_a_dropped_receiver() {
        let (sink, mut rx) = ChannelProgressSink::new();
        sink.notify("job-1", ProgressUpdate::new(ProgressStatus::Queued, 0, "queued"))
            .await;
        let received = rx.recv().await;
        assert_eq!(
            received.map(|(id, update)| (id, update.status)),
            Some(("job-1".to_string(), ProgressStatus::Queued))
        );

        drop(rx);
        sink.notify("job-1", ProgressUpdate::new(ProgressStatus::Completed, 100, "done"))
            .await;
    }

    #[test]
    fn progress_is_capped() {
        assert_eq!(
            ProgressUpdate::new(ProgressStatus::Completed, 250, "done").progress,
            100
        );
    }
}
