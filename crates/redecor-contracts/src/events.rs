use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// Every line carries `type`, `job_id` and `ts`; the caller's payload is merged
/// last and may override them.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    inner: Arc<ProgressLogInner>,
}

#[derive(Debug)]
struct ProgressLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ProgressLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(
        &self,
        event_type: &str,
        job_id: &str,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("job_id".to_string(), Value::String(job_id.to_string()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("progress log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
