use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10;
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
    /// How long a finished job stays visible in the active table.
    pub completion_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            completion_grace: DEFAULT_COMPLETION_GRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub detector_url: Option<String>,
    pub detector_api_key: Option<String>,
    pub detector_retry: RetryPolicy,
    /// Unset means the dry-run backend.
    pub inference_url: Option<String>,
    pub inference_retry: RetryPolicy,
    pub storage_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            detector_url: None,
            detector_api_key: None,
            detector_retry: RetryPolicy::detector_default(),
            inference_url: None,
            inference_retry: RetryPolicy::inference_default(),
            storage_dir: PathBuf::from("./outputs/objects"),
        }
    }
}

impl EngineConfig {
    /// Reads the process environment after loading an optional `.env`.
    pub fn from_env() -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let max_concurrent = parse_or(&get, "GPU_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT)?;
        if max_concurrent == 0 {
            bail!("GPU_MAX_CONCURRENT must be at least 1");
        }
        let scheduler = SchedulerConfig {
            max_concurrent,
            max_queue_depth: parse_or(&get, "GPU_QUEUE_MAX_SIZE", DEFAULT_MAX_QUEUE_DEPTH)?,
            completion_grace: Duration::from_millis(parse_or(
                &get,
                "JOB_COMPLETION_GRACE_MS",
                DEFAULT_COMPLETION_GRACE.as_millis() as u64,
            )?),
        };

        let backoff = Duration::from_millis(parse_or(&get, "RETRY_BACKOFF_MS", 250u64)?);
        let detector_retry = RetryPolicy::new(
            parse_or(&get, "DETECTOR_MAX_ATTEMPTS", defaults.detector_retry.max_attempts)?,
            Duration::from_secs_f64(parse_seconds(&get, "DETECTOR_TIMEOUT_S", 60.0)?),
            backoff,
        );
        let inference_retry = RetryPolicy::new(
            parse_or(&get, "INFERENCE_MAX_ATTEMPTS", defaults.inference_retry.max_attempts)?,
            Duration::from_secs_f64(parse_seconds(&get, "INFERENCE_TIMEOUT_S", 300.0)?),
            backoff,
        );

        Ok(Self {
            scheduler,
            detector_url: get("DETECTOR_URL").map(|url| url.trim_end_matches('/').to_string()),
            detector_api_key: get("DETECTOR_API_KEY"),
            detector_retry,
            inference_url: get("INFERENCE_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            inference_retry,
            storage_dir: get("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

fn parse_seconds<G>(get: &G, key: &str, default: f64) -> Result<f64>
where
    G: Fn(&str) -> Option<String>,
{
    let value: f64 = parse_or(get, key, default)?;
    if !value.is_finite() || value <= 0.0 {
        bail!("{key} must be a positive number of seconds, got {value}");
    }
    Ok(value)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
