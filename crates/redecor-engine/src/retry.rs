use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::error::{error_chain_text, EngineError, EngineResult};

/// Non-success HTTP reply from a collaborator service.
#[derive(Debug, Error)]
#[error("HTTP {status}: {body}")]
pub struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, call_timeout: Duration, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            call_timeout,
            backoff,
        }
    }

    pub fn detector_default() -> Self {
        Self::new(3, Duration::from_secs(60), Duration::from_millis(250))
    }

    pub fn inference_default() -> Self {
        Self::new(2, Duration::from_secs(300), Duration::from_millis(250))
    }
}

/// Timeouts, refused connections and 5xx replies. Everything else is final.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            return reqwest_err.is_timeout()
                || reqwest_err.is_connect()
                || reqwest_err.is_request()
                || reqwest_err
                    .status()
                    .map(|status| status.is_server_error())
                    .unwrap_or(false);
        }
        if let Some(status_err) = cause.downcast_ref::<HttpStatusError>() {
            return status_err.status >= 500;
        }
        cause.is::<tokio::time::error::Elapsed>()
    })
}

/// Runs `call` until it succeeds, fails for good, or runs out of attempts.
///
/// Each attempt is bounded by the policy's call timeout and re-issues the
/// identical request. Backoff grows linearly with the attempt number.
pub async fn with_retries<T, F, Fut>(
    backend: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(elapsed) => Err(anyhow::Error::new(elapsed).context(format!(
                "{backend} call timed out after {:.1}s",
                policy.call_timeout.as_secs_f64()
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_transient(&err) {
            return Err(EngineError::Backend {
                backend: backend.to_string(),
                source: err,
            });
        }
        if attempt >= max_attempts {
            return Err(EngineError::TransientBackend {
                backend: backend.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        warn!(
            backend,
            attempt,
            max_attempts,
            error = %error_chain_text(&*err, 220),
            "transient backend failure, retrying"
        );
        tokio::time::sleep(policy.backoff * attempt).await;
    }
}
