use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The GPU queue is saturated; the caller may try again later.
    #[error("GPU queue is full ({active} active, {queued} queued, limit {limit})")]
    CapacityExceeded {
        active: usize,
        queued: usize,
        limit: usize,
    },

    #[error("{backend} kept failing after {attempts} attempts")]
    TransientBackend {
        backend: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{backend} request failed")]
    Backend {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {job_id} failed at step {step} ({operation})")]
    Execution {
        job_id: String,
        step: usize,
        operation: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("no masks to combine")]
    EmptyInput,

    #[error("scheduler is shut down")]
    ShutDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::TransientBackend { .. }
        )
    }
}

/// Renders an error and its causes on one line, skipping repeated messages.
pub fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{error_chain_text, truncate_text, EngineError};

    #[test]
    fn chain_text_includes_nested_causes() {
        let err = EngineError::Execution {
            job_id: "job-1".to_string(),
            step: 2,
            operation: "recolor".to_string(),
            source: Box::new(EngineError::Backend {
                backend: "inference".to_string(),
                source: anyhow!("HTTP 400: bad mask"),
            }),
        };
        let rendered = error_chain_text(&err, 400);
        assert_eq!(
            rendered,
            "job job-1 failed at step 2 (recolor) | caused by: inference request failed | caused by: HTTP 400: bad mask"
        );
    }

    #[test]
    fn transparent_errors_do_not_repeat() {
        let err = EngineError::from(anyhow!("disk full"));
        assert_eq!(error_chain_text(&err, 100), "disk full");
    }

    #[test]
    fn truncation_marks_the_cut() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    #[test]
    fn only_capacity_and_transient_are_retryable() {
        assert!(EngineError::CapacityExceeded {
            active: 2,
            queued: 10,
            limit: 12
        }
        .is_retryable());
        assert!(!EngineError::Validation("empty plan".to_string()).is_retryable());
        assert!(!EngineError::EmptyInput.is_retryable());
    }
}
