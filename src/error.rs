use thiserror::Error;

/// Typed error hierarchy for the digest pipeline.
///
/// The variants are classification kinds, not provider-specific types: queue
/// workers use [`PipelineError::is_retryable`] to decide whether a failed job
/// goes back on the queue or surfaces as failed immediately.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network I/O failed before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// An external service answered with a non-2xx status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// A structured response could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// A provider answered 2xx but the payload carried no usable content.
    #[error("no content in response: {0}")]
    NoContent(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted state violates a pipeline invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrent work on the same entity was detected via its status.
    #[error("busy: {0}")]
    Busy(String),

    /// A required external dependency is not configured or not installed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An external binary exited non-zero; stderr is surfaced verbatim.
    #[error("{program} exited with {status}: {stderr}")]
    Subprocess {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),
}

impl PipelineError {
    /// Whether the queue should retry a job that failed with this error.
    ///
    /// Transport hiccups, 429/5xx, subprocess crashes and malformed provider
    /// output are retried; 4xx misconfiguration, missing entities, broken
    /// invariants and busy-conflicts are not. Retryable kinds may still carry
    /// a ceiling of their own, see [`PipelineError::retry_limit`].
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Transport(_) => true,
            PipelineError::HttpStatus { status, .. } => {
                *status == 429 || (500..600).contains(&(*status as u32))
            }
            PipelineError::Parse(_) => true,
            PipelineError::NoContent(_) => true,
            PipelineError::Subprocess { .. } => true,
            PipelineError::Io(_) => true,
            PipelineError::Database(_) => true,
            PipelineError::NotFound(_)
            | PipelineError::InvariantViolation(_)
            | PipelineError::Busy(_)
            | PipelineError::Unavailable(_) => false,
        }
    }

    /// Kind-specific cap on retries, tighter than the job's attempt budget.
    ///
    /// A malformed structured response is retried once, then fatal. None
    /// leaves the job's attempt budget in charge.
    pub fn retry_limit(&self) -> Option<i64> {
        match self {
            PipelineError::Parse(_) => Some(1),
            _ => None,
        }
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Parse(e.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert!(PipelineError::HttpStatus {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(PipelineError::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!PipelineError::HttpStatus {
            status: 401,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn conflicts_and_missing_entities_are_fatal() {
        assert!(!PipelineError::Busy("episode e1".into()).is_retryable());
        assert!(!PipelineError::NotFound("digest d1".into()).is_retryable());
        assert!(!PipelineError::InvariantViolation("clip out of range".into()).is_retryable());
    }

    #[test]
    fn parse_errors_are_retryable_exactly_once() {
        let parse = PipelineError::Parse("bad json".into());
        assert!(parse.is_retryable());
        assert_eq!(parse.retry_limit(), Some(1));

        // Other retryable kinds defer to the job's attempt budget
        assert_eq!(PipelineError::Transport("reset".into()).retry_limit(), None);
        assert_eq!(
            PipelineError::HttpStatus {
                status: 503,
                body: String::new()
            }
            .retry_limit(),
            None
        );
    }
}
