// =============================================================================
// error.rs - EVERYTHING THAT CAN GO WRONG, SORTED BY HOW MUCH WE CARE
// =============================================================================
//
// Row-level problems are absorbed and counted. Page-level problems are retried
// and then escalated. Batch-level problems are retried and then written down
// for a human. Nothing retries forever.
// =============================================================================

use std::time::Duration;
use thiserror::Error;

/// Token or session acquisition failed. Fatal for the worker holding the
/// session until a refresh succeeds.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("could not build HTTP client: {0}")]
    Client(String),

    #[error("landing page request failed: {0}")]
    Request(String),

    #[error("landing page returned HTTP {0}")]
    Status(u16),

    #[error("no CSRF token found on the landing page")]
    TokenMissing,

    #[error("tribunal context '{slug}' returned HTTP {status}")]
    Context { slug: &'static str, status: u16 },

    #[error("session acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of one search request that didn't produce rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Back off and retry the same page.
    #[error("rate limited by upstream (HTTP {status})")]
    RateLimited { status: u16 },

    /// Refresh the session and retry the same page.
    #[error("session rejected by upstream (HTTP {status})")]
    AuthRejected { status: u16 },

    /// Network, timeout, 5xx or a malformed body. Retry with backoff.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// 4xx other than auth/rate-limit. Skip the page, don't retry.
    #[error("permanent upstream failure (HTTP {status}): {detail}")]
    Permanent { status: u16, detail: String },
}

impl FetchError {
    /// Classify an HTTP status that isn't a success.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match status {
            419 | 429 => FetchError::RateLimited { status },
            401 | 403 => FetchError::AuthRejected { status },
            500..=599 => FetchError::Transient(format!("HTTP {}: {}", status, detail.into())),
            _ => FetchError::Permanent {
                status,
                detail: detail.into(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Permanent { .. })
    }
}

/// Terminal failure of a page after the fetch layer has given up.
#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("page abandoned: shutdown requested")]
    Cancelled,
}

impl PageError {
    /// Permanent upstream errors skip the page instead of failing it.
    pub fn is_skip(&self) -> bool {
        matches!(self, PageError::Fetch(FetchError::Permanent { .. }))
    }
}

/// A raw row that couldn't become a SentenceRecord.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("no docket number in structured fields or text ({fields} fields present)")]
    MissingRol { fields: usize },

    #[error("docket number '{0}' is not usable")]
    InvalidRol(String),
}

/// The store refused or never heard a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The request never completed. Retry the whole batch.
    #[error("store transport failure: {0}")]
    Transport(String),

    /// The store answered and said no. Retrying the same batch won't help.
    #[error("store rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("store response could not be decoded: {0}")]
    Decode(String),

    /// The breaker in front of the store is open.
    #[error("store unavailable: circuit open")]
    Unavailable,
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transport(_)) || matches!(self, SinkError::Rejected { status, .. } if *status >= 500)
    }
}

/// On-disk state (progress checkpoints, failure log) couldn't be read or written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::from_status(419, ""), FetchError::RateLimited { status: 419 });
        assert_eq!(FetchError::from_status(429, ""), FetchError::RateLimited { status: 429 });
        assert_eq!(FetchError::from_status(403, ""), FetchError::AuthRejected { status: 403 });
        assert!(matches!(FetchError::from_status(502, "bad gateway"), FetchError::Transient(_)));
        assert!(matches!(
            FetchError::from_status(404, "not found"),
            FetchError::Permanent { status: 404, .. }
        ));
    }

    #[test]
    fn test_only_permanent_fetch_errors_skip() {
        assert!(FetchError::Transient("x".into()).is_retryable());
        assert!(!FetchError::Permanent { status: 400, detail: String::new() }.is_retryable());
        assert!(PageError::Fetch(FetchError::Permanent { status: 400, detail: String::new() }).is_skip());
        assert!(!PageError::Fetch(FetchError::RateLimited { status: 419 }).is_skip());
    }

    #[test]
    fn test_sink_retryability() {
        assert!(SinkError::Transport("reset".into()).is_retryable());
        assert!(SinkError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(!SinkError::Rejected { status: 400, body: String::new() }.is_retryable());
        assert!(!SinkError::Unavailable.is_retryable());
    }
}
