use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`Site`](crate::site::Site) while posting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("site returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("rate limited by site{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid response from site: {0}")]
    InvalidResponse(String),
    #[error("failed to build request: {0}")]
    Request(String),
}

impl SiteError {
    /// Cooldown hint carried by the error, if the site sent one.
    #[must_use]
    pub fn cooldown_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Network(_) | Self::Http { .. } | Self::InvalidResponse(_) | Self::Request(_) => None,
        }
    }
}

/// Why a submission ended in `PostResult::Error`.
///
/// Cancellation is deliberately absent: a canceled job ends in
/// `PostResult::Canceled`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostingError {
    #[error("failed to resolve site '{0}'")]
    SiteNotFound(String),
    #[error("no reply draft found for {0}")]
    NoReply(String),
    #[error("failed to prepare attachments: {0}")]
    FilePreparation(String),
    #[error(transparent)]
    Site(#[from] SiteError),
    #[error("additional service '{service}' failed: {message}")]
    AdditionalService { service: String, message: String },
    #[error("site closed the post stream without a result")]
    StreamEnded,
    #[error("posting task panicked: {0}")]
    Panicked(String),
    #[error("reply worker is not running")]
    WorkerStopped,
}
