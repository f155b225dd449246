//! Posting lifecycle and terminal outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::PostingError;

/// Overall upload progress at or above which a job can no longer be canceled.
pub const CANCEL_PROGRESS_THRESHOLD: f32 = 0.9;

/// Lifecycle of one submission, in order.
///
/// `Attached` is the quiescent baseline of an observed target with no running
/// job. `AfterPosting` is the only terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum PostingStatus {
    Attached,
    Enqueued,
    WaitingForSiteRateLimitToPass { remaining: Duration },
    WaitingForAdditionalService { service: String },
    BeforePosting,
    UploadingProgress(UploadProgress),
    Uploaded,
    AfterPosting(PostResult),
}

impl PostingStatus {
    /// Whether a job for the target is queued or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match self {
            Self::Attached | Self::AfterPosting(_) => false,
            Self::Enqueued
            | Self::WaitingForSiteRateLimitToPass { .. }
            | Self::WaitingForAdditionalService { .. }
            | Self::BeforePosting
            | Self::UploadingProgress(_)
            | Self::Uploaded => true,
        }
    }

    /// Whether a cancel request still makes sense for this state.
    ///
    /// Nearly finished uploads are not cancellable.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        match self {
            Self::Enqueued
            | Self::WaitingForSiteRateLimitToPass { .. }
            | Self::WaitingForAdditionalService { .. }
            | Self::BeforePosting => true,
            Self::UploadingProgress(progress) => {
                progress.overall_progress() < CANCEL_PROGRESS_THRESHOLD
            }
            Self::Attached | Self::Uploaded | Self::AfterPosting(_) => false,
        }
    }

    #[must_use]
    pub fn is_terminal_event(&self) -> bool {
        match self {
            Self::AfterPosting(_) => true,
            Self::Attached
            | Self::Enqueued
            | Self::WaitingForSiteRateLimitToPass { .. }
            | Self::WaitingForAdditionalService { .. }
            | Self::BeforePosting
            | Self::UploadingProgress(_)
            | Self::Uploaded => false,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Enqueued => "enqueued",
            Self::WaitingForSiteRateLimitToPass { .. } => "waiting_for_rate_limit",
            Self::WaitingForAdditionalService { .. } => "waiting_for_additional_service",
            Self::BeforePosting => "before_posting",
            Self::UploadingProgress(_) => "uploading",
            Self::Uploaded => "uploaded",
            Self::AfterPosting(_) => "after_posting",
        }
    }
}

/// Upload progress of the current file within a multi-file post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// 1-based index of the file being uploaded.
    pub file_index: u32,
    pub total_files: u32,
    /// Progress of the current file, 0-100.
    pub percent: u32,
}

impl UploadProgress {
    #[must_use]
    pub fn new(file_index: u32, total_files: u32, percent: u32) -> Self {
        Self {
            file_index,
            total_files,
            percent,
        }
    }

    /// Progress across all files as a fraction in `[0, 1]`.
    #[must_use]
    pub fn overall_progress(&self) -> f32 {
        if self.total_files == 0 {
            return 1.0;
        }

        let index = self.file_index.saturating_sub(1) as f32;
        let total = self.total_files as f32 * 100.0;
        let current = index * 100.0 + self.percent.min(100) as f32;

        (current / total).clamp(0.0, 1.0)
    }

    /// Overall progress as a whole percentage.
    #[must_use]
    pub fn overall_percent(&self) -> u32 {
        (self.overall_progress() * 100.0) as u32
    }
}

/// Outcome of a finished job. Exactly one is produced per job.
#[derive(Debug, Clone, PartialEq)]
pub enum PostResult {
    Canceled,
    Error(PostingError),
    Success {
        response: ReplyResponse,
        retrying: bool,
    },
}

impl PostResult {
    /// True only when the site accepted the post.
    #[must_use]
    pub fn is_posted(&self) -> bool {
        matches!(self, Self::Success { response, .. } if response.posted)
    }
}

/// What the site answered to a submission.
///
/// `posted == false` means the site rejected the post (ban, captcha, flood
/// detection) while still answering normally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyResponse {
    pub posted: bool,
    pub error_message: Option<String>,
    pub probably_banned: bool,
    pub requires_authentication: bool,
    pub site: String,
    pub board: String,
    /// Thread the post landed in. `0` for a freshly created thread, in which
    /// case `post_no` is the new thread's number.
    pub thread_no: u64,
    pub post_no: u64,
    pub password: String,
    /// Wait the site asked for before the next post, if any.
    pub cooldown: Option<Duration>,
}

impl ReplyResponse {
    /// Number of the thread that contains the post.
    #[must_use]
    pub fn effective_thread_no(&self) -> u64 {
        if self.thread_no == 0 {
            self.post_no
        } else {
            self.thread_no
        }
    }

    /// Human-readable reason for a rejected post.
    #[must_use]
    pub fn rejection_message(&self) -> String {
        if let Some(message) = self.error_message.as_deref().filter(|m| !m.trim().is_empty()) {
            return message.to_string();
        }
        if self.probably_banned {
            return "You are probably banned".to_string();
        }
        if self.requires_authentication {
            return "Site requires authentication to post".to_string();
        }
        "Unknown error".to_string()
    }
}
