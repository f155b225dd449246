//! Per-target notification events for a host's notification surface.

use std::fmt;

use super::status::{PostResult, PostingStatus};
use crate::target::ReplyTarget;

/// Event published on the coordinator's notification channel.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Update(ChildNotification),
    /// The notification for this target should be dismissed.
    Close(ReplyTarget),
}

/// Notification describing one target's job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildNotification {
    pub target: ReplyTarget,
    pub status: NotificationStatus,
    cancellable: bool,
}

impl ChildNotification {
    /// Notification for `target` entering `status`.
    ///
    /// Returns `None` for states that don't change the notification.
    #[must_use]
    pub fn from_posting_status(target: &ReplyTarget, status: &PostingStatus) -> Option<Self> {
        NotificationStatus::from_posting_status(status).map(|notification_status| Self {
            target: target.clone(),
            status: notification_status,
            cancellable: status.can_cancel(),
        })
    }

    /// Whether a cancel action should be offered; nearly finished uploads
    /// are not cancellable.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        self.cancellable
    }

    #[must_use]
    pub fn is_ongoing(&self) -> bool {
        match self.status {
            NotificationStatus::WaitingForSiteRateLimit
            | NotificationStatus::WaitingForAdditionalService(_)
            | NotificationStatus::Uploading(_)
            | NotificationStatus::Uploaded => true,
            NotificationStatus::Preparing
            | NotificationStatus::Posted
            | NotificationStatus::Canceled
            | NotificationStatus::Error(_) => false,
        }
    }

    /// Text for the notification body.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.status {
            NotificationStatus::Preparing => format!("Preparing to send a reply to {}", self.target),
            NotificationStatus::Posted => format!("Posted in {}", self.target),
            status => status.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    Preparing,
    WaitingForSiteRateLimit,
    WaitingForAdditionalService(String),
    /// Overall percent, 0-100.
    Uploading(u32),
    Uploaded,
    Posted,
    Canceled,
    Error(String),
}

impl NotificationStatus {
    /// Map a posting status to what the notification should show.
    ///
    /// Returns `None` for states that don't change the notification.
    #[must_use]
    pub fn from_posting_status(status: &PostingStatus) -> Option<Self> {
        match status {
            PostingStatus::Attached | PostingStatus::BeforePosting => None,
            PostingStatus::Enqueued => Some(Self::Preparing),
            PostingStatus::WaitingForSiteRateLimitToPass { .. } => Some(Self::WaitingForSiteRateLimit),
            PostingStatus::WaitingForAdditionalService { service } => {
                Some(Self::WaitingForAdditionalService(service.clone()))
            }
            PostingStatus::UploadingProgress(progress) => Some(Self::Uploading(progress.overall_percent())),
            PostingStatus::Uploaded => Some(Self::Uploaded),
            PostingStatus::AfterPosting(result) => Some(match result {
                PostResult::Canceled => Self::Canceled,
                PostResult::Error(error) => Self::Error(error.to_string()),
                PostResult::Success { response, .. } if response.posted => Self::Posted,
                PostResult::Success { response, .. } => Self::Error(response.rejection_message()),
            }),
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "Preparing"),
            Self::WaitingForSiteRateLimit => write!(f, "Waiting for the site's cooldown to pass"),
            Self::WaitingForAdditionalService(service) => {
                write!(f, "Waiting for additional service: \"{service}\"")
            }
            Self::Uploading(percent) => write!(f, "Uploading {percent}%..."),
            Self::Uploaded => write!(f, "Uploaded, waiting for response"),
            Self::Posted => write!(f, "Posted"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Error(message) => write!(f, "Failed to post, error={message}"),
        }
    }
}
