//! Reply submission pipeline: job coordination, status tracking, cooldowns.

mod collaborators;
mod cooldown;
mod coordinator;
mod error;
mod job;
mod notification;
mod status;

pub use collaborators::{
    AdditionalService, OutcomeStore, ReplyManager, SavedReply, ServiceVerdict, ThreadBookmark,
};
pub use cooldown::{CooldownTracker, PostingPermit, MAX_COOLDOWN};
pub use coordinator::{Collaborators, CoordinatorConfig, JobCoordinator};
pub use error::{PostingError, SiteError};
pub use job::{JobState, StatusSubscription};
pub use notification::{ChildNotification, NotificationEvent, NotificationStatus};
pub use status::{PostResult, PostingStatus, ReplyResponse, UploadProgress, CANCEL_PROGRESS_THRESHOLD};
