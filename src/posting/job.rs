//! Per-target job records and status subscriptions.

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::status::{PostingStatus, ReplyResponse};
use crate::target::ReplyTarget;

/// Mutable record of one submission for a target.
///
/// Replaced wholesale when a new submission is accepted, so `id` tells jobs
/// for the same target apart.
#[derive(Debug)]
pub struct JobState {
    pub id: u64,
    pub target: ReplyTarget,
    pub status: PostingStatus,
    pub retrying: bool,
    pub cancel: Option<CancellationToken>,
    pub enqueued_at: Option<Instant>,
}

impl JobState {
    /// Quiescent record for a target that is only being observed.
    #[must_use]
    pub fn attached(id: u64, target: ReplyTarget) -> Self {
        Self {
            id,
            target,
            status: PostingStatus::Attached,
            retrying: false,
            cancel: None,
            enqueued_at: None,
        }
    }

    /// Record for a freshly accepted submission.
    #[must_use]
    pub fn enqueued(id: u64, target: ReplyTarget, retrying: bool) -> Self {
        Self {
            id,
            target,
            status: PostingStatus::Enqueued,
            retrying,
            cancel: Some(CancellationToken::new()),
            enqueued_at: Some(Instant::now()),
        }
    }
}

/// Everything the coordinator keeps for one target.
///
/// The broadcast channel outlives individual jobs so observers keep
/// receiving updates across resubmissions.
#[derive(Debug)]
pub(crate) struct TargetEntry {
    pub job: JobState,
    pub last_unsuccessful: Option<ReplyResponse>,
    updates: broadcast::Sender<PostingStatus>,
}

impl TargetEntry {
    pub fn new(job: JobState, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        Self {
            job,
            last_unsuccessful: None,
            updates,
        }
    }

    /// Set the status and publish it to observers.
    pub fn set_status(&mut self, status: PostingStatus) {
        trace!(reply = %self.job.target, job_id = self.job.id, status = status.name(), "Status update");
        self.job.status = status.clone();
        // No receivers is fine: nobody is watching this target right now.
        let _ = self.updates.send(status);
    }

    /// Replace the job and publish its initial status.
    pub fn replace_job(&mut self, job: JobState) {
        let status = job.status.clone();
        self.job = job;
        let _ = self.updates.send(status);
    }

    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            initial: Some(self.job.status.clone()),
            updates: self.updates.subscribe(),
        }
    }
}

/// Live view of a target's status.
///
/// Yields the status current at subscription time first, then every later
/// transition.
#[derive(Debug)]
pub struct StatusSubscription {
    initial: Option<PostingStatus>,
    updates: broadcast::Receiver<PostingStatus>,
}

impl StatusSubscription {
    /// Next status, or `None` once the coordinator is gone.
    pub async fn next(&mut self) -> Option<PostingStatus> {
        if let Some(status) = self.initial.take() {
            return Some(status);
        }

        loop {
            match self.updates.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of statuses.
    pub fn into_stream(mut self) -> impl futures_util::Stream<Item = PostingStatus> {
        async_stream::stream! {
            while let Some(status) = self.next().await {
                yield status;
            }
        }
    }
}
