//! Single-worker reply submission coordinator.
//!
//! Submissions are processed strictly one at a time in FIFO order. Requests
//! for a target that already has an active job are coalesced into it. Each
//! job runs in its own task so that panics and cancellation are contained,
//! and every accepted job ends in exactly one `AfterPosting` status.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::collaborators::{
    AdditionalService, OutcomeStore, ReplyManager, SavedReply, ServiceVerdict, ThreadBookmark,
};
use super::cooldown::{CooldownTracker, PostingPermit};
use super::error::PostingError;
use super::job::{JobState, StatusSubscription, TargetEntry};
use super::notification::{ChildNotification, NotificationEvent};
use super::status::{PostResult, PostingStatus, ReplyResponse, UploadProgress};
use crate::site::{Site, SitePostEvent, SiteRegistry};
use crate::target::ReplyTarget;

const NOTIFICATION_BUFFER: usize = 64;

/// Tuning knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bookmark the thread after a successful post.
    pub pin_thread_on_post: bool,
    /// How many times an additional service is asked before giving up.
    pub max_service_attempts: u32,
    /// Delay before retrying when another attempt holds the posting gate.
    pub gate_retry_interval: Duration,
    /// Per-target buffer of status updates for slow observers.
    pub status_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pin_thread_on_post: false,
            max_service_attempts: 16,
            gate_retry_interval: Duration::from_secs(1),
            status_buffer: 32,
        }
    }
}

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sites: Arc<SiteRegistry>,
    pub cooldowns: Arc<CooldownTracker>,
    pub replies: Arc<dyn ReplyManager>,
    pub outcomes: Arc<dyn OutcomeStore>,
    pub additional_service: Option<Arc<dyn AdditionalService>>,
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<ReplyTarget, TargetEntry>,
    next_job_id: u64,
    /// Set once work is accepted; cleared when the idle signal fires.
    idle_armed: bool,
}

impl JobTable {
    fn next_id(&mut self) -> u64 {
        self.next_job_id += 1;
        self.next_job_id
    }

    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.job.status.is_active())
            .count()
    }
}

struct Inner {
    collab: Collaborators,
    config: CoordinatorConfig,
    table: Mutex<JobTable>,
    queue: mpsc::UnboundedSender<ReplyTarget>,
    active_count: watch::Sender<usize>,
    idle: watch::Sender<u64>,
    notifications: broadcast::Sender<NotificationEvent>,
}

/// Accepts reply submissions and runs them through a single worker.
///
/// Cheap to clone; all clones share the same queue and job table.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    /// Create the coordinator and start its worker.
    ///
    /// The worker stops when `shutdown` is cancelled; jobs still queued at
    /// that point finish as `Canceled`.
    pub fn spawn(collab: Collaborators, config: CoordinatorConfig, shutdown: CancellationToken) -> Self {
        let (queue, requests) = mpsc::unbounded_channel();
        let (active_count, _) = watch::channel(0);
        let (idle, _) = watch::channel(0);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);

        let inner = Arc::new(Inner {
            collab,
            config,
            table: Mutex::new(JobTable::default()),
            queue,
            active_count,
            idle,
            notifications,
        });

        tokio::spawn(run_worker(Arc::clone(&inner), requests, shutdown));

        Self { inner }
    }

    /// Submit the draft for `target`.
    ///
    /// Does nothing if a job for `target` is already active. Otherwise the
    /// previous job (if any) is replaced and the target is queued.
    pub async fn enqueue(&self, target: ReplyTarget, retrying: bool) {
        self.enqueue_with(target, retrying, || async {}).await;
    }

    /// Like [`enqueue`](Self::enqueue), but runs `prepare` once the
    /// submission is accepted and before it is queued.
    ///
    /// `prepare` runs while the job table is locked, so nothing else can be
    /// accepted for `target` in between. Returns `false` without calling
    /// `prepare` if a job for `target` is already active.
    pub async fn enqueue_with<F, Fut>(&self, target: ReplyTarget, retrying: bool, prepare: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let inner = &self.inner;
        let mut table = inner.table.lock().await;

        if let Some(entry) = table.entries.get(&target) {
            if entry.job.status.is_active() {
                debug!(
                    reply = %target,
                    status = entry.job.status.name(),
                    "Submission already in progress, coalescing"
                );
                return false;
            }
        }

        prepare().await;

        let job_id = table.next_id();
        let job = JobState::enqueued(job_id, target.clone(), retrying);
        match table.entries.entry(target.clone()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().replace_job(job),
            Entry::Vacant(vacant) => {
                vacant.insert(TargetEntry::new(job, inner.config.status_buffer));
            }
        }

        table.idle_armed = true;
        inner.notify(&target, &PostingStatus::Enqueued);

        if inner.queue.send(target.clone()).is_err() {
            warn!(reply = %target, "Reply worker is not running, rejecting submission");
            if let Some(entry) = table.entries.get_mut(&target) {
                let status = PostingStatus::AfterPosting(PostResult::Error(PostingError::WorkerStopped));
                inner.notify(&target, &status);
                entry.set_status(status);
            }
        } else {
            info!(reply = %target, job_id, retrying, "Reply enqueued");
        }

        inner.refresh_active_count(&table);
        inner.check_idle(&mut table);
        true
    }

    /// Request cancellation of the active job for `target`, if any.
    pub async fn cancel(&self, target: &ReplyTarget) {
        let token = {
            let table = self.inner.table.lock().await;
            table
                .entries
                .get(target)
                .filter(|entry| entry.job.status.is_active())
                .and_then(|entry| entry.job.cancel.clone())
        };

        let Some(token) = token else {
            debug!(reply = %target, "Nothing to cancel");
            return;
        };

        token.cancel();
        info!(reply = %target, "Cancellation requested");

        if let Some(service) = &self.inner.collab.additional_service {
            service.cancel(target).await;
        }
    }

    /// Request cancellation of every active job.
    pub async fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let table = self.inner.table.lock().await;
            table
                .entries
                .values()
                .filter(|entry| entry.job.status.is_active())
                .filter_map(|entry| entry.job.cancel.clone())
                .collect()
        };

        info!(count = tokens.len(), "Cancelling all replies");
        for token in tokens {
            token.cancel();
        }

        if let Some(service) = &self.inner.collab.additional_service {
            service.cancel_all().await;
        }
    }

    /// Subscribe to status updates for `target`.
    ///
    /// A target that was never submitted is registered as `Attached`.
    pub async fn status_of(&self, target: &ReplyTarget) -> StatusSubscription {
        let mut table = self.inner.table.lock().await;
        if !table.entries.contains_key(target) {
            let id = table.next_id();
            let entry = TargetEntry::new(JobState::attached(id, target.clone()), self.inner.config.status_buffer);
            table.entries.insert(target.clone(), entry);
        }
        table.entries[target].subscribe()
    }

    /// Current status of `target` without subscribing.
    pub async fn current_status(&self, target: &ReplyTarget) -> PostingStatus {
        let table = self.inner.table.lock().await;
        table
            .entries
            .get(target)
            .map_or(PostingStatus::Attached, |entry| entry.job.status.clone())
    }

    /// Whether a job for `target` is queued or running.
    pub async fn is_busy(&self, target: &ReplyTarget) -> bool {
        let table = self.inner.table.lock().await;
        table
            .entries
            .get(target)
            .is_some_and(|entry| entry.job.status.is_active())
    }

    /// Number of active jobs across all targets.
    #[must_use]
    pub fn active_count(&self) -> watch::Receiver<usize> {
        self.inner.active_count.subscribe()
    }

    /// Generation counter bumped each time all accepted work has finished.
    #[must_use]
    pub fn idle_signal(&self) -> watch::Receiver<u64> {
        self.inner.idle.subscribe()
    }

    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.inner.notifications.subscribe()
    }

    /// Acknowledge a finished job, moving `target` back to `Attached`.
    ///
    /// Returns `false` if `target` is not in a terminal state.
    pub async fn consume_terminal_event(&self, target: &ReplyTarget) -> bool {
        let mut table = self.inner.table.lock().await;
        let consumed = match table.entries.get_mut(target) {
            Some(entry) if entry.job.status.is_terminal_event() => {
                entry.set_status(PostingStatus::Attached);
                true
            }
            _ => false,
        };

        debug!(reply = %target, consumed, "Consume terminal event");
        consumed
    }

    /// The last response for `target` in which the site rejected the post.
    pub async fn last_unsuccessful_response(&self, target: &ReplyTarget) -> Option<ReplyResponse> {
        let table = self.inner.table.lock().await;
        table
            .entries
            .get(target)
            .and_then(|entry| entry.last_unsuccessful.clone())
    }

    /// Time left before the draft for `target` may be posted.
    pub async fn time_until_next_post(&self, target: &ReplyTarget) -> Duration {
        let has_images = self.inner.collab.replies.has_attached_images(target).await;
        self.inner
            .collab
            .cooldowns
            .time_until_next_post(target, has_images)
            .await
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut requests: mpsc::UnboundedReceiver<ReplyTarget>,
    shutdown: CancellationToken,
) {
    info!("Reply worker started");

    loop {
        let target = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("Reply worker received shutdown signal");
                break;
            }
            next = requests.recv() => match next {
                Some(target) => target,
                None => break,
            },
        };

        inner.process(target).await;
    }

    requests.close();
    while let Ok(target) = requests.try_recv() {
        inner.cancel_queued(&target).await;
    }

    info!("Reply worker stopped");
}

impl Inner {
    async fn process(self: &Arc<Self>, target: ReplyTarget) {
        let job = {
            let table = self.table.lock().await;
            table.entries.get(&target).and_then(|entry| match (&entry.job.status, &entry.job.cancel) {
                (PostingStatus::Enqueued, Some(token)) => {
                    Some((entry.job.id, entry.job.retrying, token.clone(), entry.job.enqueued_at))
                }
                _ => None,
            })
        };

        let Some((job_id, retrying, token, enqueued_at)) = job else {
            warn!(reply = %target, "Dequeued a target without an enqueued job");
            return;
        };

        let queued_ms = enqueued_at.map_or(0, |at| at.elapsed().as_millis() as u64);
        info!(reply = %target, job_id, retrying, queued_ms, "Processing reply");

        let task_inner = Arc::clone(self);
        let task_target = target.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => PostResult::Canceled,
                result = task_inner.submit(&task_target, job_id, retrying) => {
                    result.unwrap_or_else(PostResult::Error)
                }
            }
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let message = panic_message(join_error);
                error!(reply = %target, job_id, "Posting task failed: {message}");
                PostResult::Error(PostingError::Panicked(message))
            }
        };

        self.finish(&target, job_id, result).await;
    }

    async fn submit(&self, target: &ReplyTarget, job_id: u64, retrying: bool) -> Result<PostResult, PostingError> {
        let site = self
            .collab
            .sites
            .find(&target.site)
            .ok_or_else(|| PostingError::SiteNotFound(target.site.clone()))?;

        if !self.collab.replies.has_reply(target).await {
            return Err(PostingError::NoReply(target.to_string()));
        }

        let _permit = self.wait_for_cooldown(target, job_id).await;

        let staged = self
            .collab
            .replies
            .take_selected_files(target)
            .await
            .map_err(|e| PostingError::FilePreparation(format!("{e:#}")))?;
        if !staged {
            return Err(PostingError::FilePreparation(
                "failed to move attached files into reply".to_string(),
            ));
        }

        if let Some(service) = &self.collab.additional_service {
            self.run_additional_service(target, job_id, service.as_ref())
                .await?;
        }

        self.set_status(target, job_id, PostingStatus::BeforePosting)
            .await;
        let outcome = self.drain_site_events(target, job_id, site.as_ref()).await;

        let hint = match &outcome {
            Ok(response) => Some(response.cooldown),
            Err(PostingError::Site(site_error)) => Some(site_error.cooldown_hint()),
            Err(_) => None,
        };
        if let Some(hint) = hint {
            self.collab
                .cooldowns
                .on_post_attempt_finished(&target.board_key(), target.post_kind(), hint)
                .await;
        }

        let response = outcome?;
        if response.posted {
            self.on_posted_successfully(target, &response).await;
        } else {
            warn!(
                reply = %target,
                banned = response.probably_banned,
                "Site rejected the post: {}",
                response.rejection_message()
            );
        }

        Ok(PostResult::Success { response, retrying })
    }

    /// Wait until the board allows posting and take its gate.
    async fn wait_for_cooldown(&self, target: &ReplyTarget, job_id: u64) -> PostingPermit {
        let board = target.board_key();
        let kind = target.post_kind();
        let has_images = self.collab.replies.has_attached_images(target).await;

        loop {
            let mut remaining = self
                .collab
                .cooldowns
                .time_until_next_post(target, has_images)
                .await;

            if remaining.is_zero() {
                if let Some(permit) = self.collab.cooldowns.try_begin_posting(&board, kind).await {
                    return permit;
                }
                debug!(reply = %target, "Posting gate is held, retrying");
                remaining = self.config.gate_retry_interval;
            }

            info!(
                reply = %target,
                remaining_ms = remaining.as_millis() as u64,
                "Waiting for site cooldown"
            );
            self.set_status(
                target,
                job_id,
                PostingStatus::WaitingForSiteRateLimitToPass { remaining },
            )
            .await;
            tokio::time::sleep(remaining).await;
        }
    }

    async fn run_additional_service(
        &self,
        target: &ReplyTarget,
        job_id: u64,
        service: &dyn AdditionalService,
    ) -> Result<(), PostingError> {
        let name = service.name().to_string();
        self.set_status(
            target,
            job_id,
            PostingStatus::WaitingForAdditionalService {
                service: name.clone(),
            },
        )
        .await;

        for attempt in 1..=self.config.max_service_attempts {
            match service.solve(target).await {
                ServiceVerdict::Continue(token) => {
                    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
                        self.collab
                            .replies
                            .set_captcha_response(target, &token)
                            .await;
                    }
                    debug!(reply = %target, service = %name, attempt, "Additional service done");
                    return Ok(());
                }
                ServiceVerdict::Wait(delay) => {
                    debug!(
                        reply = %target,
                        service = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Additional service not ready"
                    );
                    tokio::time::sleep(delay).await;
                }
                ServiceVerdict::Fail(message) => {
                    return Err(PostingError::AdditionalService { service: name, message });
                }
            }
        }

        Err(PostingError::AdditionalService {
            service: name,
            message: format!(
                "gave up after {} attempts",
                self.config.max_service_attempts
            ),
        })
    }

    async fn drain_site_events(
        &self,
        target: &ReplyTarget,
        job_id: u64,
        site: &dyn Site,
    ) -> Result<ReplyResponse, PostingError> {
        let mut events = site.post(target);
        let mut last_progress: Option<UploadProgress> = None;
        let mut uploaded = false;

        while let Some(event) = events.next().await {
            match event {
                SitePostEvent::UploadingProgress {
                    file_index,
                    total_files,
                    percent,
                } => {
                    if uploaded {
                        continue;
                    }
                    let progress = UploadProgress::new(file_index, total_files, percent);
                    if last_progress.is_some_and(|last| progress.overall_progress() < last.overall_progress()) {
                        continue;
                    }
                    last_progress = Some(progress);
                    self.set_status(target, job_id, PostingStatus::UploadingProgress(progress))
                        .await;
                }
                SitePostEvent::Uploaded => {
                    uploaded = true;
                    self.set_status(target, job_id, PostingStatus::Uploaded)
                        .await;
                }
                SitePostEvent::PostComplete(response) => return Ok(response),
                SitePostEvent::PostError(site_error) => return Err(site_error.into()),
            }
        }

        Err(PostingError::StreamEnded)
    }

    async fn on_posted_successfully(&self, target: &ReplyTarget, response: &ReplyResponse) {
        self.collab.replies.cleanup_files(target).await;

        let site = if response.site.is_empty() {
            target.site.clone()
        } else {
            response.site.clone()
        };
        let board = if response.board.is_empty() {
            target.board.clone()
        } else {
            response.board.clone()
        };
        let thread_no = response.effective_thread_no();

        let saved = SavedReply {
            site: site.clone(),
            board: board.clone(),
            thread_no,
            post_no: response.post_no,
            password: Some(response.password.clone()).filter(|p| !p.is_empty()),
        };
        if let Err(e) = self.collab.outcomes.save_reply(&saved).await {
            error!(reply = %target, "Failed to save posted reply: {e:#}");
        }

        if self.config.pin_thread_on_post && thread_no > 0 {
            let bookmark = ThreadBookmark {
                site,
                board,
                thread_no,
            };
            match self.collab.outcomes.bookmark_thread(&bookmark).await {
                Ok(true) => info!(reply = %target, thread_no, "Bookmarked thread"),
                Ok(false) => debug!(reply = %target, thread_no, "Thread already bookmarked"),
                Err(e) => error!(reply = %target, "Failed to bookmark thread: {e:#}"),
            }
        }

        info!(reply = %target, post_no = response.post_no, thread_no, "Reply posted");
    }

    async fn finish(&self, target: &ReplyTarget, job_id: u64, result: PostResult) {
        let posted = result.is_posted();
        let canceled = matches!(result, PostResult::Canceled);

        match &result {
            PostResult::Canceled => info!(reply = %target, job_id, "Reply canceled"),
            PostResult::Error(e) => warn!(reply = %target, job_id, "Reply failed: {e}"),
            PostResult::Success { .. } => debug!(reply = %target, job_id, posted, "Reply finished"),
        }

        // Attachments go back to the draft before observers see the outcome.
        if !posted {
            self.collab.replies.restore_files(target).await;
        }

        {
            let mut table = self.table.lock().await;
            match table.entries.get_mut(target).filter(|entry| entry.job.id == job_id) {
                Some(entry) => {
                    if let PostResult::Success { response, .. } = &result {
                        entry.last_unsuccessful = (!response.posted).then(|| response.clone());
                    }
                    let status = PostingStatus::AfterPosting(result);
                    self.notify(target, &status);
                    entry.set_status(status);
                }
                None => warn!(reply = %target, job_id, "Finished job is no longer current"),
            }

            self.refresh_active_count(&table);
            self.check_idle(&mut table);
        }

        if canceled {
            let _ = self
                .notifications
                .send(NotificationEvent::Close(target.clone()));
        }
    }

    async fn cancel_queued(&self, target: &ReplyTarget) {
        let job_id = {
            let table = self.table.lock().await;
            table
                .entries
                .get(target)
                .filter(|entry| entry.job.status == PostingStatus::Enqueued)
                .map(|entry| entry.job.id)
        };

        if let Some(job_id) = job_id {
            self.finish(target, job_id, PostResult::Canceled).await;
        }
    }

    /// Publish a status change for the job `job_id`; stale jobs are ignored.
    async fn set_status(&self, target: &ReplyTarget, job_id: u64, status: PostingStatus) {
        let mut table = self.table.lock().await;
        let Some(entry) = table.entries.get_mut(target) else {
            return;
        };
        if entry.job.id != job_id {
            debug!(reply = %target, job_id, current = entry.job.id, "Dropping update for stale job");
            return;
        }

        self.notify(target, &status);
        entry.set_status(status);
    }

    fn notify(&self, target: &ReplyTarget, status: &PostingStatus) {
        if let Some(notification) = ChildNotification::from_posting_status(target, status) {
            let _ = self
                .notifications
                .send(NotificationEvent::Update(notification));
        }
    }

    fn refresh_active_count(&self, table: &JobTable) {
        let count = table.active_count();
        self.active_count.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
    }

    fn check_idle(&self, table: &mut JobTable) {
        if table.idle_armed && table.active_count() == 0 {
            table.idle_armed = false;
            self.idle.send_modify(|generation| *generation += 1);
            info!("All replies processed");
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }

    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
