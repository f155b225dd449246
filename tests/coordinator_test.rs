//! Integration tests for the reply job coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use chan_reply_poster::posting::{
    AdditionalService, Collaborators, CooldownTracker, CoordinatorConfig, JobCoordinator,
    NotificationEvent, NotificationStatus, OutcomeStore, PostResult, PostingError, PostingStatus,
    ReplyManager, ReplyResponse, SavedReply, ServiceVerdict, SiteError, StatusSubscription,
    ThreadBookmark,
};
use chan_reply_poster::site::{Site, SitePostEvent, SiteRegistry};
use chan_reply_poster::target::{PostKind, ReplyTarget};

const SITE: &str = "mock";

// ========== Mocks ==========

#[derive(Clone)]
enum Behavior {
    Events(Vec<SitePostEvent>),
    /// Emit the events, then never finish.
    Hang(Vec<SitePostEvent>),
    /// Wait for a permit, then complete with the response.
    Gated(Arc<Semaphore>, ReplyResponse),
    Panic,
}

struct MockSite {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Counts a post stream as in flight until it is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSite {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Site for MockSite {
    fn name(&self) -> &str {
        SITE
    }

    fn post(&self, _target: &ReplyTarget) -> BoxStream<'static, SitePostEvent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));

        let behavior = self.behavior.lock().unwrap().clone();
        let events = match behavior {
            Behavior::Events(events) => stream::iter(events).boxed(),
            Behavior::Hang(events) => stream::iter(events).chain(stream::pending()).boxed(),
            Behavior::Gated(permits, response) => stream::once(async move {
                if let Ok(permit) = permits.acquire().await {
                    permit.forget();
                }
                SitePostEvent::PostComplete(response)
            })
            .boxed(),
            Behavior::Panic => panic!("site exploded"),
        };

        events
            .map(move |event| {
                let _ = &guard;
                event
            })
            .boxed()
    }
}

#[derive(Default)]
struct MockReplies {
    missing: Mutex<bool>,
    take_fails: Mutex<bool>,
    restored: AtomicUsize,
    cleaned: AtomicUsize,
    captcha: Mutex<Option<String>>,
}

#[async_trait]
impl ReplyManager for MockReplies {
    async fn has_reply(&self, _target: &ReplyTarget) -> bool {
        !*self.missing.lock().unwrap()
    }

    async fn has_attached_images(&self, _target: &ReplyTarget) -> bool {
        false
    }

    async fn take_selected_files(&self, _target: &ReplyTarget) -> Result<bool> {
        Ok(!*self.take_fails.lock().unwrap())
    }

    async fn restore_files(&self, _target: &ReplyTarget) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup_files(&self, _target: &ReplyTarget) {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_captcha_response(&self, _target: &ReplyTarget, token: &str) {
        *self.captcha.lock().unwrap() = Some(token.to_string());
    }
}

#[derive(Default)]
struct MockOutcomes {
    fail: Mutex<bool>,
    saved: Mutex<Vec<SavedReply>>,
    bookmarks: Mutex<Vec<ThreadBookmark>>,
}

#[async_trait]
impl OutcomeStore for MockOutcomes {
    async fn save_reply(&self, reply: &SavedReply) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("disk full"));
        }
        self.saved.lock().unwrap().push(reply.clone());
        Ok(())
    }

    async fn bookmark_thread(&self, bookmark: &ThreadBookmark) -> Result<bool> {
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("disk full"));
        }
        self.bookmarks.lock().unwrap().push(bookmark.clone());
        Ok(true)
    }
}

struct ScriptedService {
    verdicts: Mutex<Vec<ServiceVerdict>>,
    calls: AtomicUsize,
}

#[async_trait]
impl AdditionalService for ScriptedService {
    fn name(&self) -> &str {
        "solver"
    }

    async fn solve(&self, _target: &ReplyTarget) -> ServiceVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut verdicts = self.verdicts.lock().unwrap();
        if verdicts.len() > 1 {
            verdicts.remove(0)
        } else {
            verdicts[0].clone()
        }
    }
}

// ========== Harness ==========

struct Harness {
    coordinator: JobCoordinator,
    site: Arc<MockSite>,
    replies: Arc<MockReplies>,
    outcomes: Arc<MockOutcomes>,
    cooldowns: Arc<CooldownTracker>,
    shutdown: CancellationToken,
}

fn harness(behavior: Behavior) -> Harness {
    harness_with(behavior, None, CoordinatorConfig::default())
}

fn harness_with(
    behavior: Behavior,
    additional_service: Option<Arc<dyn AdditionalService>>,
    config: CoordinatorConfig,
) -> Harness {
    let site = Arc::new(MockSite::new(behavior));
    let mut registry = SiteRegistry::new();
    registry.register(site.clone());
    let sites = Arc::new(registry);

    let cooldowns = Arc::new(CooldownTracker::new(Arc::clone(&sites)));
    let replies = Arc::new(MockReplies::default());
    let outcomes = Arc::new(MockOutcomes::default());
    let shutdown = CancellationToken::new();

    let coordinator = JobCoordinator::spawn(
        Collaborators {
            sites,
            cooldowns: Arc::clone(&cooldowns),
            replies: replies.clone(),
            outcomes: outcomes.clone(),
            additional_service,
        },
        config,
        shutdown.clone(),
    );

    Harness {
        coordinator,
        site,
        replies,
        outcomes,
        cooldowns,
        shutdown,
    }
}

fn target(thread: u64) -> ReplyTarget {
    ReplyTarget::reply(SITE, "g", thread)
}

fn posted(thread_no: u64, post_no: u64) -> ReplyResponse {
    ReplyResponse {
        posted: true,
        site: SITE.to_string(),
        board: "g".to_string(),
        thread_no,
        post_no,
        password: "hunter2".to_string(),
        ..ReplyResponse::default()
    }
}

fn progress(file_index: u32, total_files: u32, percent: u32) -> SitePostEvent {
    SitePostEvent::UploadingProgress {
        file_index,
        total_files,
        percent,
    }
}

/// Collect statuses until the terminal one.
async fn until_terminal(subscription: &mut StatusSubscription) -> (Vec<PostingStatus>, PostResult) {
    let mut seen = Vec::new();
    loop {
        let status = tokio::time::timeout(Duration::from_secs(60), subscription.next())
            .await
            .expect("timed out waiting for status")
            .expect("status stream closed");
        seen.push(status.clone());
        if let PostingStatus::AfterPosting(result) = status {
            return (seen, result);
        }
    }
}

/// Wait until `predicate` matches a status.
async fn until_status(subscription: &mut StatusSubscription, predicate: impl Fn(&PostingStatus) -> bool) {
    loop {
        let status = tokio::time::timeout(Duration::from_secs(60), subscription.next())
            .await
            .expect("timed out waiting for status")
            .expect("status stream closed");
        if predicate(&status) {
            return;
        }
    }
}

// ========== Tests ==========

#[tokio::test]
async fn test_happy_path_status_sequence() {
    let mut response = posted(100, 1001);
    response.cooldown = Some(Duration::from_secs(30));
    let h = harness(Behavior::Events(vec![
        progress(1, 1, 50),
        progress(1, 1, 100),
        SitePostEvent::Uploaded,
        SitePostEvent::PostComplete(response),
    ]));

    let mut subscription = h.coordinator.status_of(&target(100)).await;
    h.coordinator.enqueue(target(100), false).await;
    let (seen, result) = until_terminal(&mut subscription).await;

    let names: Vec<&str> = seen.iter().map(PostingStatus::name).collect();
    assert_eq!(
        names,
        vec![
            "attached",
            "enqueued",
            "before_posting",
            "uploading",
            "uploading",
            "uploaded",
            "after_posting"
        ]
    );
    assert!(result.is_posted());
    assert!(matches!(result, PostResult::Success { retrying: false, .. }));

    assert_eq!(h.replies.cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(h.replies.restored.load(Ordering::SeqCst), 0);

    let saved = h.outcomes.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].post_no, 1001);
    assert_eq!(saved[0].thread_no, 100);
    assert_eq!(saved[0].password.as_deref(), Some("hunter2"));

    let board = target(100).board_key();
    assert_eq!(
        h.cooldowns.current_cooldown(&board, PostKind::Reply).await,
        Duration::from_secs(30)
    );
    assert!(!h.coordinator.is_busy(&target(100)).await);
    assert_eq!(*h.coordinator.active_count().borrow(), 0);
}

#[tokio::test]
async fn test_duplicate_enqueue_is_coalesced() {
    let permits = Arc::new(Semaphore::new(0));
    let h = harness(Behavior::Gated(Arc::clone(&permits), posted(1, 2)));

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    h.coordinator.enqueue(target(1), true).await;
    assert!(h.coordinator.is_busy(&target(1)).await);

    permits.add_permits(1);
    let (seen, result) = until_terminal(&mut subscription).await;

    assert_eq!(h.site.calls(), 1);
    assert_eq!(
        seen.iter()
            .filter(|s| matches!(s, PostingStatus::Enqueued))
            .count(),
        1
    );
    assert!(matches!(result, PostResult::Success { retrying: false, .. }));
}

#[tokio::test]
async fn test_site_error_restores_files_once() {
    let h = harness(Behavior::Events(vec![SitePostEvent::PostError(
        SiteError::Network("connection reset".to_string()),
    )]));

    let mut subscription = h.coordinator.status_of(&target(7)).await;
    h.coordinator.enqueue(target(7), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert_eq!(
        result,
        PostResult::Error(PostingError::Site(SiteError::Network(
            "connection reset".to_string()
        )))
    );
    assert_eq!(h.replies.restored.load(Ordering::SeqCst), 1);
    assert_eq!(h.replies.cleaned.load(Ordering::SeqCst), 0);
    assert!(h.outcomes.saved.lock().unwrap().is_empty());

    let status = h.coordinator.current_status(&target(7)).await;
    assert!(!status.is_active());
    assert!(!status.can_cancel());
}

#[tokio::test]
async fn test_rate_limit_error_records_cooldown() {
    let h = harness(Behavior::Events(vec![SitePostEvent::PostError(
        SiteError::RateLimited {
            retry_after: Some(Duration::from_secs(45)),
        },
    )]));

    let mut subscription = h.coordinator.status_of(&target(3)).await;
    h.coordinator.enqueue(target(3), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert!(matches!(
        result,
        PostResult::Error(PostingError::Site(SiteError::RateLimited { .. }))
    ));
    assert_eq!(
        h.cooldowns
            .current_cooldown(&target(3).board_key(), PostKind::Reply)
            .await,
        Duration::from_secs(45)
    );
    // The gate was released on the error path.
    assert!(h
        .cooldowns
        .try_begin_posting(&target(3).board_key(), PostKind::Reply)
        .await
        .is_some());
}

#[tokio::test]
async fn test_rejected_post_is_success_without_posting() {
    let response = ReplyResponse {
        posted: false,
        error_message: Some("You are banned".to_string()),
        probably_banned: true,
        ..ReplyResponse::default()
    };
    let h = harness(Behavior::Events(vec![SitePostEvent::PostComplete(
        response.clone(),
    )]));

    let mut subscription = h.coordinator.status_of(&target(5)).await;
    h.coordinator.enqueue(target(5), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert!(matches!(result, PostResult::Success { ref response, .. } if !response.posted));
    assert!(!result.is_posted());
    assert_eq!(h.replies.restored.load(Ordering::SeqCst), 1);
    assert!(h.outcomes.saved.lock().unwrap().is_empty());
    assert_eq!(
        h.coordinator.last_unsuccessful_response(&target(5)).await,
        Some(response)
    );
}

#[tokio::test]
async fn test_cancel_before_start_never_calls_site() {
    let permits = Arc::new(Semaphore::new(0));
    let h = harness(Behavior::Gated(Arc::clone(&permits), posted(1, 10)));

    let mut first = h.coordinator.status_of(&target(1)).await;
    let mut second = h.coordinator.status_of(&target(2)).await;
    h.coordinator.enqueue(target(1), false).await;
    h.coordinator.enqueue(target(2), false).await;

    until_status(&mut first, |s| matches!(s, PostingStatus::BeforePosting)).await;
    h.coordinator.cancel(&target(2)).await;
    permits.add_permits(1);

    let (_, first_result) = until_terminal(&mut first).await;
    let (_, second_result) = until_terminal(&mut second).await;

    assert!(first_result.is_posted());
    assert_eq!(second_result, PostResult::Canceled);
    assert_eq!(h.site.calls(), 1);
}

#[tokio::test]
async fn test_cancel_during_upload() {
    let h = harness(Behavior::Hang(vec![progress(1, 2, 10)]));

    let mut subscription = h.coordinator.status_of(&target(9)).await;
    h.coordinator.enqueue(target(9), false).await;
    until_status(&mut subscription, |s| {
        matches!(s, PostingStatus::UploadingProgress(_))
    })
    .await;
    assert!(h.coordinator.current_status(&target(9)).await.can_cancel());

    h.coordinator.cancel(&target(9)).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert_eq!(result, PostResult::Canceled);
    assert_eq!(h.replies.restored.load(Ordering::SeqCst), 1);
    assert!(h
        .cooldowns
        .try_begin_posting(&target(9).board_key(), PostKind::Reply)
        .await
        .is_some());
}

#[tokio::test]
async fn test_cancel_inactive_target_is_noop() {
    let h = harness(Behavior::Events(vec![]));

    h.coordinator.cancel(&target(4)).await;
    h.coordinator.cancel_all().await;

    assert_eq!(
        h.coordinator.current_status(&target(4)).await,
        PostingStatus::Attached
    );
}

#[tokio::test]
async fn test_panic_becomes_error_and_worker_survives() {
    let h = harness(Behavior::Panic);

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    match result {
        PostResult::Error(PostingError::Panicked(message)) => {
            assert!(message.contains("site exploded"));
        }
        other => panic!("expected panic error, got {other:?}"),
    }

    h.site.set_behavior(Behavior::Events(vec![SitePostEvent::PostComplete(
        posted(1, 2),
    )]));
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;
    assert!(result.is_posted());
}

#[tokio::test]
async fn test_stream_without_result_is_error() {
    let h = harness(Behavior::Events(vec![progress(1, 1, 100)]));

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert_eq!(result, PostResult::Error(PostingError::StreamEnded));
}

#[tokio::test]
async fn test_active_count_and_idle_signal() {
    let permits = Arc::new(Semaphore::new(0));
    let h = harness(Behavior::Gated(Arc::clone(&permits), posted(1, 1)));

    let mut idle = h.coordinator.idle_signal();
    let mut active = h.coordinator.active_count();

    for thread in 1..=3 {
        h.coordinator.enqueue(target(thread), false).await;
        tokio::time::timeout(Duration::from_secs(10), active.changed())
            .await
            .expect("active count did not change")
            .unwrap();
        assert_eq!(*active.borrow_and_update(), thread as usize);
    }

    permits.add_permits(3);
    tokio::time::timeout(Duration::from_secs(10), idle.changed())
        .await
        .expect("idle signal did not fire")
        .unwrap();
    assert_eq!(*idle.borrow_and_update(), 1);
    assert_eq!(*active.borrow(), 0);
    assert_eq!(h.site.calls(), 3);

    // Re-arms for the next batch.
    permits.add_permits(1);
    h.coordinator.enqueue(target(10), false).await;
    tokio::time::timeout(Duration::from_secs(10), idle.changed())
        .await
        .expect("idle signal did not fire again")
        .unwrap();
    assert_eq!(*idle.borrow(), 2);
}

#[tokio::test]
async fn test_site_posts_never_overlap() {
    let permits = Arc::new(Semaphore::new(0));
    let h = harness(Behavior::Gated(Arc::clone(&permits), posted(1, 1)));

    let mut active = h.coordinator.active_count();
    let mut last = h.coordinator.status_of(&target(4)).await;
    for thread in 1..=4 {
        h.coordinator.enqueue(target(thread), false).await;
    }
    // New threads on another board go through the same worker.
    let other_board = ReplyTarget::new_thread(SITE, "v");
    let mut other = h.coordinator.status_of(&other_board).await;
    h.coordinator.enqueue(other_board.clone(), false).await;
    assert_eq!(*active.borrow_and_update(), 5);

    for expected in (0..5).rev() {
        // Let the previous job reach the site before releasing it.
        while h.site.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.site.in_flight(), 1);
        permits.add_permits(1);

        tokio::time::timeout(Duration::from_secs(10), active.changed())
            .await
            .expect("active count did not change")
            .unwrap();
        assert_eq!(*active.borrow_and_update(), expected);
    }

    let (_, result) = until_terminal(&mut last).await;
    assert!(result.is_posted());
    let (_, result) = until_terminal(&mut other).await;
    assert!(result.is_posted());

    assert_eq!(h.site.calls(), 5);
    assert_eq!(h.site.max_in_flight(), 1);
    assert_eq!(h.site.in_flight(), 0);
}

#[tokio::test]
async fn test_enqueue_with_prepares_once_for_concurrent_submissions() {
    let permits = Arc::new(Semaphore::new(0));
    let h = harness(Behavior::Gated(Arc::clone(&permits), posted(1, 2)));
    let prepared = Arc::new(Mutex::new(Vec::new()));

    let submit = |comment: &'static str| {
        let prepared = Arc::clone(&prepared);
        h.coordinator
            .enqueue_with(target(1), false, move || async move {
                tokio::task::yield_now().await;
                prepared.lock().unwrap().push(comment);
            })
    };
    let (first, second) = tokio::join!(submit("first"), submit("second"));

    assert!(first ^ second, "exactly one submission is accepted");
    assert_eq!(prepared.lock().unwrap().len(), 1);
    assert!(h.coordinator.is_busy(&target(1)).await);

    // Still in flight: a later submission is refused without touching the draft.
    let late = Arc::clone(&prepared);
    let accepted = h
        .coordinator
        .enqueue_with(target(1), false, move || async move {
            late.lock().unwrap().push("late");
        })
        .await;
    assert!(!accepted);
    assert_eq!(prepared.lock().unwrap().len(), 1);

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    permits.add_permits(1);
    let (_, result) = until_terminal(&mut subscription).await;
    assert!(result.is_posted());
    assert_eq!(h.site.calls(), 1);
}

#[tokio::test]
async fn test_progress_after_uploaded_is_ignored() {
    let h = harness(Behavior::Events(vec![
        progress(1, 1, 50),
        SitePostEvent::Uploaded,
        progress(1, 1, 60),
        SitePostEvent::PostComplete(posted(1, 2)),
    ]));

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (seen, result) = until_terminal(&mut subscription).await;

    let names: Vec<&str> = seen.iter().map(PostingStatus::name).collect();
    assert_eq!(
        names,
        vec![
            "attached",
            "enqueued",
            "before_posting",
            "uploading",
            "uploaded",
            "after_posting"
        ]
    );
    assert!(result.is_posted());
}

#[tokio::test]
async fn test_consume_terminal_event() {
    let h = harness(Behavior::Events(vec![SitePostEvent::PostComplete(
        posted(1, 2),
    )]));

    assert!(!h.coordinator.consume_terminal_event(&target(1)).await);

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    until_terminal(&mut subscription).await;

    assert!(h.coordinator.consume_terminal_event(&target(1)).await);
    assert_eq!(
        h.coordinator.current_status(&target(1)).await,
        PostingStatus::Attached
    );
    assert!(!h.coordinator.consume_terminal_event(&target(1)).await);
}

#[tokio::test]
async fn test_missing_site_and_missing_reply() {
    let h = harness(Behavior::Events(vec![]));

    let unknown = ReplyTarget::reply("nowhere", "g", 1);
    let mut subscription = h.coordinator.status_of(&unknown).await;
    h.coordinator.enqueue(unknown.clone(), false).await;
    let (_, result) = until_terminal(&mut subscription).await;
    assert_eq!(
        result,
        PostResult::Error(PostingError::SiteNotFound("nowhere".to_string()))
    );

    *h.replies.missing.lock().unwrap() = true;
    let mut subscription = h.coordinator.status_of(&target(2)).await;
    h.coordinator.enqueue(target(2), false).await;
    let (_, result) = until_terminal(&mut subscription).await;
    assert!(matches!(result, PostResult::Error(PostingError::NoReply(_))));

    assert_eq!(h.site.calls(), 0);
}

#[tokio::test]
async fn test_file_preparation_failure() {
    let h = harness(Behavior::Events(vec![]));
    *h.replies.take_fails.lock().unwrap() = true;

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert!(matches!(
        result,
        PostResult::Error(PostingError::FilePreparation(_))
    ));
    assert_eq!(h.site.calls(), 0);
    assert_eq!(h.replies.restored.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_additional_service_token_is_attached() {
    let service = Arc::new(ScriptedService {
        verdicts: Mutex::new(vec![
            ServiceVerdict::Wait(Duration::from_millis(5)),
            ServiceVerdict::Continue(Some("captcha-token".to_string())),
        ]),
        calls: AtomicUsize::new(0),
    });
    let h = harness_with(
        Behavior::Events(vec![SitePostEvent::PostComplete(posted(1, 2))]),
        Some(service.clone()),
        CoordinatorConfig::default(),
    );

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (seen, result) = until_terminal(&mut subscription).await;

    assert!(result.is_posted());
    assert!(seen.iter().any(|s| matches!(
        s,
        PostingStatus::WaitingForAdditionalService { service } if service == "solver"
    )));
    assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.replies.captcha.lock().unwrap().as_deref(),
        Some("captcha-token")
    );
}

#[tokio::test]
async fn test_additional_service_gives_up() {
    let service = Arc::new(ScriptedService {
        verdicts: Mutex::new(vec![ServiceVerdict::Wait(Duration::from_millis(1))]),
        calls: AtomicUsize::new(0),
    });
    let h = harness_with(
        Behavior::Events(vec![]),
        Some(service.clone()),
        CoordinatorConfig {
            max_service_attempts: 3,
            ..CoordinatorConfig::default()
        },
    );

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert!(matches!(
        result,
        PostResult::Error(PostingError::AdditionalService { .. })
    ));
    assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.site.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_cooldown_between_posts() {
    let mut response = posted(1, 2);
    response.cooldown = Some(Duration::from_secs(30));
    let h = harness(Behavior::Events(vec![SitePostEvent::PostComplete(response)]));

    let mut first = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    until_terminal(&mut first).await;

    let mut second = h.coordinator.status_of(&target(2)).await;
    h.coordinator.enqueue(target(2), false).await;
    let (seen, result) = until_terminal(&mut second).await;

    let waited = seen.iter().find_map(|s| match s {
        PostingStatus::WaitingForSiteRateLimitToPass { remaining } => Some(*remaining),
        _ => None,
    });
    let waited = waited.expect("second post should wait for the cooldown");
    assert!(waited > Duration::ZERO && waited <= Duration::from_secs(30));
    assert!(result.is_posted());
    assert_eq!(h.site.calls(), 2);
}

#[tokio::test]
async fn test_pin_thread_bookmarks_and_persistence_failure_is_logged() {
    let h = harness_with(
        Behavior::Events(vec![SitePostEvent::PostComplete(posted(0, 500))]),
        None,
        CoordinatorConfig {
            pin_thread_on_post: true,
            ..CoordinatorConfig::default()
        },
    );

    let new_thread = ReplyTarget::new_thread(SITE, "g");
    let mut subscription = h.coordinator.status_of(&new_thread).await;
    h.coordinator.enqueue(new_thread.clone(), false).await;
    until_terminal(&mut subscription).await;

    let bookmarks = h.outcomes.bookmarks.lock().unwrap().clone();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].thread_no, 500);

    *h.outcomes.fail.lock().unwrap() = true;
    h.coordinator.enqueue(new_thread.clone(), false).await;
    let (_, result) = until_terminal(&mut subscription).await;
    assert!(result.is_posted());
}

#[tokio::test]
async fn test_notifications_follow_status() {
    let h = harness(Behavior::Hang(vec![]));
    let mut notifications = h.coordinator.notifications();

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    until_status(&mut subscription, |s| matches!(s, PostingStatus::BeforePosting)).await;
    h.coordinator.cancel(&target(1)).await;
    until_terminal(&mut subscription).await;

    let mut statuses = Vec::new();
    let mut closed = false;
    while let Ok(event) = tokio::time::timeout(Duration::from_secs(1), notifications.recv()).await {
        match event.unwrap() {
            NotificationEvent::Update(notification) => statuses.push(notification.status),
            NotificationEvent::Close(closed_target) => {
                assert_eq!(closed_target, target(1));
                closed = true;
                break;
            }
        }
    }

    assert_eq!(statuses.first(), Some(&NotificationStatus::Preparing));
    assert_eq!(statuses.last(), Some(&NotificationStatus::Canceled));
    assert!(closed);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_work() {
    let h = harness(Behavior::Events(vec![SitePostEvent::PostComplete(
        posted(1, 2),
    )]));
    h.shutdown.cancel();
    tokio::task::yield_now().await;

    let mut subscription = h.coordinator.status_of(&target(1)).await;
    h.coordinator.enqueue(target(1), false).await;
    let (_, result) = until_terminal(&mut subscription).await;

    assert!(matches!(
        result,
        PostResult::Canceled | PostResult::Error(PostingError::WorkerStopped)
    ));
    assert_eq!(h.site.calls(), 0);
}

#[tokio::test]
async fn test_independent_targets_keep_separate_state() {
    let h = harness(Behavior::Events(vec![SitePostEvent::PostComplete(
        posted(1, 2),
    )]));

    let mut results = HashMap::new();
    for thread in [11, 12] {
        let mut subscription = h.coordinator.status_of(&target(thread)).await;
        h.coordinator.enqueue(target(thread), thread == 12).await;
        let (_, result) = until_terminal(&mut subscription).await;
        results.insert(thread, result);
    }

    assert!(matches!(results[&11], PostResult::Success { retrying: false, .. }));
    assert!(matches!(results[&12], PostResult::Success { retrying: true, .. }));
}
