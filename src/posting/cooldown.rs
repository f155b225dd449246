//! Per-board posting cooldowns.
//!
//! Every board has two independent records, one for replies and one for new
//! threads. A record remembers when the last attempt finished, the cooldown
//! the site asked for, and a gate that allows a single attempt in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::site::SiteRegistry;
use crate::target::{BoardKey, PostKind, ReplyTarget};

/// Upper bound for any stored cooldown, whatever the site reports.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Added on top of board-declared cooldowns to absorb clock skew.
const BOARD_COOLDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CooldownRecord {
    last_attempt: Option<Instant>,
    cooldown: Duration,
    gate: Arc<AtomicBool>,
}

impl Default for CooldownRecord {
    fn default() -> Self {
        Self {
            last_attempt: None,
            cooldown: Duration::ZERO,
            gate: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl CooldownRecord {
    fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown.min(MAX_COOLDOWN);
    }
}

/// Snapshot of a record taken under the lock.
#[derive(Debug, Clone, Copy)]
struct RecordSnapshot {
    last_attempt: Option<Instant>,
    cooldown: Duration,
}

/// Tracks how long to wait before posting to a board again.
pub struct CooldownTracker {
    sites: Arc<SiteRegistry>,
    records: Mutex<HashMap<(BoardKey, PostKind), CooldownRecord>>,
}

impl CooldownTracker {
    #[must_use]
    pub fn new(sites: Arc<SiteRegistry>) -> Self {
        Self {
            sites,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Try to close the gate for `(board, kind)`.
    ///
    /// Returns `false` if another attempt already holds it.
    pub async fn prepare_to_post(&self, board: &BoardKey, kind: PostKind) -> bool {
        let gate = self.gate(board, kind).await;
        let acquired = gate
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        debug!(board = %board, ?kind, acquired, "prepare_to_post");
        acquired
    }

    /// Reopen the gate for `(board, kind)`. Safe to call more than once.
    pub async fn end_posting(&self, board: &BoardKey, kind: PostKind) {
        let gate = self.gate(board, kind).await;
        gate.store(true, Ordering::Release);
        debug!(board = %board, ?kind, "end_posting");
    }

    /// Close the gate and get a permit that reopens it when dropped.
    pub async fn try_begin_posting(&self, board: &BoardKey, kind: PostKind) -> Option<PostingPermit> {
        let gate = self.gate(board, kind).await;
        gate.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!(board = %board, ?kind, "Acquired posting gate");
                PostingPermit {
                    board: board.clone(),
                    kind,
                    gate,
                }
            })
    }

    /// Record a finished attempt.
    ///
    /// A site-supplied cooldown never shortens the current one. Without a
    /// hint the cooldown is reset.
    pub async fn on_post_attempt_finished(
        &self,
        board: &BoardKey,
        kind: PostKind,
        new_cooldown: Option<Duration>,
    ) {
        let mut records = self.records.lock().await;
        let record = records.entry((board.clone(), kind)).or_default();

        record.last_attempt = Some(Instant::now());
        match new_cooldown {
            Some(cooldown) => {
                let merged = record.cooldown.max(cooldown);
                record.set_cooldown(merged);
            }
            None => record.set_cooldown(Duration::ZERO),
        }

        debug!(
            board = %board,
            ?kind,
            cooldown_ms = record.cooldown.as_millis() as u64,
            "Post attempt finished"
        );
    }

    /// Currently stored cooldown for `(board, kind)`.
    pub async fn current_cooldown(&self, board: &BoardKey, kind: PostKind) -> Duration {
        self.snapshot(board, kind).await.cooldown
    }

    /// Time left before a reply may be posted on `board`.
    pub async fn time_until_reply(&self, board: &BoardKey, has_attached_images: bool) -> Duration {
        self.time_until(board, PostKind::Reply, has_attached_images)
            .await
    }

    /// Time left before a new thread may be created on `board`.
    pub async fn time_until_new_thread(&self, board: &BoardKey) -> Duration {
        self.time_until(board, PostKind::NewThread, false).await
    }

    /// Time left before posting to `target`.
    pub async fn time_until_next_post(&self, target: &ReplyTarget, has_attached_images: bool) -> Duration {
        let board = target.board_key();
        match target.post_kind() {
            PostKind::Reply => self.time_until_reply(&board, has_attached_images).await,
            PostKind::NewThread => self.time_until_new_thread(&board).await,
        }
    }

    async fn time_until(&self, board: &BoardKey, kind: PostKind, has_attached_images: bool) -> Duration {
        let site = self.sites.find(&board.site);
        if site.as_ref().is_some_and(|s| s.ignores_reply_cooldowns()) {
            debug!(board = %board, "Site ignores reply cooldowns");
            return Duration::ZERO;
        }

        let snapshot = self.snapshot(board, kind).await;
        let Some(last_attempt) = snapshot.last_attempt else {
            return Duration::ZERO;
        };

        let now = Instant::now();
        let dynamic_wait = snapshot
            .cooldown
            .saturating_sub(now.saturating_duration_since(last_attempt));

        let board_wait = site
            .as_ref()
            .and_then(|s| s.board_cooldowns(&board.board))
            .map_or(Duration::ZERO, |cooldowns| {
                let secs = match kind {
                    PostKind::NewThread => cooldowns.threads,
                    PostKind::Reply if has_attached_images => cooldowns.images,
                    PostKind::Reply => cooldowns.replies,
                };
                if secs == 0 {
                    return Duration::ZERO;
                }
                let declared = Duration::from_secs(secs).min(MAX_COOLDOWN) + BOARD_COOLDOWN_GRACE;
                declared.saturating_sub(now.saturating_duration_since(last_attempt))
            });

        let mut wait = dynamic_wait.max(board_wait).min(MAX_COOLDOWN);
        if !wait.is_zero() && site.as_ref().is_some_and(|s| s.is_logged_in()) {
            wait /= 2;
        }

        debug!(
            board = %board,
            ?kind,
            wait_ms = wait.as_millis() as u64,
            "Computed time until next post"
        );
        wait
    }

    async fn snapshot(&self, board: &BoardKey, kind: PostKind) -> RecordSnapshot {
        let records = self.records.lock().await;
        records
            .get(&(board.clone(), kind))
            .map_or(
                RecordSnapshot {
                    last_attempt: None,
                    cooldown: Duration::ZERO,
                },
                |record| RecordSnapshot {
                    last_attempt: record.last_attempt,
                    cooldown: record.cooldown,
                },
            )
    }

    async fn gate(&self, board: &BoardKey, kind: PostKind) -> Arc<AtomicBool> {
        let mut records = self.records.lock().await;
        Arc::clone(&records.entry((board.clone(), kind)).or_default().gate)
    }
}

/// Holds the posting gate of one board; reopens it on drop.
#[derive(Debug)]
pub struct PostingPermit {
    board: BoardKey,
    kind: PostKind,
    gate: Arc<AtomicBool>,
}

impl Drop for PostingPermit {
    fn drop(&mut self) {
        self.gate.store(true, Ordering::Release);
        debug!(board = %self.board, kind = ?self.kind, "Released posting gate");
    }
}
