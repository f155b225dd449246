//! Capabilities the coordinator depends on but does not own.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::target::ReplyTarget;

/// Draft and attachment lifecycle of replies.
#[async_trait]
pub trait ReplyManager: Send + Sync {
    /// Whether a draft exists for `target`.
    async fn has_reply(&self, target: &ReplyTarget) -> bool;

    /// Whether the draft for `target` carries image attachments.
    async fn has_attached_images(&self, target: &ReplyTarget) -> bool;

    /// Move the picked attachments into the reply being sent.
    ///
    /// Returns `Ok(false)` when the files could not be staged.
    async fn take_selected_files(&self, target: &ReplyTarget) -> Result<bool>;

    /// Give staged attachments back to the draft after a failed post.
    async fn restore_files(&self, target: &ReplyTarget);

    /// Drop staged attachments after a successful post.
    async fn cleanup_files(&self, target: &ReplyTarget);

    /// Store a token obtained from an additional service (captcha solver).
    async fn set_captcha_response(&self, target: &ReplyTarget, token: &str);
}

/// A post the user made, remembered so it can be highlighted later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedReply {
    pub site: String,
    pub board: String,
    pub thread_no: u64,
    pub post_no: u64,
    pub password: Option<String>,
}

/// A thread to add to the user's bookmarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBookmark {
    pub site: String,
    pub board: String,
    pub thread_no: u64,
}

/// Persistence of posting outcomes.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn save_reply(&self, reply: &SavedReply) -> Result<()>;

    /// Returns `false` if the thread was already bookmarked.
    async fn bookmark_thread(&self, bookmark: &ThreadBookmark) -> Result<bool>;
}

/// What an additional service (e.g. a captcha solver) decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceVerdict {
    /// Go ahead, optionally with a token to attach to the reply.
    Continue(Option<String>),
    /// Not ready yet; ask again after the given delay.
    Wait(Duration),
    /// Give up on this post.
    Fail(String),
}

/// A service consulted before posting.
#[async_trait]
pub trait AdditionalService: Send + Sync {
    fn name(&self) -> &str;

    async fn solve(&self, target: &ReplyTarget) -> ServiceVerdict;

    async fn cancel(&self, _target: &ReplyTarget) {}

    async fn cancel_all(&self) {}
}
