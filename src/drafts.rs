//! In-memory reply drafts and their attachments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::posting::ReplyManager;
use crate::target::ReplyTarget;

const PASSWORD_LEN: usize = 16;

/// What the user wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub comment: String,
    /// Deletion password; generated when absent.
    #[serde(default)]
    pub password: Option<String>,
    /// Paths of files to attach.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

/// A draft with its staged files, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedReply {
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub password: String,
    pub files: Vec<PathBuf>,
    pub captcha: Option<String>,
}

#[derive(Debug)]
struct DraftEntry {
    draft: Draft,
    password: String,
    picked: Vec<PathBuf>,
    taken: Vec<PathBuf>,
    captcha: Option<String>,
}

/// Drafts keyed by target.
///
/// Attachments move from `picked` to `taken` while a post is in flight and
/// move back if it fails.
#[derive(Debug, Default)]
pub struct DraftStore {
    drafts: RwLock<HashMap<ReplyTarget, DraftEntry>>,
}

impl DraftStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the draft for `target`.
    pub async fn put(&self, target: ReplyTarget, draft: Draft) {
        let password = draft
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(generate_password);
        let entry = DraftEntry {
            picked: draft.attachments.clone(),
            draft,
            password,
            taken: Vec::new(),
            captcha: None,
        };

        debug!(reply = %target, files = entry.picked.len(), "Draft saved");
        self.drafts.write().await.insert(target, entry);
    }

    /// Files still attached to the draft and not yet staged.
    pub async fn picked_files(&self, target: &ReplyTarget) -> Vec<PathBuf> {
        self.drafts
            .read()
            .await
            .get(target)
            .map(|entry| entry.picked.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the draft with the files staged for sending.
    pub async fn prepared(&self, target: &ReplyTarget) -> Option<PreparedReply> {
        let drafts = self.drafts.read().await;
        drafts.get(target).map(|entry| PreparedReply {
            name: entry.draft.name.clone(),
            subject: entry.draft.subject.clone(),
            comment: entry.draft.comment.clone(),
            password: entry.password.clone(),
            files: entry.taken.clone(),
            captcha: entry.captcha.clone(),
        })
    }
}

#[async_trait]
impl ReplyManager for DraftStore {
    async fn has_reply(&self, target: &ReplyTarget) -> bool {
        self.drafts.read().await.contains_key(target)
    }

    async fn has_attached_images(&self, target: &ReplyTarget) -> bool {
        let drafts = self.drafts.read().await;
        drafts.get(target).is_some_and(|entry| {
            entry
                .picked
                .iter()
                .chain(entry.taken.iter())
                .any(|path| is_image(path))
        })
    }

    async fn take_selected_files(&self, target: &ReplyTarget) -> Result<bool> {
        let picked = self.picked_files(target).await;
        for path in &picked {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                warn!(reply = %target, path = %path.display(), "Attachment no longer exists");
                return Ok(false);
            }
        }

        let mut drafts = self.drafts.write().await;
        let Some(entry) = drafts.get_mut(target) else {
            return Ok(false);
        };
        let picked = std::mem::take(&mut entry.picked);
        entry.taken.extend(picked);

        debug!(reply = %target, files = entry.taken.len(), "Attachments staged");
        Ok(true)
    }

    async fn restore_files(&self, target: &ReplyTarget) {
        let mut drafts = self.drafts.write().await;
        if let Some(entry) = drafts.get_mut(target) {
            if entry.taken.is_empty() {
                return;
            }
            let mut restored = std::mem::take(&mut entry.taken);
            restored.append(&mut entry.picked);
            entry.picked = restored;
            debug!(reply = %target, files = entry.picked.len(), "Attachments restored");
        }
    }

    async fn cleanup_files(&self, target: &ReplyTarget) {
        if self.drafts.write().await.remove(target).is_some() {
            debug!(reply = %target, "Draft cleared after posting");
        }
    }

    async fn set_captcha_response(&self, target: &ReplyTarget, token: &str) {
        if let Some(entry) = self.drafts.write().await.get_mut(target) {
            entry.captcha = Some(token.to_string());
        }
    }
}

fn is_image(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}
