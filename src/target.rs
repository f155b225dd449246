//! Identifiers for what a reply is being posted to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The site/board/thread triple a submission is aimed at.
///
/// A target without a thread number is a new-thread target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub site: String,
    pub board: String,
    pub thread: Option<u64>,
}

impl ReplyTarget {
    /// Target for a reply in an existing thread.
    pub fn reply(site: impl Into<String>, board: impl Into<String>, thread: u64) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
            thread: Some(thread),
        }
    }

    /// Target for creating a new thread on a board.
    pub fn new_thread(site: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
            thread: None,
        }
    }

    #[must_use]
    pub fn board_key(&self) -> BoardKey {
        BoardKey {
            site: self.site.clone(),
            board: self.board.clone(),
        }
    }

    #[must_use]
    pub fn post_kind(&self) -> PostKind {
        if self.is_new_thread() {
            PostKind::NewThread
        } else {
            PostKind::Reply
        }
    }

    #[must_use]
    pub fn is_new_thread(&self) -> bool {
        self.thread.is_none()
    }
}

impl fmt::Display for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread {
            Some(thread) => write!(f, "{}/{}/{}", self.site, self.board, thread),
            None => write!(f, "{}/{}/catalog", self.site, self.board),
        }
    }
}

/// A board on a site, without the thread component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardKey {
    pub site: String,
    pub board: String,
}

impl BoardKey {
    pub fn new(site: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
        }
    }
}

impl fmt::Display for BoardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.board)
    }
}

/// Boards track reply and new-thread cooldowns separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Reply,
    NewThread,
}
