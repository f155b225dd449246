use serde::{Deserialize, Serialize};

/// A reply the user posted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedReplyRow {
    pub id: i64,
    pub site: String,
    pub board: String,
    pub thread_no: i64,
    pub post_no: i64,
    pub password: Option<String>,
    pub posted_at: String,
}

/// A bookmarked thread.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bookmark {
    pub id: i64,
    pub site: String,
    pub board: String,
    pub thread_no: i64,
    pub created_at: String,
}
