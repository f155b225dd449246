use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Bookmark, SavedReplyRow};
use crate::posting::{SavedReply, ThreadBookmark};

// ========== Saved replies ==========

/// Insert a saved reply, returning its ID.
///
/// Saving the same post twice updates its password.
pub async fn insert_saved_reply(pool: &SqlitePool, reply: &SavedReply) -> Result<i64> {
    let posted_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let id: (i64,) = sqlx::query_as(
        r"
        INSERT INTO saved_replies (site, board, thread_no, post_no, password, posted_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(site, board, post_no) DO UPDATE SET
            thread_no = excluded.thread_no,
            password = COALESCE(excluded.password, saved_replies.password)
        RETURNING id
        ",
    )
    .bind(&reply.site)
    .bind(&reply.board)
    .bind(reply.thread_no as i64)
    .bind(reply.post_no as i64)
    .bind(&reply.password)
    .bind(&posted_at)
    .fetch_one(pool)
    .await
    .context("Failed to insert saved reply")?;

    Ok(id.0)
}

/// Saved replies in a thread, oldest first.
pub async fn get_saved_replies_for_thread(
    pool: &SqlitePool,
    site: &str,
    board: &str,
    thread_no: u64,
) -> Result<Vec<SavedReplyRow>> {
    sqlx::query_as(
        "SELECT * FROM saved_replies WHERE site = ? AND board = ? AND thread_no = ? ORDER BY post_no",
    )
    .bind(site)
    .bind(board)
    .bind(thread_no as i64)
    .fetch_all(pool)
    .await
    .context("Failed to fetch saved replies for thread")
}

/// Most recent saved replies.
pub async fn get_recent_saved_replies(pool: &SqlitePool, limit: i64) -> Result<Vec<SavedReplyRow>> {
    sqlx::query_as("SELECT * FROM saved_replies ORDER BY posted_at DESC, id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to fetch recent saved replies")
}

// ========== Bookmarks ==========

/// Bookmark a thread. Returns `false` if it was already bookmarked.
pub async fn insert_bookmark(pool: &SqlitePool, bookmark: &ThreadBookmark) -> Result<bool> {
    let result = sqlx::query(
        r"
        INSERT INTO bookmarks (site, board, thread_no)
        VALUES (?, ?, ?)
        ON CONFLICT(site, board, thread_no) DO NOTHING
        ",
    )
    .bind(&bookmark.site)
    .bind(&bookmark.board)
    .bind(bookmark.thread_no as i64)
    .execute(pool)
    .await
    .context("Failed to insert bookmark")?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_bookmarks(pool: &SqlitePool) -> Result<Vec<Bookmark>> {
    sqlx::query_as("SELECT * FROM bookmarks ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await
        .context("Failed to list bookmarks")
}
