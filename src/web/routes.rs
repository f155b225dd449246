use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::db::{get_recent_saved_replies, get_saved_replies_for_thread, list_bookmarks};
use crate::drafts::Draft;
use crate::posting::{PostResult, PostingStatus};
use crate::target::ReplyTarget;

/// Create the router with all routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        .route("/replies", post(submit_reply))
        .route("/replies/cancel", post(cancel_reply))
        .route("/replies/cancel-all", post(cancel_all))
        .route("/replies/status", get(reply_status))
        .route("/replies/acknowledge", post(acknowledge))
        .route("/replies/active", get(active_count))
        .route("/replies/cooldown", get(cooldown))
        .route("/replies/saved", get(saved_replies))
        .route("/bookmarks", get(bookmarks))
}

/// Identifies a reply target. `site` defaults to the configured site.
#[derive(Debug, Deserialize)]
pub struct TargetParams {
    pub site: Option<String>,
    pub board: String,
    pub thread: Option<u64>,
}

impl TargetParams {
    fn into_target(self, state: &AppState) -> ReplyTarget {
        let site = self.site.unwrap_or_else(|| state.config.site_name.clone());
        match self.thread {
            Some(thread) => ReplyTarget::reply(site, self.board, thread),
            None => ReplyTarget::new_thread(site, self.board),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub target: TargetParams,
    #[serde(flatten)]
    pub draft: Draft,
    #[serde(default)]
    pub retrying: bool,
}

/// JSON view of a target's status.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub target: String,
    pub state: &'static str,
    pub active: bool,
    pub can_cancel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
}

#[derive(Debug, Serialize)]
pub struct ResultView {
    pub outcome: &'static str,
    pub posted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_no: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_no: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusView {
    fn new(target: &ReplyTarget, status: &PostingStatus) -> Self {
        let mut view = Self {
            target: target.to_string(),
            state: status.name(),
            active: status.is_active(),
            can_cancel: status.can_cancel(),
            remaining_ms: None,
            service: None,
            progress_percent: None,
            result: None,
        };

        match status {
            PostingStatus::WaitingForSiteRateLimitToPass { remaining } => {
                view.remaining_ms = Some(remaining.as_millis() as u64);
            }
            PostingStatus::WaitingForAdditionalService { service } => {
                view.service = Some(service.clone());
            }
            PostingStatus::UploadingProgress(progress) => {
                view.progress_percent = Some(progress.overall_percent());
            }
            PostingStatus::AfterPosting(result) => view.result = Some(ResultView::new(result)),
            PostingStatus::Attached
            | PostingStatus::Enqueued
            | PostingStatus::BeforePosting
            | PostingStatus::Uploaded => {}
        }

        view
    }
}

impl ResultView {
    fn new(result: &PostResult) -> Self {
        match result {
            PostResult::Canceled => Self {
                outcome: "canceled",
                posted: false,
                post_no: None,
                thread_no: None,
                message: None,
            },
            PostResult::Error(error) => Self {
                outcome: "error",
                posted: false,
                post_no: None,
                thread_no: None,
                message: Some(error.to_string()),
            },
            PostResult::Success { response, .. } => Self {
                outcome: "success",
                posted: response.posted,
                post_no: Some(response.post_no).filter(|_| response.posted),
                thread_no: Some(response.effective_thread_no()).filter(|_| response.posted),
                message: (!response.posted).then(|| response.rejection_message()),
            },
        }
    }
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn submit_reply(State(state): State<AppState>, Json(request): Json<SubmitRequest>) -> Response {
    if request.target.board.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Board cannot be empty").into_response();
    }

    let target = request.target.into_target(&state);
    let drafts = Arc::clone(&state.drafts);
    let draft_target = target.clone();
    let draft = request.draft;
    let accepted = state
        .coordinator
        .enqueue_with(target.clone(), request.retrying, move || async move {
            drafts.put(draft_target, draft).await;
        })
        .await;

    let status = state.coordinator.current_status(&target).await;
    let code = if accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (code, Json(StatusView::new(&target, &status))).into_response()
}

async fn cancel_reply(State(state): State<AppState>, Json(params): Json<TargetParams>) -> Response {
    let target = params.into_target(&state);
    state.coordinator.cancel(&target).await;
    StatusCode::ACCEPTED.into_response()
}

async fn cancel_all(State(state): State<AppState>) -> Response {
    state.coordinator.cancel_all().await;
    StatusCode::ACCEPTED.into_response()
}

async fn reply_status(State(state): State<AppState>, Query(params): Query<TargetParams>) -> Response {
    let target = params.into_target(&state);
    let status = state.coordinator.current_status(&target).await;
    Json(StatusView::new(&target, &status)).into_response()
}

#[derive(Debug, Serialize)]
struct AcknowledgeResponse {
    consumed: bool,
}

async fn acknowledge(State(state): State<AppState>, Json(params): Json<TargetParams>) -> Response {
    let target = params.into_target(&state);
    let consumed = state.coordinator.consume_terminal_event(&target).await;
    Json(AcknowledgeResponse { consumed }).into_response()
}

#[derive(Debug, Serialize)]
struct ActiveResponse {
    active: usize,
}

async fn active_count(State(state): State<AppState>) -> Response {
    let active = *state.coordinator.active_count().borrow();
    Json(ActiveResponse { active }).into_response()
}

#[derive(Debug, Serialize)]
struct CooldownResponse {
    target: String,
    remaining_ms: u64,
}

async fn cooldown(State(state): State<AppState>, Query(params): Query<TargetParams>) -> Response {
    let target = params.into_target(&state);
    let remaining = state.coordinator.time_until_next_post(&target).await;
    Json(CooldownResponse {
        target: target.to_string(),
        remaining_ms: remaining.as_millis() as u64,
    })
    .into_response()
}

const DEFAULT_SAVED_LIMIT: i64 = 50;
const MAX_SAVED_LIMIT: i64 = 500;

/// Either a thread (`board` and `thread`) or the most recent replies.
#[derive(Debug, Deserialize)]
pub struct SavedRepliesParams {
    pub site: Option<String>,
    pub board: Option<String>,
    pub thread: Option<u64>,
    pub limit: Option<i64>,
}

async fn saved_replies(State(state): State<AppState>, Query(params): Query<SavedRepliesParams>) -> Response {
    let pool = state.db.pool();
    let result = match (params.board, params.thread) {
        (Some(board), Some(thread)) => {
            let site = params.site.unwrap_or_else(|| state.config.site_name.clone());
            get_saved_replies_for_thread(pool, &site, &board, thread).await
        }
        (None, Some(_)) => {
            return (StatusCode::BAD_REQUEST, "Board is required with thread").into_response();
        }
        _ => {
            let limit = params
                .limit
                .unwrap_or(DEFAULT_SAVED_LIMIT)
                .clamp(1, MAX_SAVED_LIMIT);
            get_recent_saved_replies(pool, limit).await
        }
    };

    match result {
        Ok(replies) => Json(replies).into_response(),
        Err(e) => {
            tracing::error!("Failed to fetch saved replies: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response()
        }
    }
}

async fn bookmarks(State(state): State<AppState>) -> Response {
    match list_bookmarks(state.db.pool()).await {
        Ok(bookmarks) => Json(bookmarks).into_response(),
        Err(e) => {
            tracing::error!("Failed to list bookmarks: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response()
        }
    }
}
