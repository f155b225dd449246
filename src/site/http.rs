//! Generic HTTP imageboard site.
//!
//! Posts a multipart form to `{base_url}/{board}/post` and reads a JSON
//! answer. Upload progress is reported per attachment as the body streams.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BoardCooldowns, Site, SitePostEvent};
use crate::drafts::{DraftStore, PreparedReply};
use crate::posting::{ReplyResponse, SiteError};
use crate::target::ReplyTarget;

const USER_AGENT: &str = concat!("chan-reply-poster/", env!("CARGO_PKG_VERSION"));

/// Size of the body chunks progress is reported for.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Longest error body kept in `SiteError::Http`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpSiteConfig {
    pub name: String,
    pub base_url: String,
    pub logged_in: bool,
    pub ignore_reply_cooldowns: bool,
    pub cooldowns: BoardCooldowns,
    pub request_timeout: Duration,
}

pub struct HttpSite {
    config: HttpSiteConfig,
    client: Client,
    drafts: Arc<DraftStore>,
}

/// JSON answer of the post endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PostResponseBody {
    posted: bool,
    post_no: u64,
    thread_no: u64,
    error: Option<String>,
    banned: bool,
    requires_auth: bool,
    cooldown_secs: Option<u64>,
}

enum Step {
    Progress(SitePostEvent),
    Done(reqwest::Result<reqwest::Response>),
}

impl HttpSite {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: HttpSiteConfig, drafts: Arc<DraftStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            client,
            drafts,
        })
    }

    fn post_url(&self, board: &str) -> String {
        format!("{}/{}/post", self.config.base_url.trim_end_matches('/'), board)
    }
}

impl Site for HttpSite {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn post(&self, target: &ReplyTarget) -> BoxStream<'static, SitePostEvent> {
        let client = self.client.clone();
        let drafts = Arc::clone(&self.drafts);
        let url = self.post_url(&target.board);
        let target = target.clone();

        Box::pin(async_stream::stream! {
            let Some(reply) = drafts.prepared(&target).await else {
                yield SitePostEvent::PostError(SiteError::Request(format!("no draft for {target}")));
                return;
            };

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let form = match build_form(&target, &reply, &progress_tx).await {
                Ok(form) => form,
                Err(e) => {
                    yield SitePostEvent::PostError(SiteError::Request(format!("{e:#}")));
                    return;
                }
            };
            // Only the body streams keep senders now; the channel closes with them.
            drop(progress_tx);

            debug!(reply = %target, url = %url, files = reply.files.len(), "Sending post");
            let request = client.post(&url).multipart(form).send();
            tokio::pin!(request);

            let result = loop {
                let step = tokio::select! {
                    Some(event) = progress_rx.recv() => Step::Progress(event),
                    result = &mut request => Step::Done(result),
                };
                match step {
                    Step::Progress(event) => {
                        yield event;
                    }
                    Step::Done(result) => break result,
                }
            };
            while let Ok(event) = progress_rx.try_recv() {
                yield event;
            }

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(reply = %target, "Post request failed: {e}");
                    yield SitePostEvent::PostError(SiteError::Network(e.to_string()));
                    return;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers());
                yield SitePostEvent::PostError(SiteError::RateLimited { retry_after });
                return;
            }
            if !status.is_success() {
                let mut message = response.text().await.unwrap_or_default();
                message.truncate(floor_char_boundary(&message, MAX_ERROR_BODY));
                yield SitePostEvent::PostError(SiteError::Http { status: status.as_u16(), message });
                return;
            }

            match response.json::<PostResponseBody>().await {
                Ok(body) => {
                    yield SitePostEvent::PostComplete(into_reply_response(body, &target, reply.password));
                }
                Err(e) => {
                    yield SitePostEvent::PostError(SiteError::InvalidResponse(e.to_string()));
                }
            }
        })
    }

    fn is_logged_in(&self) -> bool {
        self.config.logged_in
    }

    fn board_cooldowns(&self, _board: &str) -> Option<BoardCooldowns> {
        Some(self.config.cooldowns).filter(|c| *c != BoardCooldowns::default())
    }

    fn ignores_reply_cooldowns(&self) -> bool {
        self.config.ignore_reply_cooldowns
    }
}

async fn build_form(
    target: &ReplyTarget,
    reply: &PreparedReply,
    progress: &mpsc::UnboundedSender<SitePostEvent>,
) -> Result<Form> {
    let mut form = Form::new()
        .text("name", reply.name.clone())
        .text("subject", reply.subject.clone())
        .text("comment", reply.comment.clone())
        .text("password", reply.password.clone());

    if let Some(thread) = target.thread {
        form = form.text("thread", thread.to_string());
    }
    if let Some(captcha) = &reply.captcha {
        form = form.text("captcha", captcha.clone());
    }

    let total_files = reply.files.len() as u32;
    for (index, path) in reply.files.iter().enumerate() {
        let file_index = index as u32 + 1;
        let part = file_part(path, file_index, total_files, progress.clone()).await?;
        form = form.part(format!("file{file_index}"), part);
    }

    Ok(form)
}

/// Streamed part that reports progress as its chunks are consumed.
async fn file_part(
    path: &Path,
    file_index: u32,
    total_files: u32,
    progress: mpsc::UnboundedSender<SitePostEvent>,
) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read attachment: {}", path.display()))?;
    let len = bytes.len() as u64;
    let file_name = path
        .file_name()
        .map_or_else(|| format!("file{file_index}"), |n| n.to_string_lossy().into_owned());
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let chunks: Vec<Vec<u8>> = bytes.chunks(UPLOAD_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    let body = stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        let percent = if len == 0 { 100 } else { (sent * 100 / len) as u32 };
        let _ = progress.send(SitePostEvent::UploadingProgress {
            file_index,
            total_files,
            percent,
        });
        if file_index == total_files && sent == len {
            let _ = progress.send(SitePostEvent::Uploaded);
        }
        Ok::<_, std::io::Error>(chunk)
    });

    Part::stream_with_length(Body::wrap_stream(body), len)
        .file_name(file_name)
        .mime_str(mime.as_ref())
        .context("Invalid attachment mime type")
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn into_reply_response(body: PostResponseBody, target: &ReplyTarget, password: String) -> ReplyResponse {
    ReplyResponse {
        posted: body.posted,
        error_message: body.error,
        probably_banned: body.banned,
        requires_authentication: body.requires_auth,
        site: target.site.clone(),
        board: target.board.clone(),
        thread_no: if body.thread_no == 0 {
            target.thread.unwrap_or(0)
        } else {
            body.thread_no
        },
        post_no: body.post_no,
        password,
        cooldown: body.cooldown_secs.map(Duration::from_secs),
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
