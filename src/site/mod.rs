//! Remote imageboard sites and the registry that resolves them.

mod http;
mod registry;

pub use http::{HttpSite, HttpSiteConfig};
pub use registry::SiteRegistry;

use futures_util::stream::BoxStream;

use crate::posting::{ReplyResponse, SiteError};
use crate::target::ReplyTarget;

/// Event emitted by a site while a post is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum SitePostEvent {
    UploadingProgress {
        file_index: u32,
        total_files: u32,
        percent: u32,
    },
    /// The request body was fully sent; waiting for the site's answer.
    Uploaded,
    PostComplete(ReplyResponse),
    PostError(SiteError),
}

/// Board posting limits declared by the site, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardCooldowns {
    pub threads: u64,
    pub replies: u64,
    pub images: u64,
}

/// A remote site that replies can be posted to.
pub trait Site: Send + Sync {
    /// Identifier matching [`ReplyTarget::site`].
    fn name(&self) -> &str;

    /// Submit the draft for `target`.
    ///
    /// The stream must end after a `PostComplete` or `PostError` event.
    /// Dropping the stream aborts the request.
    fn post(&self, target: &ReplyTarget) -> BoxStream<'static, SitePostEvent>;

    /// Whether the user is authenticated (passcode or account), which halves
    /// cooldowns.
    fn is_logged_in(&self) -> bool {
        false
    }

    /// Static cooldowns of a board, if the site publishes them.
    fn board_cooldowns(&self, _board: &str) -> Option<BoardCooldowns> {
        None
    }

    /// Skip all client-side cooldown checks for this site.
    fn ignores_reply_cooldowns(&self) -> bool {
        false
    }
}
