//! Posting workers: deliver approved units to external platforms.
//!
//! Each platform has a `Poster` that validates a unit's metadata and performs
//! the side effect. `PostingWorker` drives them over the `Approved` stage.

pub mod email;
pub mod instagram;
pub mod twitter;
pub mod whatsapp;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{PlatformCredentials, SmtpConfig};
use crate::error::PostError;
use crate::pipeline::drafts::DRAFT_REPLY_HEADING;
use crate::vault::{Platform, UnitFile};

pub use email::EmailPoster;
pub use instagram::InstagramPoster;
pub use twitter::TwitterPoster;
pub use whatsapp::WhatsAppPoster;
pub use worker::{PostStats, PostingWorker};

/// Heading holding the text of a social post.
pub const POST_CONTENT_HEADING: &str = "Post Content";

/// What a successful post returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostReceipt {
    /// Identifier assigned by the platform (tweet id, message id, ...).
    pub external_id: Option<String>,
    pub url: Option<String>,
    /// True when nothing was sent because the worker is not live.
    pub dry_run: bool,
}

impl PostReceipt {
    pub fn dry_run() -> Self {
        Self {
            external_id: None,
            url: None,
            dry_run: true,
        }
    }
}

/// One external platform.
#[async_trait]
pub trait Poster: Send + Sync {
    fn platform(&self) -> Platform;

    /// Check required metadata. Failing here sends the unit straight to
    /// `Failed` without an attempt.
    fn validate(&self, unit: &UnitFile) -> Result<(), PostError>;

    /// Perform the side effect once.
    async fn post(&self, unit: &UnitFile) -> Result<PostReceipt, PostError>;
}

/// Posters keyed by platform.
pub type PosterMap = HashMap<Platform, Arc<dyn Poster>>;

/// Build the standard posters. Platforms without credentials still get a
/// poster; it validates normally and reports `NotConfigured` when live.
pub fn default_posters(live: bool, smtp: Option<SmtpConfig>, creds: &PlatformCredentials) -> PosterMap {
    let client = reqwest::Client::new();
    let posters: Vec<Arc<dyn Poster>> = vec![
        Arc::new(EmailPoster::new(smtp, live)),
        Arc::new(WhatsAppPoster::new(
            client.clone(),
            creds.whatsapp_token.clone(),
            creds.whatsapp_phone_number_id.clone(),
            live,
        )),
        Arc::new(TwitterPoster::new(
            client.clone(),
            creds.twitter_bearer_token.clone(),
            live,
        )),
        Arc::new(InstagramPoster::new(
            client,
            creds.instagram_access_token.clone(),
            creds.instagram_account_id.clone(),
            live,
        )),
    ];
    posters.into_iter().map(|p| (p.platform(), p)).collect()
}

/// Text to send: the `Post Content` or `Draft Reply` section when present,
/// otherwise the whole body.
pub fn message_text(unit: &UnitFile) -> String {
    unit.section(POST_CONTENT_HEADING)
        .or_else(|| unit.section(DRAFT_REPLY_HEADING))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| unit.body().trim().to_string())
}

/// First non-empty value among `keys`.
pub(crate) fn first_field<'a>(unit: &'a UnitFile, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| unit.get_nonempty(k))
}

/// Map a failed HTTP response to a `PostError`: 429 and 5xx are worth
/// retrying, other statuses are final.
pub(crate) async fn http_error(platform: Platform, resp: reqwest::Response) -> PostError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        if status.is_server_error() && retry_after.is_none() {
            return PostError::SendFailed {
                platform: platform.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&body, 200)),
            };
        }
        return PostError::Unavailable {
            platform: platform.to_string(),
            retry_after,
        };
    }
    PostError::Rejected {
        platform: platform.to_string(),
        reason: format!("HTTP {status}: {}", truncate(&body, 200)),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
