//! Twitter/X poster: v2 tweets endpoint with an app bearer token.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{PostReceipt, Poster, http_error, message_text, truncate};
use crate::error::PostError;
use crate::vault::{Platform, UnitFile};

const TWEETS_URL: &str = "https://api.twitter.com/2/tweets";

pub const MAX_TWEET_CHARS: usize = 280;

pub struct TwitterPoster {
    client: reqwest::Client,
    bearer_token: Option<SecretString>,
    live: bool,
}

impl TwitterPoster {
    pub fn new(client: reqwest::Client, bearer_token: Option<SecretString>, live: bool) -> Self {
        Self {
            client,
            bearer_token,
            live,
        }
    }
}

/// Tweet text, cut to 280 characters.
pub fn tweet_text(unit: &UnitFile) -> String {
    let text = message_text(unit);
    if text.chars().count() <= MAX_TWEET_CHARS {
        return text;
    }
    let mut cut = truncate(&text, MAX_TWEET_CHARS - 3);
    cut.push_str("...");
    cut
}

#[async_trait]
impl Poster for TwitterPoster {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn validate(&self, unit: &UnitFile) -> Result<(), PostError> {
        if message_text(unit).is_empty() {
            return Err(PostError::MissingField("No tweet content".into()));
        }
        Ok(())
    }

    async fn post(&self, unit: &UnitFile) -> Result<PostReceipt, PostError> {
        self.validate(unit)?;
        let text = tweet_text(unit);

        if !self.live {
            tracing::info!(chars = text.chars().count(), "Dry run: tweet not posted");
            return Ok(PostReceipt::dry_run());
        }

        let token = self.bearer_token.as_ref().ok_or_else(|| PostError::NotConfigured {
            platform: "twitter".into(),
            reason: "TWITTER_BEARER_TOKEN not set".into(),
        })?;

        let resp = self
            .client
            .post(TWEETS_URL)
            .bearer_auth(token.expose_secret())
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| PostError::SendFailed {
                platform: "twitter".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(http_error(Platform::Twitter, resp).await);
        }

        let data: serde_json::Value = resp.json().await.unwrap_or_default();
        let external_id = data["data"]["id"].as_str().map(String::from);
        let url = external_id
            .as_ref()
            .map(|id| format!("https://x.com/i/web/status/{id}"));
        tracing::info!(id = ?external_id, "Tweet posted");

        Ok(PostReceipt {
            external_id,
            url,
            dry_run: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_text_truncated_to_limit() {
        let long = "a".repeat(400);
        let unit = UnitFile::parse(&format!("---\ntype: twitter_post\n---\n## Post Content\n\n{long}\n"));
        let text = tweet_text(&unit);
        assert_eq!(text.chars().count(), MAX_TWEET_CHARS);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn short_text_untouched() {
        let unit = UnitFile::parse("---\n---\nShipping today!\n");
        assert_eq!(tweet_text(&unit), "Shipping today!");
    }

    #[test]
    fn empty_post_fails_validation() {
        let poster = TwitterPoster::new(reqwest::Client::new(), None, false);
        let unit = UnitFile::parse("---\ntype: twitter_post\n---\n\n");
        assert!(matches!(poster.validate(&unit), Err(PostError::MissingField(_))));
    }
}
