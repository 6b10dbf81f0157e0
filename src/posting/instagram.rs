//! Instagram poster: Graph API media container, then publish.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{PostReceipt, Poster, first_field, http_error, message_text};
use crate::error::PostError;
use crate::vault::{Platform, UnitFile};

const GRAPH_API: &str = "https://graph.facebook.com/v18.0";

pub struct InstagramPoster {
    client: reqwest::Client,
    access_token: Option<SecretString>,
    account_id: Option<String>,
    live: bool,
}

impl InstagramPoster {
    pub fn new(
        client: reqwest::Client,
        access_token: Option<SecretString>,
        account_id: Option<String>,
        live: bool,
    ) -> Self {
        Self {
            client,
            access_token,
            account_id,
            live,
        }
    }

    async fn graph_post(&self, url: &str, form: &[(&str, &str)]) -> Result<serde_json::Value, PostError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| PostError::SendFailed {
                platform: "instagram".into(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(http_error(Platform::Instagram, resp).await);
        }
        resp.json().await.map_err(|e| PostError::SendFailed {
            platform: "instagram".into(),
            reason: format!("Invalid response: {e}"),
        })
    }
}

fn image_url(unit: &UnitFile) -> Option<&str> {
    first_field(unit, &["image_url", "image", "media_url"])
}

#[async_trait]
impl Poster for InstagramPoster {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn validate(&self, unit: &UnitFile) -> Result<(), PostError> {
        if image_url(unit).is_none() {
            return Err(PostError::MissingField("No image URL specified".into()));
        }
        if message_text(unit).is_empty() {
            return Err(PostError::MissingField("No caption".into()));
        }
        Ok(())
    }

    async fn post(&self, unit: &UnitFile) -> Result<PostReceipt, PostError> {
        self.validate(unit)?;
        let image = image_url(unit).unwrap_or_default();
        let caption = message_text(unit);

        if !self.live {
            tracing::info!(image = %image, "Dry run: Instagram post not published");
            return Ok(PostReceipt::dry_run());
        }

        let (Some(token), Some(account)) = (&self.access_token, &self.account_id) else {
            return Err(PostError::NotConfigured {
                platform: "instagram".into(),
                reason: "INSTAGRAM_ACCESS_TOKEN and INSTAGRAM_ACCOUNT_ID are required".into(),
            });
        };
        let token = token.expose_secret();

        let container = self
            .graph_post(
                &format!("{GRAPH_API}/{account}/media"),
                &[("image_url", image), ("caption", caption.as_str()), ("access_token", token)],
            )
            .await?;
        let creation_id = container["id"].as_str().ok_or_else(|| PostError::SendFailed {
            platform: "instagram".into(),
            reason: "Media container response had no id".into(),
        })?;

        let published = self
            .graph_post(
                &format!("{GRAPH_API}/{account}/media_publish"),
                &[("creation_id", creation_id), ("access_token", token)],
            )
            .await?;
        let external_id = published["id"].as_str().map(String::from);
        tracing::info!(id = ?external_id, "Instagram post published");

        Ok(PostReceipt {
            external_id,
            url: None,
            dry_run: false,
        })
    }
}
