//! WhatsApp poster: Cloud API text messages.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{PostReceipt, Poster, first_field, http_error, message_text};
use crate::error::PostError;
use crate::vault::{Platform, UnitFile};

const GRAPH_API: &str = "https://graph.facebook.com/v18.0";

pub struct WhatsAppPoster {
    client: reqwest::Client,
    token: Option<SecretString>,
    phone_number_id: Option<String>,
    live: bool,
}

impl WhatsAppPoster {
    pub fn new(
        client: reqwest::Client,
        token: Option<SecretString>,
        phone_number_id: Option<String>,
        live: bool,
    ) -> Self {
        Self {
            client,
            token,
            phone_number_id,
            live,
        }
    }
}

/// Destination number from the header: `phone`, then `to`, then `recipient`.
/// The message text is never searched.
pub fn phone_number(unit: &UnitFile) -> Option<String> {
    first_field(unit, &["phone", "to", "recipient"]).map(String::from)
}

#[async_trait]
impl Poster for WhatsAppPoster {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    fn validate(&self, unit: &UnitFile) -> Result<(), PostError> {
        if phone_number(unit).is_none() {
            return Err(PostError::MissingField("No phone number specified".into()));
        }
        if message_text(unit).is_empty() {
            return Err(PostError::MissingField("No message text".into()));
        }
        Ok(())
    }

    async fn post(&self, unit: &UnitFile) -> Result<PostReceipt, PostError> {
        self.validate(unit)?;
        let phone = phone_number(unit).unwrap_or_default();
        let text = message_text(unit);

        if !self.live {
            tracing::info!(phone = %phone, chars = text.chars().count(), "Dry run: WhatsApp message not sent");
            return Ok(PostReceipt::dry_run());
        }

        let (Some(token), Some(phone_id)) = (&self.token, &self.phone_number_id) else {
            return Err(PostError::NotConfigured {
                platform: "whatsapp".into(),
                reason: "WHATSAPP_TOKEN and WHATSAPP_PHONE_NUMBER_ID are required".into(),
            });
        };

        let url = format!("{GRAPH_API}/{phone_id}/messages");
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": phone.trim_start_matches('+'),
            "type": "text",
            "text": { "body": text },
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| PostError::SendFailed {
                platform: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(http_error(Platform::WhatsApp, resp).await);
        }

        let data: serde_json::Value = resp.json().await.unwrap_or_default();
        let external_id = data["messages"][0]["id"].as_str().map(String::from);
        tracing::info!(phone = %phone, id = ?external_id, "WhatsApp message sent");

        Ok(PostReceipt {
            external_id,
            url: None,
            dry_run: false,
        })
    }
}
