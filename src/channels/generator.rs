//! HTTP generation backend: asks the reply-generator service for drafts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channels::{GenerationBackend, StepTag, status_error};
use crate::error::ChannelError;
use crate::workflow::model::InboundItem;

const NAME: &str = "generator";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    email_message_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_reply: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    reply_text: String,
}

/// Client for `POST {base}/generate-reply`.
pub struct HttpGenerator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerator {
    async fn generate(
        &self,
        item: &InboundItem,
        prior_text: Option<&str>,
        guidance: Option<&str>,
        tag: &StepTag,
    ) -> Result<String, ChannelError> {
        let request = GenerateRequest {
            email_message_id: &item.item_id,
            context_instructions: guidance,
            prior_reply: prior_text,
        };

        let resp = self
            .client
            .post(format!("{}/generate-reply", self.base_url))
            .header("Idempotency-Key", tag.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{NAME}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(NAME, status, body));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("{NAME} response: {e}")))?;

        let text = parsed.reply_text.trim();
        if text.is_empty() {
            return Err(ChannelError::SendFailed {
                name: NAME.into(),
                reason: "empty draft".into(),
            });
        }

        debug!(step = %tag, chars = text.len(), "Draft generated");
        Ok(text.to_string())
    }
}
