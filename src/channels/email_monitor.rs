//! Email monitor client: the item source backed by the email-monitor service.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::channels::{ItemSource, status_error};
use crate::error::ChannelError;
use crate::workflow::machine::SourceStatus;
use crate::workflow::model::{InboundItem, ThreadRefs};

const NAME: &str = "email_monitor";

/// An email as listed by `GET /emails/pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingEmail {
    pub message_id: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub from_address: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Option<String>,
}

impl From<PendingEmail> for InboundItem {
    fn from(email: PendingEmail) -> Self {
        let refs = ThreadRefs {
            message_id: Some(email.message_id.clone()),
            in_reply_to: email.in_reply_to,
            references: email.references,
        };
        InboundItem::new(
            email.message_id,
            email.from_address,
            email.subject.unwrap_or_default(),
            email.body_text.unwrap_or_default(),
        )
        .with_thread_refs(refs)
    }
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(default)]
    emails: Vec<PendingEmail>,
}

/// HTTP client for the email-monitor service.
pub struct EmailMonitorClient {
    base_url: String,
    client: reqwest::Client,
}

impl EmailMonitorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ItemSource for EmailMonitorClient {
    async fn fetch_pending(&self) -> Result<Vec<InboundItem>, ChannelError> {
        let resp = self
            .client
            .get(self.url("/emails/pending"))
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{NAME}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(NAME, status, body));
        }

        let parsed: PendingResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("{NAME} response: {e}")))?;

        debug!(count = parsed.emails.len(), "Fetched pending emails");
        Ok(parsed.emails.into_iter().map(InboundItem::from).collect())
    }

    async fn report_status(&self, item_id: &str, status: SourceStatus) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.url(&format!("/emails/{item_id}/status")))
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{NAME}: {e}")))?;

        let code = resp.status();
        if !code.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(NAME, code, body));
        }

        info!(item_id, status = status.as_str(), "Reported item status");
        Ok(())
    }
}
