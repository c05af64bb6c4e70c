//! SMS gateway client: the notification channel.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channels::{Notification, NotificationChannel, status_error};
use crate::error::ChannelError;

const NAME: &str = "sms";

const BODY_PREVIEW_CHARS: usize = 80;
const DRAFT_PREVIEW_CHARS: usize = 150;

/// Layout of draft notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotificationFormat {
    /// One SMS: sender, body preview, draft preview, hint.
    #[default]
    Condensed,
    /// Sender, subject and body on separate lines.
    Multipart,
}

impl std::str::FromStr for NotificationFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "condensed" => Ok(Self::Condensed),
            "multipart" => Ok(Self::Multipart),
            other => Err(format!("unknown notification format: {other}")),
        }
    }
}

/// Cut `text` to at most `max` characters, marking the cut with "...".
fn preview(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Render a notification as SMS text.
pub fn format_notification(notification: &Notification, format: NotificationFormat) -> String {
    let (Some(item), Some(draft)) = (&notification.item, &notification.draft) else {
        return match &notification.command_hint {
            Some(hint) => format!("{}\n{hint}", notification.summary),
            None => notification.summary.clone(),
        };
    };

    let body = preview(&item.body, BODY_PREVIEW_CHARS);
    let draft = preview(draft, DRAFT_PREVIEW_CHARS);
    let hint = notification.command_hint.as_deref().unwrap_or_default();

    let text = match format {
        NotificationFormat::Condensed => {
            format!("{}: \"{body}\"\nDraft: \"{draft}\"\n{hint}", item.sender_name())
        }
        NotificationFormat::Multipart => format!(
            "From: {}\nSubject: {}\nBody: \"{body}\"\nDraft: \"{draft}\"\n{hint}",
            item.sender_name(),
            item.subject
        ),
    };
    text.trim_end().to_string()
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for `POST {base}/sms/send`.
pub struct SmsGatewayClient {
    base_url: String,
    format: NotificationFormat,
    client: reqwest::Client,
}

impl SmsGatewayClient {
    pub fn new(base_url: impl Into<String>, format: NotificationFormat) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            format,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SmsGatewayClient {
    async fn notify(&self, notification: &Notification) -> Result<String, ChannelError> {
        let message = format_notification(notification, self.format);

        let mut request = self
            .client
            .post(format!("{}/sms/send", self.base_url))
            .json(&serde_json::json!({
                "phone_number": notification.recipient,
                "message": message,
            }));
        if let Some(tag) = &notification.tag {
            request = request.header("Idempotency-Key", tag.to_string());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{NAME}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(NAME, status, body));
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("{NAME} response: {e}")))?;

        if !parsed.success {
            let reason = parsed.error.unwrap_or_else(|| "gateway reported failure".into());
            warn!(reason = %reason, "SMS gateway rejected message");
            return Err(ChannelError::SendFailed {
                name: NAME.into(),
                reason,
            });
        }

        let message_id = parsed.message_id.unwrap_or_default();
        debug!(message_id = %message_id, chars = message.chars().count(), "SMS sent");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Stage, StepTag};
    use crate::workflow::model::InboundItem;

    fn draft(body: &str, text: &str) -> Notification {
        let item = InboundItem::new("m", "Alice Smith <alice@example.com>", "Lunch?", body);
        Notification::draft(
            "+15550100",
            &item,
            text,
            "1=Send 2=Edit 3=Ignore",
            StepTag::new("m", 0, Stage::Notify),
        )
    }

    #[test]
    fn condensed_layout() {
        let text = format_notification(
            &draft("Free Friday?", "Sure, Friday works."),
            NotificationFormat::Condensed,
        );
        assert_eq!(
            text,
            "Alice Smith: \"Free Friday?\"\nDraft: \"Sure, Friday works.\"\n1=Send 2=Edit 3=Ignore"
        );
    }

    #[test]
    fn multipart_layout_includes_subject() {
        let text = format_notification(&draft("Hi", "Hello"), NotificationFormat::Multipart);
        assert!(text.starts_with("From: Alice Smith\nSubject: Lunch?\n"));
        assert!(text.ends_with("1=Send 2=Edit 3=Ignore"));
    }

    #[test]
    fn long_texts_are_truncated_on_char_boundaries() {
        let body = "é".repeat(100);
        let reply = "x".repeat(200);
        let text = format_notification(&draft(&body, &reply), NotificationFormat::Condensed);
        assert!(text.contains(&format!("\"{}...\"", "é".repeat(80))));
        assert!(text.contains(&format!("Draft: \"{}...\"", "x".repeat(150))));
    }

    #[test]
    fn plain_notice_is_summary_only() {
        let notice = Notification::notice("+15550100", "Reply sent to Alice");
        assert_eq!(
            format_notification(&notice, NotificationFormat::Condensed),
            "Reply sent to Alice"
        );
    }

    #[test]
    fn format_parses() {
        assert_eq!(
            "Multipart".parse::<NotificationFormat>().unwrap(),
            NotificationFormat::Multipart
        );
        assert!("fancy".parse::<NotificationFormat>().is_err());
    }
}
