//! SMTP delivery via lettre: sends the approved reply to the original sender.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{DeliveryTransport, StepTag};
use crate::error::{ChannelError, ConfigError};
use crate::workflow::model::InboundItem;

const NAME: &str = "smtp";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Limit on each network operation of one send.
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Build config from `SMTP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host =
            std::env::var("SMTP_HOST").map_err(|_| ConfigError::MissingEnvVar("SMTP_HOST".into()))?;

        let port = match std::env::var("SMTP_PORT") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("{e}"),
            })?,
            Err(_) => 587,
        };

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let timeout = match std::env::var("SMTP_TIMEOUT_SECS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "SMTP_TIMEOUT_SECS".into(),
                        message: "must be at least 1 second".into(),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        key: "SMTP_TIMEOUT_SECS".into(),
                        message: format!("{e}"),
                    });
                }
            },
            Err(_) => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            host,
            port,
            username,
            password,
            from_address,
            timeout,
        })
    }

    /// A send must give up before the engine abandons the call, or the
    /// abandoned send could still complete alongside the next attempt.
    pub fn check_call_timeout(&self, call_timeout: Duration) -> Result<(), ConfigError> {
        if self.timeout >= call_timeout {
            return Err(ConfigError::InvalidValue {
                key: "SMTP_TIMEOUT_SECS".into(),
                message: format!(
                    "{:?} must be shorter than the call timeout {call_timeout:?}",
                    self.timeout
                ),
            });
        }
        Ok(())
    }
}

// ── Message building ────────────────────────────────────────────────

/// `Re: <subject>`, without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// `References` for the reply: the inbound chain plus the inbound id.
fn reply_references(item: &InboundItem) -> Option<String> {
    let refs = &item.thread_refs;
    match (refs.references.as_deref(), refs.message_id.as_deref()) {
        (Some(chain), Some(id)) if !chain.contains(id) => Some(format!("{chain} {id}")),
        (Some(chain), _) => Some(chain.to_string()),
        (None, Some(id)) => Some(id.to_string()),
        (None, None) => None,
    }
}

fn invalid(what: &str, e: impl std::fmt::Display) -> ChannelError {
    ChannelError::InvalidMessage(format!("{NAME}: {what}: {e}"))
}

/// `Message-ID` for the reply sent at `tag`.
///
/// Derived from the tag, so every attempt at the same step carries the same
/// id and receiving servers can drop a second copy.
fn reply_message_id(tag: &StepTag, domain: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, tag.to_string().as_bytes());
    format!("<{id}@{domain}>")
}

/// Build the reply message. Returns it with its `Message-ID`.
fn build_reply(
    from_address: &str,
    item: &InboundItem,
    body: &str,
    tag: &StepTag,
) -> Result<(Message, String), ChannelError> {
    let from: Mailbox = from_address.parse().map_err(|e| invalid("from address", e))?;
    let to: Mailbox = item.sender.parse().map_err(|e| invalid("to address", e))?;

    let message_id = reply_message_id(tag, from.email.domain());

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(reply_subject(&item.subject))
        .message_id(Some(message_id.clone()));

    if let Some(parent) = &item.thread_refs.message_id {
        builder = builder.in_reply_to(parent.clone());
    }
    if let Some(references) = reply_references(item) {
        builder = builder.references(references);
    }

    let message = builder
        .body(body.to_string())
        .map_err(|e| invalid("build", e))?;
    Ok((message, message_id))
}

/// Permanent (5xx) refusals will not succeed on another attempt.
fn send_failure(permanent: bool, e: impl std::fmt::Display) -> ChannelError {
    if permanent {
        ChannelError::Rejected {
            name: NAME.into(),
            reason: format!("SMTP rejected message: {e}"),
        }
    } else {
        ChannelError::SendFailed {
            name: NAME.into(),
            reason: format!("SMTP send failed: {e}"),
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Delivery transport over authenticated SMTP (STARTTLS relay).
pub struct SmtpDelivery {
    config: SmtpConfig,
}

impl SmtpDelivery {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Send a message synchronously. Run inside `spawn_blocking`.
    fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), ChannelError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        transport
            .send(message)
            .map_err(|e| send_failure(e.is_permanent(), e))?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryTransport for SmtpDelivery {
    async fn deliver(
        &self,
        item: &InboundItem,
        final_text: &str,
        tag: &StepTag,
    ) -> Result<String, ChannelError> {
        let (message, message_id) =
            build_reply(&self.config.from_address, item, final_text, tag)?;

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &message))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP task failed: {e}"),
            })??;

        tracing::info!(step = %tag, to = %item.sender, message_id = %message_id, "Reply delivered");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Stage;
    use crate::workflow::model::ThreadRefs;

    fn tag(iteration: u32) -> StepTag {
        StepTag::new("<in@mail.example.com>", iteration, Stage::Deliver)
    }

    fn item() -> InboundItem {
        InboundItem::new(
            "<in@mail.example.com>",
            "Alice <alice@example.com>",
            "Lunch?",
            "Free Friday?",
        )
        .with_thread_refs(ThreadRefs {
            message_id: Some("<in@mail.example.com>".into()),
            in_reply_to: None,
            references: Some("<root@mail.example.com>".into()),
        })
    }

    #[test]
    fn subject_prefix_is_not_stacked() {
        assert_eq!(reply_subject("Lunch?"), "Re: Lunch?");
        assert_eq!(reply_subject("RE: Lunch?"), "RE: Lunch?");
        assert_eq!(reply_subject("re:x"), "re:x");
        assert_eq!(reply_subject(""), "Re: ");
    }

    #[test]
    fn references_extend_the_chain() {
        assert_eq!(
            reply_references(&item()).as_deref(),
            Some("<root@mail.example.com> <in@mail.example.com>")
        );
        let bare = InboundItem::new("m", "a@b.c", "", "");
        assert!(reply_references(&bare).is_none());
    }

    #[test]
    fn reply_has_threading_headers() {
        let (message, message_id) =
            build_reply("Me <me@example.org>", &item(), "Friday works.", &tag(0)).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(message_id.ends_with("@example.org>"));
        assert!(raw.contains("Subject: Re: Lunch?"));
        assert!(raw.contains("In-Reply-To: <in@mail.example.com>"));
        assert!(raw.contains(&format!("Message-ID: {message_id}")));
    }

    #[test]
    fn bad_recipient_is_not_retryable() {
        let bad = InboundItem::new("m", "not an address", "s", "b");
        let err = build_reply("me@example.org", &bad, "x", &tag(0)).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn resent_step_reuses_the_message_id() {
        let (_, first) = build_reply("me@example.org", &item(), "Friday works.", &tag(1)).unwrap();
        let (_, again) = build_reply("me@example.org", &item(), "Friday works.", &tag(1)).unwrap();
        assert_eq!(first, again);

        let (_, next_round) =
            build_reply("me@example.org", &item(), "Friday works.", &tag(2)).unwrap();
        assert_ne!(first, next_round);
        assert!(next_round.ends_with("@example.org>"));
    }

    #[test]
    fn permanent_rejection_is_not_an_auth_failure() {
        let err = send_failure(true, "550 5.1.1 mailbox unavailable");
        assert!(matches!(err, ChannelError::Rejected { .. }));
        assert!(!err.is_retryable());

        let err = send_failure(false, "421 try again later");
        assert!(matches!(err, ChannelError::SendFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn smtp_timeout_must_undercut_the_call_timeout() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "me".into(),
            password: SecretString::from("pw"),
            from_address: "me@example.com".into(),
            timeout: Duration::from_secs(10),
        };
        assert!(config.check_call_timeout(Duration::from_secs(20)).is_ok());
        assert!(config.check_call_timeout(Duration::from_secs(10)).is_err());
    }
}
