//! Collaborator seams and their HTTP/SMTP adapters.
//!
//! The engine only sees the four traits below. Every call that belongs to a
//! workflow step carries a [`StepTag`], which adapters forward as an
//! idempotency key so a re-driven step can be de-duplicated downstream.

pub mod email_monitor;
pub mod generator;
pub mod poller;
pub mod sms;
pub mod smtp;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::workflow::machine::SourceStatus;
use crate::workflow::model::InboundItem;

pub use email_monitor::EmailMonitorClient;
pub use generator::HttpGenerator;
pub use poller::spawn_item_poller;
pub use sms::{NotificationFormat, SmsGatewayClient};
pub use smtp::{SmtpConfig, SmtpDelivery};

/// In-flight stage a collaborator call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Notify,
    Deliver,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Notify => "notify",
            Self::Deliver => "deliver",
        }
    }
}

/// Identifies one side-effect step: `item_id:iteration:stage`.
///
/// Stable across retries and restarts of the same step, distinct across
/// edit iterations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTag {
    pub item_id: String,
    pub iteration: u32,
    pub stage: Stage,
}

impl StepTag {
    pub fn new(item_id: impl Into<String>, iteration: u32, stage: Stage) -> Self {
        Self {
            item_id: item_id.into(),
            iteration,
            stage,
        }
    }
}

impl std::fmt::Display for StepTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.item_id, self.iteration, self.stage.as_str())
    }
}

/// A message to the human.
///
/// Drafts carry the inbound item and the draft text; plain notices only a
/// summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub summary: String,
    pub item: Option<InboundItem>,
    pub draft: Option<String>,
    pub command_hint: Option<String>,
    pub tag: Option<StepTag>,
}

impl Notification {
    /// A plain informational message.
    pub fn notice(recipient: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            summary: summary.into(),
            item: None,
            draft: None,
            command_hint: None,
            tag: None,
        }
    }

    /// A draft for review, with the command hint attached.
    pub fn draft(
        recipient: impl Into<String>,
        item: &InboundItem,
        draft: impl Into<String>,
        command_hint: impl Into<String>,
        tag: StepTag,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            summary: format!("{}: {}", item.sender_name(), item.subject),
            item: Some(item.clone()),
            draft: Some(draft.into()),
            command_hint: Some(command_hint.into()),
            tag: Some(tag),
        }
    }
}

/// Yields inbound items and receives status reports about them.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Items waiting for a reply. May include items already tracked.
    async fn fetch_pending(&self) -> Result<Vec<InboundItem>, ChannelError>;

    /// Tell the source how an item is progressing.
    async fn report_status(&self, item_id: &str, status: SourceStatus) -> Result<(), ChannelError>;
}

/// Produces reply drafts.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a draft. `prior_text` and `guidance` are set on edit loops.
    /// An empty draft is an error.
    async fn generate(
        &self,
        item: &InboundItem,
        prior_text: Option<&str>,
        guidance: Option<&str>,
        tag: &StepTag,
    ) -> Result<String, ChannelError>;
}

/// Sends messages to the human. Returns a delivery reference.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<String, ChannelError>;
}

/// Sends the approved reply to the original sender. Returns a delivery id.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        item: &InboundItem,
        final_text: &str,
        tag: &StepTag,
    ) -> Result<String, ChannelError>;
}

/// Map a non-success HTTP status to a classified channel error.
pub(crate) fn status_error(name: &str, status: reqwest::StatusCode, body: String) -> ChannelError {
    match status.as_u16() {
        401 | 403 => ChannelError::AuthFailed {
            name: name.to_string(),
            reason: format!("{status}: {body}"),
        },
        400 | 422 => ChannelError::InvalidMessage(format!("{name} rejected request ({status}): {body}")),
        429 => ChannelError::RateLimited {
            name: name.to_string(),
        },
        _ => ChannelError::Http(format!("{name} returned {status}: {body}")),
    }
}
