//! Workflow data model: inbound items, workflow records, audit log entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::WorkflowState;

/// Threading headers of the inbound email, carried through to the reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRefs {
    /// `Message-ID` of the inbound email (becomes the reply's `In-Reply-To`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// `In-Reply-To` header of the inbound email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// `References` header of the inbound email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

/// An inbound item as yielded by the item source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundItem {
    /// Globally unique, immutable external id.
    pub item_id: String,
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub thread_refs: ThreadRefs,
}

impl InboundItem {
    pub fn new(
        item_id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            thread_refs: ThreadRefs::default(),
        }
    }

    pub fn with_thread_refs(mut self, refs: ThreadRefs) -> Self {
        self.thread_refs = refs;
        self
    }

    /// Display name of the sender: the part before `<`, else the local part.
    pub fn sender_name(&self) -> &str {
        match self.sender.split_once('<') {
            Some((name, _)) if !name.trim().is_empty() => name.trim().trim_matches('"'),
            _ => {
                let addr = self.sender.trim().trim_start_matches('<').trim_end_matches('>');
                addr.split('@').next().unwrap_or(addr)
            }
        }
    }
}

/// One workflow per inbound item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Internal record id.
    pub id: Uuid,
    /// External item id (unique).
    pub item_id: String,
    /// Snapshot of the inbound item.
    pub item: InboundItem,
    pub state: WorkflowState,
    pub previous_state: Option<WorkflowState>,
    /// Latest draft from the generation backend.
    pub generated_text: Option<String>,
    /// Guidance attached to the current generation request.
    pub guidance: Option<String>,
    /// Reference of the last draft notification.
    pub notification_ref: Option<String>,
    /// Id returned by the delivery transport.
    pub delivery_ref: Option<String>,
    pub edit_iteration: u32,
    pub retry_count: u32,
    pub error: Option<String>,
    /// Reply deadline; set only while awaiting a reply.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter, bumped on every commit.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a fresh `pending` record for an item.
    pub fn new(item: InboundItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_id: item.item_id.clone(),
            item,
            state: WorkflowState::Pending,
            previous_state: None,
            generated_text: None,
            guidance: None,
            notification_ref: None,
            delivery_ref: None,
            edit_iteration: 0,
            retry_count: 0,
            error: None,
            timeout_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A persisted, append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub id: i64,
    pub item_id: String,
    /// `None` for the entry written when the record is created.
    pub from_state: Option<WorkflowState>,
    pub to_state: WorkflowState,
    pub reason: String,
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A log entry requested by the state machine, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub from_state: Option<WorkflowState>,
    pub to_state: WorkflowState,
    pub reason: String,
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Record counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total: u64,
    /// Count per state name; states with no records are present as 0.
    pub by_state: BTreeMap<String, u64>,
    /// Records that reached `sent` since UTC midnight.
    pub completed_today: u64,
}

impl WorkflowStats {
    pub fn count(&self, state: WorkflowState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}
