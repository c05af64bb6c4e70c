//! `WorkflowStore` trait: single async interface for workflow persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::workflow::model::{NewLogEntry, TransitionLogEntry, WorkflowRecord, WorkflowStats};
use crate::workflow::state::WorkflowState;

/// Durable storage for workflow records and their transition log.
///
/// Every write is atomic with its log entry: a record never changes state
/// without the matching audit row, and vice versa.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert a new record plus its creation log entry.
    ///
    /// Returns `false` (and writes nothing) when a record for the same
    /// `item_id` already exists.
    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError>;

    /// Get a record by external item id.
    async fn get_workflow(&self, item_id: &str) -> Result<Option<WorkflowRecord>, DatabaseError>;

    /// Replace the record with `next` and append `log`, provided the stored
    /// record is still at `expected_state` / `expected_version`.
    ///
    /// Returns `false` if another writer got there first; nothing is written.
    async fn commit_transition(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError>;

    /// Like [`commit_transition`](Self::commit_transition), and also claims
    /// `reply_key` for this item in the same transaction.
    ///
    /// Returns `false`, writing nothing, if the record moved on or the key
    /// was already claimed.
    async fn commit_reply(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
        reply_key: &str,
    ) -> Result<bool, DatabaseError>;

    /// Claim `reply_key` for `item_id` without touching the record.
    /// Returns `false` if the key was already claimed.
    async fn claim_reply_key(
        &self,
        reply_key: &str,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// The item a previously processed reply was applied to.
    async fn reply_key_owner(&self, reply_key: &str) -> Result<Option<String>, DatabaseError>;

    /// Records in `state`, oldest first, up to `limit`.
    async fn list_by_state(
        &self,
        state: WorkflowState,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError>;

    /// `awaiting_reply` records whose deadline is at or before `now`.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError>;

    /// Records the engine should advance on its own (pending, in flight, or
    /// between generation and notification), oldest first.
    async fn list_needing_drive(&self, limit: usize) -> Result<Vec<WorkflowRecord>, DatabaseError>;

    /// The most recently updated `awaiting_reply` record.
    async fn latest_awaiting_reply(&self) -> Result<Option<WorkflowRecord>, DatabaseError>;

    /// Full audit trail of one item, oldest first.
    async fn transition_log(&self, item_id: &str)
    -> Result<Vec<TransitionLogEntry>, DatabaseError>;

    /// Counts per state plus items sent since UTC midnight of `now`.
    async fn stats(&self, now: DateTime<Utc>) -> Result<WorkflowStats, DatabaseError>;
}
