//! libSQL backend: async `WorkflowStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::WorkflowStore;
use crate::workflow::model::{
    InboundItem, NewLogEntry, TransitionLogEntry, WorkflowRecord, WorkflowStats,
};
use crate::workflow::state::WorkflowState;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes that
/// span a transaction hold `write_lock`, since statements from concurrent
/// tasks would otherwise interleave inside the same connection's transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Conditional update plus log entry in one transaction, optionally
    /// claiming a reply key alongside.
    async fn commit_guarded(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
        reply_key: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_transition begin: {e}")))?;

        if let Some(key) = reply_key {
            if !claim_key(&tx, key, &next.item_id, &next.updated_at).await? {
                tx.rollback().await.map_err(|e| {
                    DatabaseError::Query(format!("commit_transition rollback: {e}"))
                })?;
                debug!(item_id = %next.item_id, reply_key = key, "Reply key already processed");
                return Ok(false);
            }
        }

        let updated = tx
            .execute(
                "UPDATE workflows SET state = ?1, previous_state = ?2, generated_text = ?3, guidance = ?4, notification_ref = ?5, delivery_ref = ?6, edit_iteration = ?7, retry_count = ?8, error = ?9, timeout_at = ?10, version = ?11, updated_at = ?12 WHERE item_id = ?13 AND state = ?14 AND version = ?15",
                params![
                    next.state.as_str(),
                    opt_text(next.previous_state.as_ref().map(WorkflowState::as_str)),
                    opt_text(next.generated_text.as_deref()),
                    opt_text(next.guidance.as_deref()),
                    opt_text(next.notification_ref.as_deref()),
                    opt_text(next.delivery_ref.as_deref()),
                    i64::from(next.edit_iteration),
                    i64::from(next.retry_count),
                    opt_text(next.error.as_deref()),
                    opt_text(next.timeout_at.as_ref().map(ts).as_deref()),
                    next.version,
                    ts(&next.updated_at),
                    next.item_id.as_str(),
                    expected_state.as_str(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_transition: {e}")))?;

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit_transition rollback: {e}")))?;
            debug!(
                item_id = %next.item_id,
                expected = %expected_state,
                expected_version,
                "Stale transition rejected"
            );
            return Ok(false);
        }

        insert_log(&tx, &next.item_id, log).await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_transition commit: {e}")))?;

        debug!(
            item_id = %next.item_id,
            from = %expected_state,
            to = %next.state,
            version = next.version,
            "Transition committed"
        );
        Ok(true)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding. Fixed width, so text comparison in SQL
/// orders the same way as time.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_state(s: &str) -> Result<WorkflowState, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Map a libsql Row to a WorkflowRecord.
///
/// Column order matches WORKFLOW_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<WorkflowRecord, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let item_json: String = row.get(2).map_err(row_err)?;
    let state: String = row.get(3).map_err(row_err)?;
    let previous_state: Option<String> = row.get(4).map_err(row_err)?;
    let edit_iteration: i64 = row.get(9).map_err(row_err)?;
    let retry_count: i64 = row.get(10).map_err(row_err)?;
    let timeout_at: Option<String> = row.get(12).map_err(row_err)?;
    let created_at: String = row.get(14).map_err(row_err)?;
    let updated_at: String = row.get(15).map_err(row_err)?;

    let item: InboundItem = serde_json::from_str(&item_json)
        .map_err(|e| DatabaseError::Serialization(format!("item snapshot: {e}")))?;

    Ok(WorkflowRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("bad record id {id:?}: {e}")))?,
        item_id: row.get(1).map_err(row_err)?,
        item,
        state: parse_state(&state)?,
        previous_state: previous_state.as_deref().map(parse_state).transpose()?,
        generated_text: row.get(5).map_err(row_err)?,
        guidance: row.get(6).map_err(row_err)?,
        notification_ref: row.get(7).map_err(row_err)?,
        delivery_ref: row.get(8).map_err(row_err)?,
        edit_iteration: u32::try_from(edit_iteration).unwrap_or(0),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        error: row.get(11).map_err(row_err)?,
        timeout_at: timeout_at.as_deref().map(parse_datetime).transpose()?,
        version: row.get(13).map_err(row_err)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<TransitionLogEntry, DatabaseError> {
    let from_state: Option<String> = row.get(2).map_err(row_err)?;
    let to_state: String = row.get(3).map_err(row_err)?;
    let timestamp: String = row.get(6).map_err(row_err)?;
    Ok(TransitionLogEntry {
        id: row.get(0).map_err(row_err)?,
        item_id: row.get(1).map_err(row_err)?,
        from_state: from_state.as_deref().map(parse_state).transpose()?,
        to_state: parse_state(&to_state)?,
        reason: row.get(4).map_err(row_err)?,
        error_detail: row.get(5).map_err(row_err)?,
        timestamp: parse_datetime(&timestamp)?,
    })
}

async fn insert_log(
    conn: &Connection,
    item_id: &str,
    log: &NewLogEntry,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO transition_log (item_id, from_state, to_state, reason, error_detail, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            item_id,
            opt_text(log.from_state.as_ref().map(WorkflowState::as_str)),
            log.to_state.as_str(),
            log.reason.as_str(),
            opt_text(log.error_detail.as_deref()),
            ts(&log.timestamp),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_log: {e}")))?;
    Ok(())
}

/// Record `reply_key` as processed for `item_id`. `false` if already taken.
async fn claim_key(
    conn: &Connection,
    reply_key: &str,
    item_id: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO processed_replies (reply_key, item_id, processed_at) VALUES (?1, ?2, ?3)",
            params![reply_key, item_id, ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_reply_key: {e}")))?;
    Ok(inserted > 0)
}

// ── Trait implementation ────────────────────────────────────────────

const WORKFLOW_COLUMNS: &str = "id, item_id, item, state, previous_state, generated_text, guidance, notification_ref, delivery_ref, edit_iteration, retry_count, error, timeout_at, version, created_at, updated_at";

const LOG_COLUMNS: &str = "id, item_id, from_state, to_state, reason, error_detail, timestamp";

const DRIVEN_STATES: &str = "'pending', 'generating', 'generated', 'notifying', 'sending_final'";

#[async_trait]
impl WorkflowStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError> {
        let item_json = serde_json::to_string(&record.item)
            .map_err(|e| DatabaseError::Serialization(format!("item snapshot: {e}")))?;

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_workflow begin: {e}")))?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO workflows ({WORKFLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    record.id.to_string(),
                    record.item_id.as_str(),
                    item_json,
                    record.state.as_str(),
                    opt_text(record.previous_state.as_ref().map(WorkflowState::as_str)),
                    opt_text(record.generated_text.as_deref()),
                    opt_text(record.guidance.as_deref()),
                    opt_text(record.notification_ref.as_deref()),
                    opt_text(record.delivery_ref.as_deref()),
                    i64::from(record.edit_iteration),
                    i64::from(record.retry_count),
                    opt_text(record.error.as_deref()),
                    opt_text(record.timeout_at.as_ref().map(ts).as_deref()),
                    record.version,
                    ts(&record.created_at),
                    ts(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_workflow: {e}")))?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("create_workflow rollback: {e}")))?;
            return Ok(false);
        }

        insert_log(&tx, &record.item_id, log).await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_workflow commit: {e}")))?;

        debug!(item_id = %record.item_id, "Workflow created");
        Ok(true)
    }

    async fn get_workflow(&self, item_id: &str) -> Result<Option<WorkflowRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                "get_workflow",
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE item_id = ?1"),
                params![item_id],
            )
            .await?;
        Ok(records.pop())
    }

    async fn commit_transition(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError> {
        self.commit_guarded(expected_state, expected_version, next, log, None)
            .await
    }

    async fn commit_reply(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
        reply_key: &str,
    ) -> Result<bool, DatabaseError> {
        self.commit_guarded(expected_state, expected_version, next, log, Some(reply_key))
            .await
    }

    async fn claim_reply_key(
        &self,
        reply_key: &str,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        claim_key(self.conn(), reply_key, item_id, &now).await
    }

    async fn reply_key_owner(&self, reply_key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT item_id FROM processed_replies WHERE reply_key = ?1",
                params![reply_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reply_key_owner: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("reply_key_owner: {e}")))?
        {
            Some(row) => Ok(Some(row.get(0).map_err(row_err)?)),
            None => Ok(None),
        }
    }

    async fn list_by_state(
        &self,
        state: WorkflowState,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.query_records(
            "list_by_state",
            &format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = ?1 ORDER BY created_at ASC LIMIT ?2"
            ),
            params![state.as_str(), limit as i64],
        )
        .await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.query_records(
            "list_expired",
            &format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = 'awaiting_reply' AND timeout_at IS NOT NULL AND timeout_at <= ?1 ORDER BY timeout_at ASC LIMIT ?2"
            ),
            params![ts(&now), limit as i64],
        )
        .await
    }

    async fn list_needing_drive(&self, limit: usize) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.query_records(
            "list_needing_drive",
            &format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state IN ({DRIVEN_STATES}) ORDER BY updated_at ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn latest_awaiting_reply(&self) -> Result<Option<WorkflowRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                "latest_awaiting_reply",
                &format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = 'awaiting_reply' ORDER BY updated_at DESC LIMIT 1"
                ),
                (),
            )
            .await?;
        Ok(records.pop())
    }

    async fn transition_log(
        &self,
        item_id: &str,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM transition_log WHERE item_id = ?1 ORDER BY id ASC"),
                params![item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_log: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_log: {e}")))?
        {
            entries.push(row_to_log_entry(&row)?);
        }
        Ok(entries)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<WorkflowStats, DatabaseError> {
        let conn = self.conn();
        let mut stats = WorkflowStats::default();
        for state in WorkflowState::ALL {
            stats.by_state.insert(state.as_str().to_string(), 0);
        }

        let mut rows = conn
            .query("SELECT state, COUNT(*) FROM workflows GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?
        {
            let state: String = row.get(0).map_err(row_err)?;
            let count: i64 = row.get(1).map_err(row_err)?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            stats.by_state.insert(state, count);
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM workflows WHERE state = 'sent' AND updated_at >= ?1",
                params![ts(&midnight)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats completed_today: {e}")))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats completed_today: {e}")))?
        {
            let count: i64 = row.get(0).map_err(row_err)?;
            stats.completed_today = u64::try_from(count).unwrap_or(0);
        }

        Ok(stats)
    }
}
