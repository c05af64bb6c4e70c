//! Error types for reply-relay.

use std::time::Duration;

use crate::workflow::state::WorkflowState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by external collaborators (item source, generator, SMS, SMTP).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Channel {name} permanently rejected the message: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl ChannelError {
    /// Whether another attempt at the same call could plausibly succeed.
    ///
    /// Malformed requests, rejected credentials and permanent refusals fail
    /// the same way every time; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidMessage(_) | Self::AuthFailed { .. } | Self::Rejected { .. }
        )
    }
}

/// Caller-visible rejections of a single engine operation.
///
/// These never change persisted state.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Item {item_id} already has a workflow")]
    DuplicateItem { item_id: String },

    #[error("Reply {reply_key} was already applied to item {item_id}")]
    DuplicateReply { reply_key: String, item_id: String },

    #[error("No workflow for item {item_id}")]
    UnknownItem { item_id: String },

    #[error("Workflow {item_id} is {state}, expected {expected}")]
    InvalidState {
        item_id: String,
        state: WorkflowState,
        expected: WorkflowState,
    },
}

/// Failure of a side effect at an in-flight stage.
///
/// Retryable errors are contained inside the engine; fatal and
/// iteration-limit errors move the record to `failed` and are kept as the
/// record's `error` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{stage}: {reason}")]
    Retryable { stage: String, reason: String },

    #[error("{stage}: {reason} (giving up)")]
    Fatal { stage: String, reason: String },

    #[error("edit limit of {max} iterations exceeded")]
    IterationLimitExceeded { max: u32 },
}

impl StageError {
    /// Classify a collaborator failure at the given stage.
    pub fn from_channel(stage: impl Into<String>, err: &ChannelError) -> Self {
        let stage = stage.into();
        if err.is_retryable() {
            Self::Retryable {
                stage,
                reason: err.to_string(),
            }
        } else {
            Self::Fatal {
                stage,
                reason: err.to_string(),
            }
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
