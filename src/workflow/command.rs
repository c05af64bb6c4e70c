//! Reply command parser: turns terse SMS replies into commands.
//!
//! Only the first token of the trimmed message counts as a marker, so
//! "12 people coming" is never read as `1`. Pure string matching, no I/O.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static APPROVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:1|approve|send)$").expect("valid approve regex"));

static EDIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^(?:2|edit)(?:\s+(.*))?$").expect("valid edit regex"));

static IGNORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:3|ignore|skip)$").expect("valid ignore regex"));

/// A decoded human reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Send the current draft as-is.
    Approve,
    /// Regenerate the draft following the given guidance.
    EditWithGuidance { instructions: String },
    /// Drop the item without replying.
    Ignore,
    /// Anything that doesn't match the grammar.
    Unrecognized { raw: String },
}

impl Command {
    /// Short name used in logs and transition reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::EditWithGuidance { .. } => "edit",
            Self::Ignore => "ignore",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Parse a raw reply into a [`Command`]. Total: never fails.
pub fn parse(raw: &str) -> Command {
    let trimmed = raw.trim();

    if APPROVE.is_match(trimmed) {
        return Command::Approve;
    }

    if let Some(caps) = EDIT.captures(trimmed) {
        let instructions = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        return Command::EditWithGuidance { instructions };
    }

    if IGNORE.is_match(trimmed) {
        return Command::Ignore;
    }

    Command::Unrecognized {
        raw: raw.to_string(),
    }
}

/// The command hint attached to every draft notification.
pub fn help_text() -> &'static str {
    "Reply 1 (send), 2 <instructions> (edit, e.g. '2 make it more casual'), or 3 (ignore)"
}
