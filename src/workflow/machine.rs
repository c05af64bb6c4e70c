//! Workflow transition function.
//!
//! `apply` is pure: it takes the current record and an event and returns the
//! next record, the audit entry to append, and the auxiliary side effects to
//! run after the commit. It never touches the store or a collaborator.
//!
//! The side effect of an in-flight state (generate, notify, deliver) is not
//! listed in the transition: it is a function of the record alone
//! ([`in_flight_effect`]), so a record left in flight by a crash is re-driven
//! with exactly the request that was committed.

use chrono::{DateTime, Utc};

use super::command::Command;
use super::model::{NewLogEntry, WorkflowRecord};
use super::state::WorkflowState;
use crate::error::StageError;

/// Longest reply window a record can be given (ten years).
pub const MAX_RESPONSE_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(10 * 365 * 86_400);

/// Bounds and notification policy applied by the transition function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPolicy {
    pub max_edit_iterations: u32,
    pub max_retry_attempts: u32,
    pub response_timeout: std::time::Duration,
    /// Send "reply sent" / "ignored" confirmations.
    pub send_confirmations: bool,
    /// Send a notice when a reply deadline passes.
    pub notify_on_timeout: bool,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            max_edit_iterations: 10,
            max_retry_attempts: 3,
            response_timeout: std::time::Duration::from_secs(86_400),
            send_confirmations: true,
            notify_on_timeout: false,
        }
    }
}

/// Input to the transition function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    GenerationOk { text: String },
    GenerationErr { reason: String },
    StartNotify,
    NotifyOk { notification_ref: String },
    NotifyErr { reason: String },
    Reply(Command),
    Timeout,
    DeliveryOk { delivery_ref: String },
    DeliveryErr { reason: String },
    FatalError { detail: String },
    /// Manual re-arm of a failed record.
    Rearm,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::GenerationOk { .. } => "generation_ok",
            Self::GenerationErr { .. } => "generation_err",
            Self::StartNotify => "start_notify",
            Self::NotifyOk { .. } => "notify_ok",
            Self::NotifyErr { .. } => "notify_err",
            Self::Reply(_) => "reply",
            Self::Timeout => "timeout",
            Self::DeliveryOk { .. } => "delivery_ok",
            Self::DeliveryErr { .. } => "delivery_err",
            Self::FatalError { .. } => "fatal_error",
            Self::Rearm => "rearm",
        }
    }
}

/// Informational messages to the human. Best-effort; never affect state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The reply was not understood; resend the options.
    Help,
    Sent,
    Ignored,
    Failed { reason: String },
    TimedOut,
    /// A reply arrived with no draft awaiting one. Sent outside any transition.
    NothingPending,
    /// A reply without an item id arrived while several drafts await one.
    Unroutable { waiting: usize },
}

/// Status reported back to the item source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Orchestrating,
    Sent,
    Ignored,
    Failed,
    Timeout,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrating => "orchestrating",
            Self::Sent => "sent",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// A side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Generate { guidance: Option<String> },
    NotifyDraft,
    Deliver,
    Notice(Notice),
    ReportStatus(SourceStatus),
}

/// Outcome of applying an event.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The record to persist (unchanged for no-op transitions).
    pub record: WorkflowRecord,
    /// Audit entry; `None` means nothing is committed.
    pub log: Option<NewLogEntry>,
    /// Auxiliary effects to run once the commit succeeded.
    pub effects: Vec<SideEffect>,
}

impl Transition {
    /// Whether this transition must be committed to the store.
    pub fn is_commit(&self) -> bool {
        self.log.is_some()
    }
}

/// The event does not apply to the record's current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {event} is not valid in state {state}")]
pub struct StaleEvent {
    pub state: WorkflowState,
    pub event: &'static str,
}

/// The side effect owed by a record in an in-flight state.
pub fn in_flight_effect(record: &WorkflowRecord) -> Option<SideEffect> {
    match record.state {
        WorkflowState::Generating => Some(SideEffect::Generate {
            guidance: record.guidance.clone(),
        }),
        WorkflowState::Notifying => Some(SideEffect::NotifyDraft),
        WorkflowState::SendingFinal => Some(SideEffect::Deliver),
        _ => None,
    }
}

/// Apply `event` to `record`.
pub fn apply(
    record: &WorkflowRecord,
    event: Event,
    policy: &TransitionPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, StaleEvent> {
    use WorkflowState::*;

    let stale = StaleEvent {
        state: record.state,
        event: event.name(),
    };

    let transition = match (record.state, event) {
        (Pending, Event::Start) => {
            let mut next = step(record, Generating, now);
            next.guidance = None;
            commit(
                record,
                next,
                "start",
                None,
                vec![SideEffect::ReportStatus(SourceStatus::Orchestrating)],
            )
        }

        (Generating, Event::GenerationOk { text }) => {
            let mut next = step(record, Generated, now);
            next.generated_text = Some(text);
            commit(record, next, "generation_ok", None, Vec::new())
        }
        (Generating, Event::GenerationErr { reason }) => {
            stage_failure(record, "generation", reason, policy, now)
        }

        (Generated, Event::StartNotify) => {
            let next = step(record, Notifying, now);
            commit(record, next, "start_notify", None, Vec::new())
        }

        (Notifying, Event::NotifyOk { notification_ref }) => {
            let mut next = step(record, AwaitingReply, now);
            next.notification_ref = Some(notification_ref);
            next.timeout_at = Some(deadline(now, policy));
            commit(record, next, "notify_ok", None, Vec::new())
        }
        (Notifying, Event::NotifyErr { reason }) => {
            stage_failure(record, "notification", reason, policy, now)
        }

        (AwaitingReply, Event::Reply(command)) => reply(record, command, policy, now),

        (AwaitingReply, Event::Timeout) => {
            let next = step(record, TimedOut, now);
            let mut effects = vec![SideEffect::ReportStatus(SourceStatus::Timeout)];
            if policy.notify_on_timeout {
                effects.insert(0, SideEffect::Notice(Notice::TimedOut));
            }
            commit(record, next, "timeout", None, effects)
        }

        (SendingFinal, Event::DeliveryOk { delivery_ref }) => {
            let mut next = step(record, Sent, now);
            next.delivery_ref = Some(delivery_ref);
            let mut effects = vec![SideEffect::ReportStatus(SourceStatus::Sent)];
            if policy.send_confirmations {
                effects.insert(0, SideEffect::Notice(Notice::Sent));
            }
            commit(record, next, "delivery_ok", None, effects)
        }
        (SendingFinal, Event::DeliveryErr { reason }) => {
            stage_failure(record, "delivery", reason, policy, now)
        }

        (state, Event::FatalError { detail }) if !state.is_terminal() => {
            let mut next = step(record, Failed, now);
            next.retry_count = record.retry_count;
            next.error = Some(detail.clone());
            commit(
                record,
                next,
                "fatal_error",
                Some(detail.clone()),
                failure_effects(detail),
            )
        }

        (Failed, Event::Rearm) => {
            let target = match record.previous_state {
                Some(Generated | Notifying | AwaitingReply) => Notifying,
                Some(SendingFinal) => SendingFinal,
                _ => Generating,
            };
            let next = step(record, target, now);
            commit(record, next, "manual_retry", None, Vec::new())
        }

        _ => return Err(stale),
    };

    Ok(transition)
}

/// Handle a human command on an `awaiting_reply` record.
fn reply(
    record: &WorkflowRecord,
    command: Command,
    policy: &TransitionPolicy,
    now: DateTime<Utc>,
) -> Transition {
    use WorkflowState::*;

    match command {
        Command::Approve => {
            let next = step(record, SendingFinal, now);
            commit(record, next, "approve", None, Vec::new())
        }
        // Empty guidance would only burn a generation call for the same draft.
        Command::EditWithGuidance { instructions } if instructions.trim().is_empty() => {
            no_op(record, vec![SideEffect::Notice(Notice::Help)])
        }
        Command::EditWithGuidance { instructions } => {
            let iteration = record.edit_iteration + 1;
            if iteration > policy.max_edit_iterations {
                let detail = StageError::IterationLimitExceeded {
                    max: policy.max_edit_iterations,
                }
                .to_string();
                let mut next = step(record, Failed, now);
                next.error = Some(detail.clone());
                return commit(
                    record,
                    next,
                    "edit_limit_exceeded",
                    Some(detail.clone()),
                    failure_effects(detail),
                );
            }
            let mut next = step(record, Generating, now);
            next.edit_iteration = iteration;
            next.guidance = Some(instructions);
            commit(record, next, &format!("edit #{iteration}"), None, Vec::new())
        }
        Command::Ignore => {
            let next = step(record, Ignored, now);
            let mut effects = vec![SideEffect::ReportStatus(SourceStatus::Ignored)];
            if policy.send_confirmations {
                effects.insert(0, SideEffect::Notice(Notice::Ignored));
            }
            commit(record, next, "ignore", None, effects)
        }
        Command::Unrecognized { .. } => no_op(record, vec![SideEffect::Notice(Notice::Help)]),
    }
}

/// A retryable collaborator failure at an in-flight stage.
///
/// Stays in the same state with `retry_count + 1` until the attempt budget is
/// spent, then fails with `retry_count == max_retry_attempts`.
fn stage_failure(
    record: &WorkflowRecord,
    stage: &str,
    reason: String,
    policy: &TransitionPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let attempts = record.retry_count + 1;
    let detail = StageError::Retryable {
        stage: stage.to_string(),
        reason,
    }
    .to_string();

    if attempts < policy.max_retry_attempts {
        let mut next = step(record, record.state, now);
        next.retry_count = attempts;
        next.error = Some(detail.clone());
        let why = format!("{stage} failed, retry {attempts}/{}", policy.max_retry_attempts);
        return commit(record, next, &why, Some(detail), Vec::new());
    }

    let detail = format!("{detail} (max retries exceeded)");
    let mut next = step(record, WorkflowState::Failed, now);
    next.retry_count = attempts;
    next.error = Some(detail.clone());
    commit(
        record,
        next,
        &format!("{stage} failed after {attempts} attempts"),
        Some(detail.clone()),
        failure_effects(detail),
    )
}

fn failure_effects(reason: String) -> Vec<SideEffect> {
    vec![
        SideEffect::Notice(Notice::Failed { reason }),
        SideEffect::ReportStatus(SourceStatus::Failed),
    ]
}

/// Copy `record` into `to`, with the bookkeeping every committed transition
/// shares: new stage counters, fresh timestamps, deadline only while waiting.
fn step(record: &WorkflowRecord, to: WorkflowState, now: DateTime<Utc>) -> WorkflowRecord {
    debug_assert!(
        record.state.can_transition_to(to),
        "illegal transition {} -> {}",
        record.state,
        to
    );
    let mut next = record.clone();
    next.previous_state = Some(record.state);
    next.state = to;
    next.retry_count = 0;
    next.error = None;
    next.timeout_at = None;
    next.version = record.version + 1;
    next.updated_at = now;
    next
}

fn commit(
    record: &WorkflowRecord,
    next: WorkflowRecord,
    reason: &str,
    error_detail: Option<String>,
    effects: Vec<SideEffect>,
) -> Transition {
    let log = NewLogEntry {
        from_state: Some(record.state),
        to_state: next.state,
        reason: reason.to_string(),
        error_detail,
        timestamp: next.updated_at,
    };
    Transition {
        record: next,
        log: Some(log),
        effects,
    }
}

fn no_op(record: &WorkflowRecord, effects: Vec<SideEffect>) -> Transition {
    Transition {
        record: record.clone(),
        log: None,
        effects,
    }
}

/// `now` plus the reply window, capped at [`MAX_RESPONSE_TIMEOUT`].
fn deadline(now: DateTime<Utc>, policy: &TransitionPolicy) -> DateTime<Utc> {
    chrono::Duration::from_std(policy.response_timeout.min(MAX_RESPONSE_TIMEOUT))
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(now)
}
