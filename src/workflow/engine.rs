//! Workflow engine: drives records through the state machine.
//!
//! Every trigger (poller, webhook, sweeper, operator) funnels into
//! [`WorkflowEngine::apply_event`]: run the pure transition, then commit it
//! with a conditional update on `(item_id, state, version)`. A losing commit
//! is dropped as stale, so concurrent triggers on one record produce exactly
//! one winner.
//!
//! Side effects run outside the store lock. In-flight stages are committed
//! before their collaborator call, so a crash mid-call leaves a record that
//! [`WorkflowEngine::recover`] re-drives with the same [`StepTag`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{self, help_text};
use super::machine::{self, Event, Notice, SideEffect, TransitionPolicy};
use super::model::{
    InboundItem, NewLogEntry, TransitionLogEntry, WorkflowRecord, WorkflowStats,
};
use super::state::WorkflowState;
use crate::channels::{
    DeliveryTransport, GenerationBackend, ItemSource, Notification, NotificationChannel, Stage,
    StepTag,
};
use crate::config::WorkflowConfig;
use crate::error::{ChannelError, Result, StageError, WorkflowError};
use crate::store::WorkflowStore;

/// Upper bound on records fetched by one sweep or recovery pass.
const BATCH_LIMIT: usize = 500;

/// Collaborators the engine drives.
pub struct WorkflowDeps {
    pub store: Arc<dyn WorkflowStore>,
    pub generator: Arc<dyn GenerationBackend>,
    pub notifier: Arc<dyn NotificationChannel>,
    pub delivery: Arc<dyn DeliveryTransport>,
    /// Receives status reports; optional for callers that push items in.
    pub source: Option<Arc<dyn ItemSource>>,
}

/// Result of applying one event.
enum Outcome {
    /// Committed; the new record and the auxiliary effects to run.
    Applied(WorkflowRecord, Vec<SideEffect>),
    /// Accepted without a state change.
    NoOp(Vec<SideEffect>),
    /// The event no longer applies, or another writer committed first.
    Stale,
}

/// Where a reply that names no item should go.
#[derive(Debug)]
pub enum ReplyTarget {
    Record(WorkflowRecord),
    /// Nothing is awaiting a reply.
    Nothing,
    /// More than one record is awaiting a reply and the reply cannot be
    /// told apart from a redelivery.
    Ambiguous { waiting: usize },
}

pub struct WorkflowEngine {
    deps: WorkflowDeps,
    config: WorkflowConfig,
    policy: TransitionPolicy,
}

impl WorkflowEngine {
    pub fn new(config: WorkflowConfig, deps: WorkflowDeps) -> Self {
        let policy = config.transition_policy();
        Self {
            deps,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Create a workflow for a new item and drive it until it waits on the
    /// human or ends.
    pub async fn submit_new_item(&self, item: InboundItem) -> Result<Uuid> {
        let record = self.create(item).await?;
        let id = record.id;
        self.drive(record).await?;
        Ok(id)
    }

    /// Apply a human reply and drive the resulting stage to completion.
    pub async fn handle_reply(&self, item_id: &str, raw_text: &str) -> Result<WorkflowRecord> {
        let record = self.accept_reply(item_id, raw_text).await?;
        self.drive(record).await
    }

    /// Commit a human reply without running the stage it starts.
    ///
    /// Fails with `UnknownItem` or `InvalidState` (not awaiting a reply, or
    /// another writer won the race). An unrecognized reply leaves the record
    /// untouched and sends the command help.
    pub async fn accept_reply(&self, item_id: &str, raw_text: &str) -> Result<WorkflowRecord> {
        self.accept_keyed_reply(item_id, raw_text, None).await
    }

    /// [`accept_reply`](Self::accept_reply) for a reply carrying the
    /// gateway's message id.
    ///
    /// The id is claimed in the same commit as the transition, so a
    /// redelivered reply fails with `DuplicateReply` naming the item it was
    /// first applied to, whatever is awaiting a reply now.
    pub async fn accept_keyed_reply(
        &self,
        item_id: &str,
        raw_text: &str,
        reply_key: Option<&str>,
    ) -> Result<WorkflowRecord> {
        if let Some(key) = reply_key {
            self.reject_processed(key).await?;
        }

        let record = self.require(item_id).await?;
        if record.state != WorkflowState::AwaitingReply {
            return Err(invalid_state(&record, WorkflowState::AwaitingReply));
        }

        let command = command::parse(raw_text);
        info!(item_id, command = command.name(), reply_key, "Reply received");

        match self
            .commit_event(&record, Event::Reply(command), reply_key)
            .await?
        {
            Outcome::Applied(next, effects) => {
                self.run_effects(&next, effects).await;
                Ok(next)
            }
            Outcome::NoOp(effects) => {
                if let Some(key) = reply_key {
                    if !self
                        .deps
                        .store
                        .claim_reply_key(key, item_id, Utc::now())
                        .await?
                    {
                        self.reject_processed(key).await?;
                    }
                }
                self.run_effects(&record, effects).await;
                Ok(record)
            }
            Outcome::Stale => {
                if let Some(key) = reply_key {
                    self.reject_processed(key).await?;
                }
                let current = self.require(item_id).await?;
                Err(invalid_state(&current, WorkflowState::AwaitingReply))
            }
        }
    }

    /// Pick the record a reply without an item id belongs to.
    ///
    /// A reply carrying a gateway message id goes to the most recently
    /// notified record; redeliveries are caught by the id. Without one, the
    /// reply is routed only when exactly one record is waiting.
    pub async fn reply_target(&self, keyed: bool) -> Result<ReplyTarget> {
        if keyed {
            return Ok(match self.deps.store.latest_awaiting_reply().await? {
                Some(record) => ReplyTarget::Record(record),
                None => ReplyTarget::Nothing,
            });
        }

        let mut waiting = self
            .deps
            .store
            .list_by_state(WorkflowState::AwaitingReply, 2)
            .await?;
        Ok(match waiting.len() {
            0 => ReplyTarget::Nothing,
            1 => ReplyTarget::Record(waiting.remove(0)),
            _ => {
                let waiting = self
                    .deps
                    .store
                    .stats(Utc::now())
                    .await?
                    .count(WorkflowState::AwaitingReply);
                ReplyTarget::Ambiguous {
                    waiting: usize::try_from(waiting).unwrap_or(usize::MAX),
                }
            }
        })
    }

    /// The item a gateway message id was applied to, if any.
    pub async fn reply_owner(&self, reply_key: &str) -> Result<Option<String>> {
        Ok(self.deps.store.reply_key_owner(reply_key).await?)
    }

    /// Time out every `awaiting_reply` record whose deadline is at or
    /// before `now`. Returns how many were timed out.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.deps.store.list_expired(now, BATCH_LIMIT).await?;
        let mut timed_out = 0;

        for record in expired {
            match self.apply_event(&record, Event::Timeout).await {
                Ok(Outcome::Applied(next, effects)) => {
                    self.run_effects(&next, effects).await;
                    timed_out += 1;
                }
                Ok(_) => {
                    debug!(item_id = %record.item_id, "Timeout lost to a concurrent transition");
                }
                Err(e) => {
                    warn!(item_id = %record.item_id, error = %e, "Failed to time out workflow");
                }
            }
        }

        if timed_out > 0 {
            info!(count = timed_out, "Timed out workflows");
        }
        Ok(timed_out)
    }

    /// Re-arm a failed record into its last in-flight stage and drive it.
    pub async fn retry_failed(&self, item_id: &str) -> Result<WorkflowRecord> {
        let record = self.require(item_id).await?;
        if record.state != WorkflowState::Failed {
            return Err(invalid_state(&record, WorkflowState::Failed));
        }

        match self.apply_event(&record, Event::Rearm).await? {
            Outcome::Applied(next, effects) => {
                info!(item_id, state = %next.state, "Failed workflow re-armed");
                self.run_effects(&next, effects).await;
                self.drive(next).await
            }
            Outcome::NoOp(_) | Outcome::Stale => {
                let current = self.require(item_id).await?;
                Err(invalid_state(&current, WorkflowState::Failed))
            }
        }
    }

    /// Time out an `awaiting_reply` record regardless of its deadline.
    pub async fn force_timeout(&self, item_id: &str) -> Result<WorkflowRecord> {
        let record = self.require(item_id).await?;
        if record.state != WorkflowState::AwaitingReply {
            return Err(invalid_state(&record, WorkflowState::AwaitingReply));
        }

        match self.apply_event(&record, Event::Timeout).await? {
            Outcome::Applied(next, effects) => {
                self.run_effects(&next, effects).await;
                Ok(next)
            }
            Outcome::NoOp(_) | Outcome::Stale => {
                let current = self.require(item_id).await?;
                Err(invalid_state(&current, WorkflowState::AwaitingReply))
            }
        }
    }

    /// Re-drive every record left pending or in flight (e.g. by a restart).
    /// Returns how many records were picked up.
    pub async fn recover(&self) -> Result<usize> {
        let stranded = self.deps.store.list_needing_drive(BATCH_LIMIT).await?;
        let count = stranded.len();
        if count == 0 {
            return Ok(0);
        }

        info!(count, "Recovering in-flight workflows");
        let results = join_all(stranded.into_iter().map(|record| self.drive(record))).await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Recovery drive failed");
            }
        }
        Ok(count)
    }

    /// Reload a record and drive it. `None` if the item is unknown.
    pub async fn drive_item(&self, item_id: &str) -> Result<Option<WorkflowRecord>> {
        match self.deps.store.get_workflow(item_id).await? {
            Some(record) => self.drive(record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Tell the human there is no draft waiting for their reply.
    pub async fn notify_nothing_pending(&self) {
        self.send_notice(None, Notice::NothingPending).await;
    }

    /// Tell the human their reply could not be matched to one draft.
    pub async fn notify_unroutable(&self, waiting: usize) {
        self.send_notice(None, Notice::Unroutable { waiting }).await;
    }

    // ── Read-throughs ───────────────────────────────────────────────

    pub async fn get(&self, item_id: &str) -> Result<Option<WorkflowRecord>> {
        Ok(self.deps.store.get_workflow(item_id).await?)
    }

    pub async fn list_by_state(
        &self,
        state: WorkflowState,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>> {
        Ok(self.deps.store.list_by_state(state, limit).await?)
    }

    pub async fn transition_log(&self, item_id: &str) -> Result<Vec<TransitionLogEntry>> {
        Ok(self.deps.store.transition_log(item_id).await?)
    }

    pub async fn stats(&self) -> Result<WorkflowStats> {
        Ok(self.deps.store.stats(Utc::now()).await?)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn require(&self, item_id: &str) -> Result<WorkflowRecord> {
        self.deps
            .store
            .get_workflow(item_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::UnknownItem {
                    item_id: item_id.to_string(),
                }
                .into()
            })
    }

    async fn create(&self, item: InboundItem) -> Result<WorkflowRecord> {
        let now = Utc::now();
        let record = WorkflowRecord::new(item, now);
        let log = NewLogEntry {
            from_state: None,
            to_state: WorkflowState::Pending,
            reason: "created".into(),
            error_detail: None,
            timestamp: now,
        };

        if !self.deps.store.create_workflow(&record, &log).await? {
            return Err(WorkflowError::DuplicateItem {
                item_id: record.item_id,
            }
            .into());
        }

        info!(item_id = %record.item_id, sender = %record.item.sender, "Workflow created");
        Ok(record)
    }

    async fn reject_processed(&self, reply_key: &str) -> Result<()> {
        match self.deps.store.reply_key_owner(reply_key).await? {
            Some(item_id) => Err(WorkflowError::DuplicateReply {
                reply_key: reply_key.to_string(),
                item_id,
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn apply_event(&self, record: &WorkflowRecord, event: Event) -> Result<Outcome> {
        self.commit_event(record, event, None).await
    }

    /// Run the transition function and commit its result, claiming
    /// `reply_key` in the same write when one is given.
    async fn commit_event(
        &self,
        record: &WorkflowRecord,
        event: Event,
        reply_key: Option<&str>,
    ) -> Result<Outcome> {
        let transition = match machine::apply(record, event, &self.policy, Utc::now()) {
            Ok(t) => t,
            Err(stale) => {
                debug!(item_id = %record.item_id, error = %stale, "Event rejected");
                return Ok(Outcome::Stale);
            }
        };

        let Some(log) = &transition.log else {
            return Ok(Outcome::NoOp(transition.effects));
        };

        let store = &self.deps.store;
        let committed = match reply_key {
            Some(key) => {
                store
                    .commit_reply(record.state, record.version, &transition.record, log, key)
                    .await?
            }
            None => {
                store
                    .commit_transition(record.state, record.version, &transition.record, log)
                    .await?
            }
        };
        if !committed {
            return Ok(Outcome::Stale);
        }

        let next = transition.record;
        if next.state == WorkflowState::Failed {
            warn!(
                item_id = %next.item_id,
                from = %record.state,
                error = next.error.as_deref().unwrap_or_default(),
                "Workflow failed"
            );
        } else {
            info!(
                item_id = %next.item_id,
                from = %record.state,
                to = %next.state,
                reason = %log.reason,
                "Workflow transition"
            );
        }
        Ok(Outcome::Applied(next, transition.effects))
    }

    /// Advance a record until it waits on the human, ends, or another writer
    /// takes it over.
    async fn drive(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord> {
        loop {
            let event = match record.state {
                WorkflowState::Pending => Event::Start,
                WorkflowState::Generated => Event::StartNotify,
                state if state.is_in_flight() => self.perform(&record).await,
                _ => return Ok(record),
            };

            match self.apply_event(&record, event).await? {
                Outcome::Applied(next, effects) => {
                    self.run_effects(&next, effects).await;
                    record = next;
                }
                Outcome::NoOp(effects) => {
                    self.run_effects(&record, effects).await;
                    return Ok(record);
                }
                Outcome::Stale => {
                    debug!(item_id = %record.item_id, "Record moved by another writer; yielding");
                    return self.require(&record.item_id).await;
                }
            }
        }
    }

    /// Run the side effect owed by an in-flight record once, after any
    /// backoff its retry count calls for, and report the outcome as an event.
    async fn perform(&self, record: &WorkflowRecord) -> Event {
        let retry = &self.config.retry;
        if record.retry_count > 0 {
            let delay = retry.backoff(record.retry_count);
            debug!(item_id = %record.item_id, retry = record.retry_count, ?delay, "Backing off");
            tokio::time::sleep(delay).await;
        }

        let item = &record.item;
        match machine::in_flight_effect(record) {
            Some(SideEffect::Generate { guidance }) => {
                let tag = self.tag(record, Stage::Generate);
                let prior = guidance.as_ref().and(record.generated_text.as_deref());
                let call = self
                    .deps
                    .generator
                    .generate(item, prior, guidance.as_deref(), &tag);
                match retry.attempt("generator", call).await {
                    Ok(text) => Event::GenerationOk { text },
                    Err(e) => failure_event(Stage::Generate, e, |reason| Event::GenerationErr {
                        reason,
                    }),
                }
            }
            Some(SideEffect::NotifyDraft) => {
                let Some(draft) = record.generated_text.as_deref() else {
                    return Event::FatalError {
                        detail: "notify: no draft to send".into(),
                    };
                };
                let notification = Notification::draft(
                    self.config.recipient.clone(),
                    item,
                    draft,
                    help_text(),
                    self.tag(record, Stage::Notify),
                );
                match retry
                    .attempt("notifier", self.deps.notifier.notify(&notification))
                    .await
                {
                    Ok(notification_ref) => Event::NotifyOk { notification_ref },
                    Err(e) => failure_event(Stage::Notify, e, |reason| Event::NotifyErr { reason }),
                }
            }
            Some(SideEffect::Deliver) => {
                let Some(text) = record.generated_text.as_deref() else {
                    return Event::FatalError {
                        detail: "deliver: no draft to send".into(),
                    };
                };
                let tag = self.tag(record, Stage::Deliver);
                match retry
                    .attempt("delivery", self.deps.delivery.deliver(item, text, &tag))
                    .await
                {
                    Ok(delivery_ref) => Event::DeliveryOk { delivery_ref },
                    Err(e) => {
                        failure_event(Stage::Deliver, e, |reason| Event::DeliveryErr { reason })
                    }
                }
            }
            _ => Event::FatalError {
                detail: format!("no side effect defined for state {}", record.state),
            },
        }
    }

    fn tag(&self, record: &WorkflowRecord, stage: Stage) -> StepTag {
        StepTag::new(record.item_id.clone(), record.edit_iteration, stage)
    }

    /// Run auxiliary effects: best-effort, one attempt each.
    async fn run_effects(&self, record: &WorkflowRecord, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::Notice(notice) => self.send_notice(Some(record), notice).await,
                SideEffect::ReportStatus(status) => {
                    let Some(source) = &self.deps.source else {
                        continue;
                    };
                    let call = source.report_status(&record.item_id, status);
                    if let Err(e) = self.config.retry.attempt("item_source", call).await {
                        warn!(
                            item_id = %record.item_id,
                            status = status.as_str(),
                            error = %e,
                            "Status report failed"
                        );
                    }
                }
                // In-flight effects are derived from the record by `drive`.
                SideEffect::Generate { .. } | SideEffect::NotifyDraft | SideEffect::Deliver => {}
            }
        }
    }

    async fn send_notice(&self, record: Option<&WorkflowRecord>, notice: Notice) {
        let text = notice_text(record.map(|r| &r.item), &notice);
        let notification = Notification::notice(self.config.recipient.clone(), text);
        let call = self.deps.notifier.notify(&notification);
        if let Err(e) = self.config.retry.attempt("notifier", call).await {
            warn!(
                item_id = record.map(|r| r.item_id.as_str()).unwrap_or_default(),
                notice = ?notice,
                error = %e,
                "Notice not delivered"
            );
        }
    }
}

/// Classify a collaborator failure into the matching machine event.
fn failure_event(stage: Stage, err: ChannelError, retryable: impl FnOnce(String) -> Event) -> Event {
    match StageError::from_channel(stage.as_str(), &err) {
        StageError::Retryable { .. } => retryable(err.to_string()),
        fatal => Event::FatalError {
            detail: fatal.to_string(),
        },
    }
}

fn invalid_state(record: &WorkflowRecord, expected: WorkflowState) -> crate::error::Error {
    WorkflowError::InvalidState {
        item_id: record.item_id.clone(),
        state: record.state,
        expected,
    }
    .into()
}

/// Human-readable text of an informational notice.
pub fn notice_text(item: Option<&InboundItem>, notice: &Notice) -> String {
    let sender = item.map(InboundItem::sender_name).unwrap_or("unknown sender");
    match notice {
        Notice::Help => format!("Did not understand that reply. {}", help_text()),
        Notice::Sent => format!("Reply sent to {sender}"),
        Notice::Ignored => format!("Ignored email from {sender}"),
        Notice::Failed { reason } => {
            let reason: String = reason.chars().take(100).collect();
            format!("Could not finish the reply to {sender}: {reason}")
        }
        Notice::TimedOut => format!("Email from {sender} timed out (no response)"),
        Notice::NothingPending => format!("No pending emails. {}", help_text()),
        Notice::Unroutable { waiting } => {
            format!("{waiting} emails are waiting for a reply; could not tell which one that was for")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_failures_keep_the_stage() {
        let event = failure_event(Stage::Generate, ChannelError::Http("503".into()), |reason| {
            Event::GenerationErr { reason }
        });
        assert!(matches!(event, Event::GenerationErr { ref reason } if reason.contains("503")));
    }

    #[test]
    fn fatal_failures_become_fatal_events() {
        let event = failure_event(
            Stage::Deliver,
            ChannelError::AuthFailed {
                name: "smtp".into(),
                reason: "535".into(),
            },
            |reason| Event::DeliveryErr { reason },
        );
        match event {
            Event::FatalError { detail } => assert!(detail.starts_with("deliver: ")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[test]
    fn notice_texts_name_the_sender() {
        let item = InboundItem::new("m", "Alice <alice@example.com>", "Hi", "");
        assert_eq!(notice_text(Some(&item), &Notice::Sent), "Reply sent to Alice");
        assert!(notice_text(None, &Notice::NothingPending).starts_with("No pending emails."));
        assert!(notice_text(None, &Notice::Help).contains("1 (send)"));
        assert!(notice_text(None, &Notice::Unroutable { waiting: 3 }).starts_with("3 emails"));
    }
}
