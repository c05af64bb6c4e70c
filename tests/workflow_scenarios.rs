//! End-to-end workflow scenarios against an in-memory store and stub
//! collaborators.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::timeout;

use reply_relay::channels::ItemSource;
use reply_relay::channels::poller::{poll_once, spawn_item_poller};
use reply_relay::error::{ChannelError, DatabaseError, Error, WorkflowError};
use reply_relay::store::{LibSqlBackend, WorkflowStore};
use reply_relay::workflow::machine::SourceStatus;
use reply_relay::workflow::model::NewLogEntry;
use reply_relay::workflow::{
    TransitionLogEntry, WorkflowRecord, WorkflowState, WorkflowStats, spawn_timeout_sweeper,
};

use common::{fast_config, harness, harness_over, harness_with, item};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn states(log: &[reply_relay::workflow::TransitionLogEntry]) -> Vec<WorkflowState> {
    log.iter().map(|e| e.to_state).collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn approve_sends_the_draft() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-1")).await.unwrap();

        let waiting = h.engine.get("msg-1").await.unwrap().unwrap();
        assert_eq!(waiting.state, WorkflowState::AwaitingReply);
        assert_eq!(waiting.generated_text.as_deref(), Some("draft 1"));
        assert!(waiting.timeout_at.is_some());

        let drafts = h.notifier.drafts();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].recipient, common::RECIPIENT);
        assert_eq!(drafts[0].summary, "Alice Smith: Lunch on Friday?");

        let done = h.engine.handle_reply("msg-1", "1").await.unwrap();
        assert_eq!(done.state, WorkflowState::Sent);
        assert!(done.timeout_at.is_none());
        assert!(done.delivery_ref.is_some());

        let delivered = h.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "draft 1");
        assert_eq!(delivered[0].tag, "msg-1:0:deliver");

        assert_eq!(h.notifier.notices(), vec!["Reply sent to Alice Smith"]);
        assert_eq!(
            h.source.reports_for("msg-1"),
            vec![SourceStatus::Orchestrating, SourceStatus::Sent]
        );

        let log = h.engine.transition_log("msg-1").await.unwrap();
        assert_eq!(
            states(&log),
            vec![
                WorkflowState::Pending,
                WorkflowState::Generating,
                WorkflowState::Generated,
                WorkflowState::Notifying,
                WorkflowState::AwaitingReply,
                WorkflowState::SendingFinal,
                WorkflowState::Sent,
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn edit_regenerates_with_guidance_then_sends() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-2")).await.unwrap();

        let edited = h
            .engine
            .handle_reply("msg-2", "2 make it casual")
            .await
            .unwrap();
        assert_eq!(edited.state, WorkflowState::AwaitingReply);
        assert_eq!(edited.edit_iteration, 1);
        assert_eq!(edited.generated_text.as_deref(), Some("draft 2"));

        let calls = h.generator.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].guidance, None);
        assert_eq!(calls[0].prior_text, None);
        assert_eq!(calls[1].guidance.as_deref(), Some("make it casual"));
        assert_eq!(calls[1].prior_text.as_deref(), Some("draft 1"));
        assert_eq!(calls[1].tag, "msg-2:1:generate");
        assert_eq!(h.notifier.drafts().len(), 2);

        let done = h.engine.handle_reply("msg-2", "approve").await.unwrap();
        assert_eq!(done.state, WorkflowState::Sent);
        assert_eq!(h.delivery.delivered()[0].text, "draft 2");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ignore_ends_without_delivery() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-3")).await.unwrap();

        let done = h.engine.handle_reply("msg-3", "3").await.unwrap();
        assert_eq!(done.state, WorkflowState::Ignored);
        assert!(h.delivery.delivered().is_empty());
        assert_eq!(h.notifier.notices(), vec!["Ignored email from Alice Smith"]);
        assert_eq!(
            h.source.reports_for("msg-3").last(),
            Some(&SourceStatus::Ignored)
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unanswered_draft_times_out() {
    timeout(TEST_TIMEOUT, async {
        let config = reply_relay::config::WorkflowConfig {
            response_timeout: Duration::ZERO,
            ..fast_config()
        };
        let h = harness_with(config).await;
        h.engine.submit_new_item(item("msg-4")).await.unwrap();

        // Not yet due relative to an earlier clock.
        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(h.engine.sweep_timeouts(earlier).await.unwrap(), 0);

        assert_eq!(h.engine.sweep_timeouts(Utc::now()).await.unwrap(), 1);
        let record = h.engine.get("msg-4").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::TimedOut);
        assert!(record.timeout_at.is_none());
        assert!(h.delivery.delivered().is_empty());
        assert_eq!(
            h.source.reports_for("msg-4").last(),
            Some(&SourceStatus::Timeout)
        );
        // Timeout reminders are off by default.
        assert!(h.notifier.notices().is_empty());

        // A second sweep finds nothing.
        assert_eq!(h.engine.sweep_timeouts(Utc::now()).await.unwrap(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn generation_failures_exhaust_retries() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.generator.fail_always(true);
        h.engine.submit_new_item(item("msg-5")).await.unwrap();

        let record = h.engine.get("msg-5").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::Failed);
        assert_eq!(record.retry_count, 3);
        assert!(record.error.as_deref().unwrap().contains("max retries exceeded"));
        assert_eq!(h.generator.calls().len(), 3);

        let reasons: Vec<String> = h
            .engine
            .transition_log("msg-5")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect();
        assert!(reasons.contains(&"generation failed, retry 1/3".to_string()));
        assert!(reasons.contains(&"generation failed, retry 2/3".to_string()));
        assert_eq!(reasons.last().unwrap(), "generation failed after 3 attempts");

        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Could not finish the reply to Alice Smith"));
        assert_eq!(
            h.source.reports_for("msg-5").last(),
            Some(&SourceStatus::Failed)
        );
    })
    .await
    .expect("test timed out");
}

// ── Invariants ──────────────────────────────────────────────────────────

#[tokio::test]
async fn replayed_reply_is_rejected_without_a_second_log_entry() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-6")).await.unwrap();
        h.engine.handle_reply("msg-6", "1").await.unwrap();
        let before = h.engine.transition_log("msg-6").await.unwrap().len();

        let err = h.engine.handle_reply("msg-6", "1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Workflow(WorkflowError::InvalidState {
                state: WorkflowState::Sent,
                ..
            })
        ));
        assert_eq!(h.engine.transition_log("msg-6").await.unwrap().len(), before);
        assert_eq!(h.delivery.delivered().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn edit_limit_forces_failure() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-7")).await.unwrap();

        for i in 1..=10 {
            let record = h
                .engine
                .handle_reply("msg-7", &format!("2 shorter, take {i}"))
                .await
                .unwrap();
            assert_eq!(record.state, WorkflowState::AwaitingReply);
            assert_eq!(record.edit_iteration, i);
        }

        let record = h.engine.handle_reply("msg-7", "2 once more").await.unwrap();
        assert_eq!(record.state, WorkflowState::Failed);
        assert_eq!(record.edit_iteration, 10);
        assert_eq!(
            record.error.as_deref(),
            Some("edit limit of 10 iterations exceeded")
        );
        assert_eq!(h.generator.calls().len(), 11);

        let log = h.engine.transition_log("msg-7").await.unwrap();
        assert_eq!(log.last().unwrap().reason, "edit_limit_exceeded");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retry_count_is_visible_between_attempts() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.generator.fail_next(ChannelError::Http("503".into()));
        h.generator.fail_next(ChannelError::Http("503".into()));
        h.engine.submit_new_item(item("msg-8")).await.unwrap();

        let record = h.engine.get("msg-8").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::AwaitingReply);
        assert_eq!(record.retry_count, 0);
        assert!(record.error.is_none());

        let log = h.engine.transition_log("msg-8").await.unwrap();
        let retries: Vec<_> = log
            .iter()
            .filter(|e| e.to_state == WorkflowState::Generating && e.error_detail.is_some())
            .collect();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].reason, "generation failed, retry 1/3");
        assert_eq!(retries[1].reason, "generation failed, retry 2/3");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn auth_failure_fails_without_retrying() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.generator.fail_next(ChannelError::AuthFailed {
            name: "generator".into(),
            reason: "401".into(),
        });
        h.engine.submit_new_item(item("msg-9")).await.unwrap();

        let record = h.engine.get("msg-9").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::Failed);
        assert_eq!(h.generator.calls().len(), 1);
        assert!(record.error.as_deref().unwrap().contains("giving up"));
    })
    .await
    .expect("test timed out");
}

/// Store wrapper that stages the reply-vs-sweep race: both sides have read
/// the `awaiting_reply` record before either commits, and the commit moving
/// to `first` lands before the other one is attempted.
struct RaceGate {
    inner: Arc<LibSqlBackend>,
    first: WorkflowState,
    other_reached_commit: Notify,
    first_committed: Notify,
}

impl RaceGate {
    fn new(inner: Arc<LibSqlBackend>, first: WorkflowState) -> Self {
        Self {
            inner,
            first,
            other_reached_commit: Notify::new(),
            first_committed: Notify::new(),
        }
    }
}

#[async_trait]
impl WorkflowStore for RaceGate {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError> {
        self.inner.create_workflow(record, log).await
    }

    async fn get_workflow(&self, item_id: &str) -> Result<Option<WorkflowRecord>, DatabaseError> {
        self.inner.get_workflow(item_id).await
    }

    async fn commit_transition(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
    ) -> Result<bool, DatabaseError> {
        if expected_state != WorkflowState::AwaitingReply {
            return self
                .inner
                .commit_transition(expected_state, expected_version, next, log)
                .await;
        }
        if next.state == self.first {
            self.other_reached_commit.notified().await;
            let committed = self
                .inner
                .commit_transition(expected_state, expected_version, next, log)
                .await;
            self.first_committed.notify_one();
            committed
        } else {
            self.other_reached_commit.notify_one();
            self.first_committed.notified().await;
            self.inner
                .commit_transition(expected_state, expected_version, next, log)
                .await
        }
    }

    async fn commit_reply(
        &self,
        expected_state: WorkflowState,
        expected_version: i64,
        next: &WorkflowRecord,
        log: &NewLogEntry,
        reply_key: &str,
    ) -> Result<bool, DatabaseError> {
        self.inner
            .commit_reply(expected_state, expected_version, next, log, reply_key)
            .await
    }

    async fn claim_reply_key(
        &self,
        reply_key: &str,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.claim_reply_key(reply_key, item_id, now).await
    }

    async fn reply_key_owner(&self, reply_key: &str) -> Result<Option<String>, DatabaseError> {
        self.inner.reply_key_owner(reply_key).await
    }

    async fn list_by_state(
        &self,
        state: WorkflowState,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.inner.list_by_state(state, limit).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.inner.list_expired(now, limit).await
    }

    async fn list_needing_drive(&self, limit: usize) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        self.inner.list_needing_drive(limit).await
    }

    async fn latest_awaiting_reply(&self) -> Result<Option<WorkflowRecord>, DatabaseError> {
        self.inner.latest_awaiting_reply().await
    }

    async fn transition_log(
        &self,
        item_id: &str,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError> {
        self.inner.transition_log(item_id).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<WorkflowStats, DatabaseError> {
        self.inner.stats(now).await
    }
}

async fn raced_harness(first: WorkflowState) -> common::Harness {
    let config = reply_relay::config::WorkflowConfig {
        response_timeout: Duration::ZERO,
        ..fast_config()
    };
    let h = harness_over(config, |store| {
        Arc::new(RaceGate::new(store, first)) as Arc<dyn WorkflowStore>
    })
    .await;
    h.engine.submit_new_item(item("msg-10")).await.unwrap();
    h
}

fn transitions_out_of_awaiting(log: &[TransitionLogEntry]) -> usize {
    log.iter()
        .filter(|e| e.from_state == Some(WorkflowState::AwaitingReply))
        .count()
}

#[tokio::test]
async fn reply_losing_to_the_sweep_is_already_handled() {
    timeout(TEST_TIMEOUT, async {
        let h = raced_harness(WorkflowState::TimedOut).await;

        let (swept, replied) = tokio::join!(
            h.engine.sweep_timeouts(Utc::now()),
            h.engine.accept_reply("msg-10", "1"),
        );
        assert_eq!(swept.unwrap(), 1);
        match replied {
            Err(Error::Workflow(WorkflowError::InvalidState { state, .. })) => {
                assert_eq!(state, WorkflowState::TimedOut);
            }
            other => panic!("expected the reply to lose, got {other:?}"),
        }

        let log = h.engine.transition_log("msg-10").await.unwrap();
        assert_eq!(transitions_out_of_awaiting(&log), 1);
        assert!(h.delivery.delivered().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sweep_losing_to_the_reply_is_a_no_op() {
    timeout(TEST_TIMEOUT, async {
        let h = raced_harness(WorkflowState::SendingFinal).await;

        let (swept, replied) = tokio::join!(
            h.engine.sweep_timeouts(Utc::now()),
            h.engine.accept_reply("msg-10", "1"),
        );
        assert_eq!(swept.unwrap(), 0);
        assert_eq!(replied.unwrap().state, WorkflowState::SendingFinal);

        let log = h.engine.transition_log("msg-10").await.unwrap();
        assert_eq!(transitions_out_of_awaiting(&log), 1);
        assert_eq!(
            h.engine.get("msg-10").await.unwrap().unwrap().state,
            WorkflowState::SendingFinal
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn redelivered_keyed_reply_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-30")).await.unwrap();
        h.engine.submit_new_item(item("msg-31")).await.unwrap();

        let record = h
            .engine
            .accept_keyed_reply("msg-30", "maybe later", Some("gw-7"))
            .await
            .unwrap();
        assert_eq!(record.state, WorkflowState::AwaitingReply);

        // The same gateway message again, now aimed at another record.
        let err = h
            .engine
            .accept_keyed_reply("msg-31", "maybe later", Some("gw-7"))
            .await
            .unwrap_err();
        match err {
            Error::Workflow(WorkflowError::DuplicateReply { item_id, .. }) => {
                assert_eq!(item_id, "msg-30");
            }
            other => panic!("expected a duplicate reply, got {other}"),
        }

        // Help went out once; neither record moved.
        assert_eq!(h.notifier.notices().len(), 1);
        for id in ["msg-30", "msg-31"] {
            let record = h.engine.get(id).await.unwrap().unwrap();
            assert_eq!(record.state, WorkflowState::AwaitingReply);
        }
        assert_eq!(h.engine.reply_owner("gw-7").await.unwrap().as_deref(), Some("msg-30"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn oversized_reply_window_still_waits_for_a_reply() {
    timeout(TEST_TIMEOUT, async {
        let config = reply_relay::config::WorkflowConfig {
            response_timeout: Duration::from_secs(10_000_000_000_000),
            ..fast_config()
        };
        let h = harness_with(config).await;
        h.engine.submit_new_item(item("msg-32")).await.unwrap();

        let record = h.engine.get("msg-32").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::AwaitingReply);
        let deadline = record.timeout_at.unwrap();
        assert!(deadline > Utc::now() + chrono::Duration::days(3000));
        assert_eq!(h.engine.sweep_timeouts(Utc::now()).await.unwrap(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn zero_interval_background_tasks_keep_running() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        let sweeper = spawn_timeout_sweeper(h.engine.clone(), Duration::ZERO);
        let source = h.source.clone() as Arc<dyn ItemSource>;
        let poller = spawn_item_poller(h.engine.clone(), source, Duration::ZERO, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sweeper.is_finished());
        assert!(!poller.is_finished());
        sweeper.abort();
        poller.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unrecognized_reply_keeps_waiting_and_sends_help() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-11")).await.unwrap();
        let before = h.engine.get("msg-11").await.unwrap().unwrap();

        let after = h.engine.handle_reply("msg-11", "maybe later").await.unwrap();
        assert_eq!(after.state, WorkflowState::AwaitingReply);
        assert_eq!(after.version, before.version);

        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Did not understand that reply."));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-12")).await.unwrap();

        let err = h.engine.submit_new_item(item("msg-12")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Workflow(WorkflowError::DuplicateItem { .. })
        ));
        assert_eq!(h.generator.calls().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reply_for_unknown_item_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        let err = h.engine.handle_reply("nope", "1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Workflow(WorkflowError::UnknownItem { .. })
        ));
    })
    .await
    .expect("test timed out");
}

// ── Operator actions ────────────────────────────────────────────────────

#[tokio::test]
async fn failed_delivery_can_be_retried() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-13")).await.unwrap();
        h.delivery.fail_next(ChannelError::InvalidMessage("bad address".into()));

        let failed = h.engine.handle_reply("msg-13", "1").await.unwrap();
        assert_eq!(failed.state, WorkflowState::Failed);
        assert_eq!(failed.previous_state, Some(WorkflowState::SendingFinal));

        let done = h.engine.retry_failed("msg-13").await.unwrap();
        assert_eq!(done.state, WorkflowState::Sent);
        assert_eq!(h.delivery.delivered().len(), 1);
        // Re-armed delivery does not regenerate the draft.
        assert_eq!(h.generator.calls().len(), 1);

        let log = h.engine.transition_log("msg-13").await.unwrap();
        assert!(log.iter().any(|e| e.reason == "manual_retry"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retry_requires_a_failed_record() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-14")).await.unwrap();

        let err = h.engine.retry_failed("msg-14").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Workflow(WorkflowError::InvalidState {
                state: WorkflowState::AwaitingReply,
                expected: WorkflowState::Failed,
                ..
            })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn force_timeout_ignores_the_deadline() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.engine.submit_new_item(item("msg-15")).await.unwrap();

        let record = h.engine.force_timeout("msg-15").await.unwrap();
        assert_eq!(record.state, WorkflowState::TimedOut);

        let err = h.engine.force_timeout("msg-15").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Workflow(WorkflowError::InvalidState { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn recover_drives_stranded_records() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;

        // A record created before a crash, never driven.
        let record = reply_relay::workflow::WorkflowRecord::new(item("msg-16"), Utc::now());
        let log = NewLogEntry {
            from_state: None,
            to_state: WorkflowState::Pending,
            reason: "created".into(),
            error_detail: None,
            timestamp: Utc::now(),
        };
        assert!(h.store.create_workflow(&record, &log).await.unwrap());

        assert_eq!(h.engine.recover().await.unwrap(), 1);
        let record = h.engine.get("msg-16").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::AwaitingReply);

        // Nothing left to pick up.
        assert_eq!(h.engine.recover().await.unwrap(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn notify_retries_then_succeeds() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.notifier.fail_times(2);
        h.engine.submit_new_item(item("msg-17")).await.unwrap();

        let record = h.engine.get("msg-17").await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::AwaitingReply);
        assert_eq!(record.notification_ref.as_deref(), Some("sms-1"));
        assert_eq!(h.notifier.drafts().len(), 1);
    })
    .await
    .expect("test timed out");
}

// ── Poller ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn poll_respects_limit_and_skips_tracked_items() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        for i in 0..4 {
            h.source.push(item(&format!("poll-{i}")));
        }

        assert_eq!(poll_once(&h.engine, h.source.as_ref(), 3).await, 3);
        assert_eq!(poll_once(&h.engine, h.source.as_ref(), 3).await, 1);
        assert_eq!(poll_once(&h.engine, h.source.as_ref(), 3).await, 0);

        let stats = h.engine.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.count(WorkflowState::AwaitingReply), 4);
    })
    .await
    .expect("test timed out");
}
