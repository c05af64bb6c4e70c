//! Shared stubs for the integration tests: scripted collaborators that
//! record every call, plus an engine builder over an in-memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reply_relay::channels::{
    DeliveryTransport, GenerationBackend, ItemSource, Notification, NotificationChannel, StepTag,
};
use reply_relay::config::WorkflowConfig;
use reply_relay::error::ChannelError;
use reply_relay::store::{LibSqlBackend, WorkflowStore};
use reply_relay::workflow::machine::SourceStatus;
use reply_relay::workflow::retry::RetryPolicy;
use reply_relay::workflow::{InboundItem, WorkflowDeps, WorkflowEngine};

pub const RECIPIENT: &str = "+15550100";

// ── Generator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub item_id: String,
    pub prior_text: Option<String>,
    pub guidance: Option<String>,
    pub tag: String,
}

/// Returns "draft N" for the Nth call unless a scripted failure is queued.
#[derive(Default)]
pub struct StubGenerator {
    pub calls: Mutex<Vec<GenerateCall>>,
    failures: Mutex<VecDeque<ChannelError>>,
    always_fail: AtomicBool,
}

impl StubGenerator {
    pub fn fail_next(&self, err: ChannelError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, on: bool) {
        self.always_fail.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for StubGenerator {
    async fn generate(
        &self,
        item: &InboundItem,
        prior_text: Option<&str>,
        guidance: Option<&str>,
        tag: &StepTag,
    ) -> Result<String, ChannelError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(GenerateCall {
                item_id: item.item_id.clone(),
                prior_text: prior_text.map(String::from),
                guidance: guidance.map(String::from),
                tag: tag.to_string(),
            });
            calls.len()
        };

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ChannelError::Http("generator returned 503".into()));
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("draft {n}"))
    }
}

// ── Notifier ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
    fail_remaining: AtomicUsize,
}

impl RecordingNotifier {
    /// Fail the next `n` calls with a transient error.
    pub fn fail_times(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn drafts(&self) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.draft.is_some()).collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|n| n.draft.is_none())
            .map(|n| n.summary)
            .collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<String, ChannelError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ChannelError::Http("sms gateway returned 502".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(notification.clone());
        Ok(format!("sms-{}", sent.len()))
    }
}

// ── Delivery ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Delivered {
    pub item_id: String,
    pub text: String,
    pub tag: String,
}

#[derive(Default)]
pub struct RecordingDelivery {
    pub delivered: Mutex<Vec<Delivered>>,
    failures: Mutex<VecDeque<ChannelError>>,
}

impl RecordingDelivery {
    pub fn fail_next(&self, err: ChannelError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for RecordingDelivery {
    async fn deliver(
        &self,
        item: &InboundItem,
        final_text: &str,
        tag: &StepTag,
    ) -> Result<String, ChannelError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut delivered = self.delivered.lock().unwrap();
        delivered.push(Delivered {
            item_id: item.item_id.clone(),
            text: final_text.to_string(),
            tag: tag.to_string(),
        });
        Ok(format!("<{}@relay.test>", delivered.len()))
    }
}

// ── Item source ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSource {
    pub pending: Mutex<Vec<InboundItem>>,
    pub reports: Mutex<Vec<(String, SourceStatus)>>,
}

impl RecordingSource {
    pub fn push(&self, item: InboundItem) {
        self.pending.lock().unwrap().push(item);
    }

    pub fn reports_for(&self, item_id: &str) -> Vec<SourceStatus> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == item_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl ItemSource for RecordingSource {
    async fn fetch_pending(&self) -> Result<Vec<InboundItem>, ChannelError> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn report_status(&self, item_id: &str, status: SourceStatus) -> Result<(), ChannelError> {
        self.reports
            .lock()
            .unwrap()
            .push((item_id.to_string(), status));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<LibSqlBackend>,
    pub generator: Arc<StubGenerator>,
    pub notifier: Arc<RecordingNotifier>,
    pub delivery: Arc<RecordingDelivery>,
    pub source: Arc<RecordingSource>,
}

/// Defaults with millisecond backoff so retry paths finish quickly. The
/// stubs answer immediately, so the short call timeout never fires.
pub fn fast_config() -> WorkflowConfig {
    WorkflowConfig {
        recipient: RECIPIENT.to_string(),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            call_timeout: Duration::from_millis(10),
        },
        ..WorkflowConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: WorkflowConfig) -> Harness {
    harness_over(config, |store| store as Arc<dyn WorkflowStore>).await
}

/// Harness whose engine talks to the in-memory store through `wrap`.
pub async fn harness_over(
    config: WorkflowConfig,
    wrap: impl FnOnce(Arc<LibSqlBackend>) -> Arc<dyn WorkflowStore>,
) -> Harness {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let generator = Arc::new(StubGenerator::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let source = Arc::new(RecordingSource::default());

    let deps = WorkflowDeps {
        store: wrap(store.clone()),
        generator: generator.clone(),
        notifier: notifier.clone(),
        delivery: delivery.clone(),
        source: Some(source.clone() as Arc<dyn ItemSource>),
    };

    Harness {
        engine: Arc::new(WorkflowEngine::new(config, deps)),
        store,
        generator,
        notifier,
        delivery,
        source,
    }
}

pub fn item(id: &str) -> InboundItem {
    InboundItem::new(
        id,
        "Alice Smith <alice@example.com>",
        "Lunch on Friday?",
        "Are you free for lunch this Friday?",
    )
}
