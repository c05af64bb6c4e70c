//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::channels::{NotificationFormat, SmtpConfig};
use crate::error::ConfigError;
use crate::workflow::machine::{MAX_RESPONSE_TIMEOUT, TransitionPolicy};
use crate::workflow::retry::RetryPolicy;

/// Parse `key` with `lookup`, falling back to `default` when unset or empty.
fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, key, default).map(Duration::from_secs)
}

/// Like [`secs`], but zero is rejected.
fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let value = secs(lookup, key, default)?;
    if value.is_zero() {
        return Err(invalid(key, "must be at least 1 second"));
    }
    Ok(value)
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Address (phone number) of the human who reviews drafts.
    pub recipient: String,
    /// Edits allowed per item before it fails.
    pub max_edit_iterations: u32,
    /// Attempts per in-flight stage before it fails.
    pub max_retry_attempts: u32,
    /// How long a draft waits for a reply.
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
    pub send_confirmations: bool,
    pub notify_on_timeout: bool,
    pub notification_format: NotificationFormat,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            max_edit_iterations: 10,
            max_retry_attempts: 3,
            response_timeout: Duration::from_secs(86_400), // 24 hours
            retry: RetryPolicy::default(),
            send_confirmations: true,
            notify_on_timeout: false,
            notification_format: NotificationFormat::Condensed,
        }
    }
}

impl WorkflowConfig {
    /// Build config from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let recipient = lookup("RELAY_RECIPIENT")
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_RECIPIENT".into()))?;

        let retry = RetryPolicy {
            base_delay: secs(&lookup, "RELAY_RETRY_BASE_SECS", d.retry.base_delay.as_secs())?,
            max_delay: secs(&lookup, "RELAY_RETRY_MAX_SECS", d.retry.max_delay.as_secs())?,
            call_timeout: secs(
                &lookup,
                "RELAY_CALL_TIMEOUT_SECS",
                d.retry.call_timeout.as_secs(),
            )?,
        };
        retry
            .validate()
            .map_err(|message| invalid("RELAY_CALL_TIMEOUT_SECS", message))?;

        let response_timeout = positive_secs(
            &lookup,
            "RELAY_RESPONSE_TIMEOUT_SECS",
            d.response_timeout.as_secs(),
        )?;
        if response_timeout > MAX_RESPONSE_TIMEOUT {
            return Err(invalid(
                "RELAY_RESPONSE_TIMEOUT_SECS",
                format!("must not exceed {} seconds", MAX_RESPONSE_TIMEOUT.as_secs()),
            ));
        }

        let format = match lookup("RELAY_NOTIFICATION_FORMAT") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "RELAY_NOTIFICATION_FORMAT".into(),
                message,
            })?,
            None => d.notification_format,
        };

        Ok(Self {
            recipient,
            max_edit_iterations: parse_var(
                &lookup,
                "RELAY_MAX_EDIT_ITERATIONS",
                d.max_edit_iterations,
            )?,
            max_retry_attempts: parse_var(
                &lookup,
                "RELAY_MAX_RETRY_ATTEMPTS",
                d.max_retry_attempts,
            )?,
            response_timeout,
            retry,
            send_confirmations: parse_var(
                &lookup,
                "RELAY_SEND_CONFIRMATIONS",
                d.send_confirmations,
            )?,
            notify_on_timeout: parse_var(&lookup, "RELAY_NOTIFY_ON_TIMEOUT", d.notify_on_timeout)?,
            notification_format: format,
        })
    }

    /// The subset the transition function needs.
    pub fn transition_policy(&self) -> TransitionPolicy {
        TransitionPolicy {
            max_edit_iterations: self.max_edit_iterations,
            max_retry_attempts: self.max_retry_attempts,
            response_timeout: self.response_timeout,
            send_confirmations: self.send_confirmations,
            notify_on_timeout: self.notify_on_timeout,
        }
    }
}

/// Service wiring: collaborator endpoints, listener, database, schedules.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub email_monitor_url: String,
    pub generator_url: String,
    pub sms_gateway_url: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// New items submitted per poll (SMS flood guard).
    pub max_items_per_poll: usize,
    pub smtp: SmtpConfig,
}

impl ServiceConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let smtp = SmtpConfig::from_env()?;
        Self::from_lookup(env_lookup, smtp)
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        smtp: SmtpConfig,
    ) -> Result<Self, ConfigError> {
        let url = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            email_monitor_url: url("EMAIL_MONITOR_URL", "http://localhost:8001"),
            generator_url: url("AI_REPLY_GENERATOR_URL", "http://localhost:8002"),
            sms_gateway_url: url("SMS_GATEWAY_URL", "http://localhost:8000"),
            port: parse_var(&lookup, "RELAY_PORT", 8003)?,
            db_path: PathBuf::from(url("RELAY_DB_PATH", "./data/reply-relay.db")),
            log_dir: lookup("RELAY_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            poll_interval: positive_secs(&lookup, "RELAY_POLL_INTERVAL_SECS", 120)?,
            sweep_interval: positive_secs(&lookup, "RELAY_SWEEP_INTERVAL_SECS", 300)?,
            max_items_per_poll: parse_var(&lookup, "RELAY_MAX_ITEMS_PER_POLL", 5)?,
            smtp,
        })
    }
}
