//! Per-attempt timeout and exponential backoff for collaborator calls.

use std::future::Future;
use std::time::Duration;

use crate::error::ChannelError;

/// Backoff and call-timeout settings for in-flight stages.
///
/// `call_timeout` must stay below `base_delay`: a call abandoned at its
/// deadline gets at least one full backoff to wind down before the next
/// attempt at the same step begins. Configuration loading rejects policies
/// that break this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Wall-clock limit on one collaborator call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            call_timeout: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`. Zero for `retry == 0`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Check the ordering `0 < call_timeout < base_delay <= max_delay`.
    pub fn validate(&self) -> Result<(), String> {
        if self.call_timeout.is_zero() {
            return Err("call timeout must be positive".into());
        }
        if self.call_timeout >= self.base_delay {
            return Err(format!(
                "call timeout {:?} must be shorter than the retry base delay {:?}",
                self.call_timeout, self.base_delay
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(format!(
                "retry max delay {:?} is below the base delay {:?}",
                self.max_delay, self.base_delay
            ));
        }
        Ok(())
    }

    /// Run one collaborator call under `call_timeout`.
    ///
    /// An elapsed deadline becomes [`ChannelError::Timeout`], which is retryable.
    pub async fn attempt<T, F>(&self, name: &str, call: F) -> Result<T, ChannelError>
    where
        F: Future<Output = Result<T, ChannelError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                name: name.to_string(),
                timeout: self.call_timeout,
            }),
        }
    }
}
