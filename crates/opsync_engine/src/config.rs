//! Configuration for the sync engine.

use crate::error::{EngineResult, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync operations.
///
/// Loadable from JSON (camelCase keys); missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Maximum operations per batch.
    pub batch_size: usize,
    /// Polling cadence in milliseconds.
    pub sync_interval_ms: u64,
    /// Cleanup cadence in milliseconds when the network pushes.
    pub push_interval_ms: u64,
    /// Retries before the orchestrator enters the error state.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Cap on a single retry delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Per-operation timeout on the push channel, in milliseconds.
    pub operation_timeout_ms: u64,
    /// Timeout for one HTTP request, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            sync_interval_ms: 5_000,
            push_interval_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            operation_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the polling interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the push-mode cleanup interval.
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the first retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the maximum retry delay.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the push-channel operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the HTTP request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = duration_ms(timeout);
        self
    }

    /// Returns the polling interval.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Returns the push-mode cleanup interval.
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    /// Returns the push-channel operation timeout.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Returns the HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Calculates the delay before the given retry (1-indexed).
    ///
    /// Retry `n` waits `retry_delay * backoff_multiplier^(n-1)`, capped at
    /// `max_retry_delay`. Retry 0 means "no wait".
    pub fn retry_delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let delay = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_retry_delay_ms as f64);

        Duration::from_millis(capped as u64)
    }

    /// Checks that every field is usable.
    pub fn validate(&self) -> EngineResult<()> {
        let positive = [
            ("batchSize", self.batch_size as u64),
            ("syncIntervalMs", self.sync_interval_ms),
            ("pushIntervalMs", self.push_interval_ms),
            ("maxRetries", u64::from(self.max_retries)),
            ("retryDelayMs", self.retry_delay_ms),
            ("maxRetryDelayMs", self.max_retry_delay_ms),
            ("operationTimeoutMs", self.operation_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!("{name} must be positive")));
            }
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "backoffMultiplier must be at least 1, got {}",
                self.backoff_multiplier
            )));
        }

        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(SyncError::InvalidConfig(
                "maxRetryDelayMs must not be below retryDelayMs".into(),
            ));
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
