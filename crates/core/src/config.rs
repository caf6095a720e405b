use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine options. All fields have workable defaults; `validate` runs
/// before any run starts, so a bad config never begins a partial run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target submission rate across all workers, in txs per second.
    pub target_rate: f64,

    /// Number of concurrent submission workers.
    pub worker_count: usize,

    /// Seconds to wait for a confirmation before a submitted tx is
    /// marked timed-out and its nonce queued for reconciliation.
    pub timeout_secs: u64,

    /// When enabled, nonce N may be submitted before N-1's
    /// confirmation attempt begins. Out-of-order confirmation is then
    /// possible and handled by the result tracker.
    pub pipelining_enabled: bool,

    /// Rejection ratio over the outcome window that triggers halving
    /// of the admitted rate.
    pub rejection_backoff_threshold: f64,

    /// Number of recent outcomes considered by the rate controller.
    pub outcome_window: usize,

    /// Max retry attempts for transient submission failures.
    pub max_retries: u32,

    /// Base delay for exponential retry backoff.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_rate: 10.0,
            worker_count: 8,
            timeout_secs: 30,
            pipelining_enabled: false,
            rejection_backoff_threshold: 0.2,
            outcome_window: 50,
            max_retries: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_rate > 0.0) {
            return Err(ConfigError::NonPositiveRate(self.target_rate));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(self.rejection_backoff_threshold > 0.0 && self.rejection_backoff_threshold <= 1.0) {
            return Err(ConfigError::ThresholdOutOfRange(
                self.rejection_backoff_threshold,
            ));
        }
        if self.outcome_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}
