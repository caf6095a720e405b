use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Floor for the admitted rate so a run can always crawl forward and
/// probe whether the endpoint recovered.
const MIN_RATE_DIVISOR: f64 = 64.0;

/// Multiplicative recovery applied per successful outcome.
const RECOVERY_FACTOR: f64 = 1.05;

struct RateState {
    target_rate: f64,
    current_rate: f64,
    min_rate: f64,
    tokens: f64,
    last_refill: Instant,
    window: VecDeque<bool>,
    window_size: usize,
    rejection_threshold: f64,
}

impl RateState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        // never bank more than one second of burst
        self.tokens = (self.tokens + elapsed * self.current_rate).min(self.current_rate.max(1.0));
    }
}

/// Token-bucket gate with congestion backoff: submissions are paced at
/// `current_rate`, which is halved whenever the rejection ratio over
/// the sliding outcome window crosses the threshold, and recovers
/// multiplicatively toward the configured target on success.
pub struct RateController {
    state: Mutex<RateState>,
}

impl RateController {
    pub fn new(target_rate: f64, window_size: usize, rejection_threshold: f64) -> Self {
        Self {
            state: Mutex::new(RateState {
                target_rate,
                current_rate: target_rate,
                min_rate: target_rate / MIN_RATE_DIVISOR,
                tokens: 1.0,
                last_refill: Instant::now(),
                window: VecDeque::with_capacity(window_size),
                window_size,
                rejection_threshold,
            }),
        }
    }

    /// Waits until the controller admits one submission.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.current_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Feeds one terminal outcome into the congestion window.
    pub async fn record_outcome(&self, rejected: bool) {
        let mut state = self.state.lock().await;
        state.window.push_back(rejected);
        if state.window.len() > state.window_size {
            state.window.pop_front();
        }

        if state.window.len() == state.window_size {
            let rejections = state.window.iter().filter(|r| **r).count();
            let ratio = rejections as f64 / state.window_size as f64;
            if ratio > state.rejection_threshold {
                state.current_rate = (state.current_rate / 2.0).max(state.min_rate);
                state.window.clear();
                warn!(
                    ratio,
                    rate = state.current_rate,
                    "rejection ratio over threshold, halving submission rate"
                );
                return;
            }
        }

        if !rejected && state.current_rate < state.target_rate {
            state.current_rate = (state.current_rate * RECOVERY_FACTOR).min(state.target_rate);
            debug!(rate = state.current_rate, "recovering submission rate");
        }
    }

    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.current_rate
    }
}
