use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How the delay grows between consecutive attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential {
        factor: f64,
        #[serde(default = "default_max_delay_secs")]
        max_delay_secs: u64,
    },
}

fn default_max_delay_secs() -> u64 {
    300
}

/// Retry schedule for one failure condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub delay_secs: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(delay_secs: u64) -> Self {
        Self {
            delay_secs,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempt limit is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let base = Duration::from_secs(self.delay_secs);
        match self.backoff {
            Backoff::Fixed => Some(base),
            Backoff::Exponential {
                factor,
                max_delay_secs,
            } => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = (self.delay_secs as f64) * factor.max(1.0).powi(exp);
                let capped = secs.min(max_delay_secs as f64).max(0.0);
                Some(Duration::from_secs_f64(capped))
            }
        }
    }
}

/// Delayed-work seam so reconnect scheduling can be observed without real sleeps.
#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real timer backed by `tokio::time`.
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Timer that returns immediately and remembers every requested delay.
#[derive(Default)]
pub struct RecordingTimer {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn record(&self, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(delay);
        }
    }
}

#[async_trait]
impl Timer for RecordingTimer {
    async fn sleep(&self, delay: Duration) {
        self.record(delay);
        tokio::task::yield_now().await;
    }
}
