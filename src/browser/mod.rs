//! Headless browser lifecycle.
//!
//! Each scheduler group owns exactly one [`BrowserSession`] at a time.
//! Session start goes through [`RetryPolicy`]: jittered exponential backoff,
//! retrying until the group is cancelled or the optional attempt cap runs out.

mod session;

pub use session::{BrowserSession, ChromiumSessions};

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("browser operation failed: {0}")]
    OperationFailed(String),

    #[error("gave up launching browser after {0} attempts")]
    RetriesExhausted(u32),

    #[error("session start cancelled")]
    Cancelled,
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::OperationFailed(e.to_string())
    }
}

/// Backoff schedule for browser launch attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    pub multiplier: f64,
    /// Total attempt cap. `None` retries until cancelled.
    pub give_up_after: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            give_up_after: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Exponential in the attempt number, capped at `max_delay`, with a
    /// ±20% jitter so restarting groups don't hammer the host in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(24);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }

    /// True once `attempt` failures mean no further tries are allowed.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.give_up_after.is_some_and(|cap| attempt >= cap)
    }
}

// ============================================================================
// Tests
// ============================================================================
