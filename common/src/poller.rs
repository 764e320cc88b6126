//! Client-side status polling: bounded attempts with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::schema::PaymentStatus;

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2,
            max_delay: Duration::from_secs(15),
        }
    }
}

impl PollPolicy {
    /// Delay before attempt `attempt + 1`, counting attempts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Terminal {
        status: PaymentStatus,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
        last_status: Option<PaymentStatus>,
    },
}

/// Calls `fetch` until it reports a terminal status or the attempt budget runs out.
/// Fetch errors count as attempts and are logged.
pub async fn poll_until_terminal<F, Fut>(policy: &PollPolicy, mut fetch: F) -> PollOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<PaymentStatus>>,
{
    let mut last_status = None;
    for attempt in 1..=policy.max_attempts {
        match fetch(attempt).await {
            Ok(status) if status.is_terminal() => {
                return PollOutcome::Terminal { status, attempts: attempt };
            }
            Ok(status) => {
                log::debug!("Poll attempt {}/{}: {}", attempt, policy.max_attempts, status);
                last_status = Some(status);
            }
            Err(e) => {
                log::warn!(
                    "Poll attempt {}/{} failed: {:#}",
                    attempt,
                    policy.max_attempts,
                    e
                );
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }
    PollOutcome::TimedOut {
        attempts: policy.max_attempts,
        last_status,
    }
}
