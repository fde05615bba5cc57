//! Exponential backoff for publishing and redelivery.

use std::time::Duration;

use crate::bus::MessageBus;
use crate::envelope::Envelope;
use crate::error::Result;

/// Exponential backoff for publishes and redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` tries (at least one) starting at
    /// `base_delay`, capped at the default maximum delay.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before try `attempt + 1`, doubling from `base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Publishes `envelope`, retrying transient failures with backoff.
///
/// Permanent failures and the last transient failure are returned.
pub async fn publish_with_retry<B>(
    bus: &B,
    topic: &str,
    envelope: Envelope,
    policy: &RetryPolicy,
) -> Result<()>
where
    B: MessageBus + ?Sized,
{
    let mut attempt = 1;
    loop {
        match bus.publish(topic, envelope.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(topic, attempt, ?delay, error = %e, "publish failed, retrying");
                metrics::counter!("bus_publish_retries_total", "topic" => topic.to_string())
                    .increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(topic, attempt, error = %e, "publish failed");
                return Err(e);
            }
        }
    }
}
