//! Transport settings shared by every bus implementation.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Connection settings for a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Transport URL: `memory://<name>` for the in-process bus,
    /// `nats://host:port` for NATS JetStream.
    pub url: String,
    /// Deliveries per message before it is dead-lettered.
    pub max_deliveries: u32,
    /// Backoff before the first redelivery; doubles each time.
    pub redelivery_base: Duration,
    /// Keep a copy of every published envelope. Meant for tests; the log
    /// grows without bound.
    pub record_published: bool,
    /// Dead letters kept for inspection; older ones are dropped.
    pub max_dead_letters: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "memory://local".to_string(),
            max_deliveries: 5,
            redelivery_base: Duration::from_millis(100),
            record_published: false,
            max_dead_letters: 1_000,
        }
    }
}

impl BusConfig {
    /// Defaults with the in-process transport.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Replaces the transport URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the delivery budget; zero is raised to one.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_redelivery_base(mut self, base: Duration) -> Self {
        self.redelivery_base = base;
        self
    }

    /// Turns the published-envelope log on or off.
    pub fn with_recording(mut self, record: bool) -> Self {
        self.record_published = record;
        self
    }

    pub fn with_max_dead_letters(mut self, max: usize) -> Self {
        self.max_dead_letters = max;
        self
    }

    /// True when `url` names the NATS transport.
    pub fn is_nats(&self) -> bool {
        self.url.starts_with("nats://")
    }

    pub(crate) fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_deliveries, self.redelivery_base)
    }
}
