//! Operational alerts for sagas that cannot finish on their own.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// The compensating command that failed or never got a reply.
    pub step: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// Where escalations go.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Logs alerts at error level and counts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        tracing::error!(
            saga_id = %alert.saga_id,
            saga_type = %alert.saga_type,
            step = %alert.step,
            reason = %alert.reason,
            "saga needs manual intervention"
        );
        metrics::counter!("saga_alerts_total", "saga_type" => alert.saga_type).increment(1);
    }
}

/// Keeps alerts in memory; for tests.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: Alert) {
        LogAlertSink.raise(alert.clone());
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
