/// Read-only status reporting.
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::clock::MonotonicTime;
use crate::event::ActivationEvent;

/// Point-in-time view of the device, also sent as the heartbeat payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub phase: String,
    pub magnitude: f64,
    pub activations: u64,
    pub pending_events: usize,
    pub delivered_events: u64,
    pub dropped_events: u64,
    pub sensor_failures: u64,
    pub rejected_samples: u64,
    pub deadline_misses: u64,
    pub linked: bool,
    pub version: String,
}

pub trait Telemetry {
    fn on_activation(&mut self, event: &ActivationEvent);
    fn on_status(&mut self, now: MonotonicTime, status: &StatusReport);
}

/// Writes the status line to the log every `interval`.
pub struct LogTelemetry {
    interval: Duration,
    last_emit: Option<MonotonicTime>,
}

impl LogTelemetry {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    fn due(&mut self, now: MonotonicTime) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

impl Telemetry for LogTelemetry {
    fn on_activation(&mut self, event: &ActivationEvent) {
        info!(
            started_at = %event.started_at,
            duration = %format!("{:.1}s", event.duration.as_secs_f64()),
            "last activation"
        );
    }

    fn on_status(&mut self, now: MonotonicTime, status: &StatusReport) {
        if !self.due(now) {
            return;
        }
        info!(
            phase = %status.phase,
            vib = %format!("{:.3}", status.magnitude),
            count = status.activations,
            pending = status.pending_events,
            delivered = status.delivered_events,
            dropped = status.dropped_events,
            sensor_failures = status.sensor_failures,
            rejected = status.rejected_samples,
            deadline_misses = status.deadline_misses,
            linked = status.linked,
            "status"
        );
    }
}

/// Discards everything.
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn on_activation(&mut self, _event: &ActivationEvent) {}
    fn on_status(&mut self, _now: MonotonicTime, _status: &StatusReport) {}
}
