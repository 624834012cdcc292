/// Hysteresis + debounce detector for pump activations.
/// Turns a stream of vibration magnitudes into completed ON->OFF events.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{MonotonicTime, Now};
use crate::event::{ActivationEvent, EventId};
use crate::transport::SettingsUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Active => "active",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Magnitude at or above which the pump is considered running.
    pub high_threshold: f64,
    /// Magnitude at or below which the pump is considered stopped.
    pub low_threshold: f64,
    pub debounce_on: Duration,
    pub debounce_off: Duration,
    /// Shorter runs are treated as noise.
    pub min_valid_duration: Duration,
    /// Samples above this are sensor glitches.
    pub max_magnitude: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.08,
            low_threshold: 0.05,
            debounce_on: Duration::from_secs(1),
            debounce_off: Duration::from_secs(1),
            min_valid_duration: Duration::from_secs(9),
            max_magnitude: 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorState {
    pub phase: Phase,
    pub phase_entered_at: MonotonicTime,
    pub peak_magnitude: f64,
}

pub struct ActivationDetector {
    config: DetectorConfig,
    state: DetectorState,
    /// Start of the current run of samples past the threshold that would
    /// leave the current phase.
    crossing_since: Option<MonotonicTime>,
    last_sample_at: Option<MonotonicTime>,
    last_magnitude: f64,
    rejected_samples: u64,
    discarded_activations: u64,
}

impl ActivationDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: DetectorState {
                phase: Phase::Idle,
                phase_entered_at: MonotonicTime::ZERO,
                peak_magnitude: 0.0,
            },
            crossing_since: None,
            last_sample_at: None,
            last_magnitude: 0.0,
            rejected_samples: 0,
            discarded_activations: 0,
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn last_magnitude(&self) -> f64 {
        self.last_magnitude
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples
    }

    pub fn discarded_activations(&self) -> u64 {
        self.discarded_activations
    }

    /// Feed one sample. Returns an event only when a run is confirmed over.
    pub fn on_sample(&mut self, magnitude: f64, now: &Now) -> Option<ActivationEvent> {
        let at = now.monotonic;

        if !magnitude.is_finite() || magnitude < 0.0 || magnitude > self.config.max_magnitude {
            self.reject(magnitude, "out of range");
            return None;
        }
        if self.last_sample_at.is_some_and(|last| at < last) {
            self.reject(magnitude, "timestamp went backwards");
            return None;
        }
        // A crossing only counts while it is observed. After a gap longer
        // than the debounce window it starts over at this sample.
        let window = match self.state.phase {
            Phase::Idle => self.config.debounce_on,
            Phase::Active => self.config.debounce_off,
        };
        if let Some(last) = self.last_sample_at {
            let gap = at.saturating_since(last);
            if gap > window && self.crossing_since.take().is_some() {
                debug!(gap_ms = gap.as_millis() as u64, "sample gap, crossing restarted");
            }
        }
        self.last_sample_at = Some(at);
        self.last_magnitude = magnitude;

        match self.state.phase {
            Phase::Idle => {
                if magnitude < self.config.high_threshold {
                    self.crossing_since = None;
                    return None;
                }
                let since = *self.crossing_since.get_or_insert(at);
                if at.saturating_since(since) >= self.config.debounce_on {
                    self.state = DetectorState {
                        phase: Phase::Active,
                        phase_entered_at: at - self.config.debounce_on,
                        peak_magnitude: magnitude,
                    };
                    self.crossing_since = None;
                    debug!(magnitude, "pump activation confirmed");
                }
                None
            }
            Phase::Active => {
                self.state.peak_magnitude = self.state.peak_magnitude.max(magnitude);
                if magnitude > self.config.low_threshold {
                    self.crossing_since = None;
                    return None;
                }
                let since = *self.crossing_since.get_or_insert(at);
                if at.saturating_since(since) < self.config.debounce_off {
                    return None;
                }
                self.finish(now)
            }
        }
    }

    fn finish(&mut self, now: &Now) -> Option<ActivationEvent> {
        let started = self.state.phase_entered_at;
        let ended = now.monotonic - self.config.debounce_off;
        let duration = ended.saturating_since(started);
        let peak = self.state.peak_magnitude;

        self.state = DetectorState {
            phase: Phase::Idle,
            phase_entered_at: now.monotonic,
            peak_magnitude: 0.0,
        };
        self.crossing_since = None;

        if duration.is_zero() || duration < self.config.min_valid_duration {
            self.discarded_activations += 1;
            debug!(
                duration_ms = duration.as_millis() as u64,
                min_ms = self.config.min_valid_duration.as_millis() as u64,
                "activation too short, discarded"
            );
            return None;
        }

        let event = ActivationEvent {
            id: EventId::new(),
            started_at: now.wall_at(started),
            ended_at: now.wall_at(ended),
            duration,
            peak_magnitude: peak,
            clock_synced: now.wall_synced,
        };
        info!(
            id = %event.id,
            started_at = %event.started_at,
            duration_secs = duration.as_secs_f64(),
            peak = peak,
            "pump activation recorded"
        );
        Some(event)
    }

    fn reject(&mut self, magnitude: f64, reason: &'static str) {
        self.rejected_samples += 1;
        debug!(magnitude, reason, rejected = self.rejected_samples, "sample dropped");
    }

    /// Apply calibration pushed by the remote service. Out-of-range values
    /// and updates that would break `high > low` are ignored.
    pub fn apply_settings(&mut self, update: &SettingsUpdate) {
        let valid_threshold = |v: f64| v > 0.0 && v < 10.0;

        let mut high = self.config.high_threshold;
        let mut low = self.config.low_threshold;
        if let Some(v) = update.high_threshold {
            if valid_threshold(v) {
                high = v;
            } else {
                warn!(value = v, "ignoring out-of-range high_threshold");
            }
        }
        if let Some(v) = update.low_threshold {
            if valid_threshold(v) {
                low = v;
            } else {
                warn!(value = v, "ignoring out-of-range low_threshold");
            }
        }
        if high > low {
            if high != self.config.high_threshold || low != self.config.low_threshold {
                info!(high, low, "detector thresholds updated");
            }
            self.config.high_threshold = high;
            self.config.low_threshold = low;
        } else {
            warn!(high, low, "ignoring threshold update without hysteresis");
        }

        if let Some(secs) = update.min_valid_duration_secs {
            if secs > 0.0 && secs < 24.0 * 60.0 * 60.0 {
                self.config.min_valid_duration = Duration::from_secs_f64(secs);
            } else {
                warn!(value = secs, "ignoring out-of-range min_valid_duration_secs");
            }
        }
    }
}
