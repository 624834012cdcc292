/// Fixed-period cooperative loop: sample, detect, enqueue, then give the
/// delivery worker one non-blocking step.
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::delivery::DeliveryWorker;
use crate::detector::ActivationDetector;
use crate::outbox::EventOutbox;
use crate::sensor::{Sensor, SensorError};
use crate::telemetry::{StatusReport, Telemetry};
use crate::transport::Transport;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub sensor_failures: u64,
    pub activations: u64,
    pub deadline_misses: u64,
    pub worst_tick: Duration,
}

pub struct Runtime<S, C, T> {
    sensor: S,
    clock: C,
    detector: ActivationDetector,
    outbox: EventOutbox,
    worker: DeliveryWorker<T>,
    telemetry: Box<dyn Telemetry>,
    period: Duration,
    stats: LoopStats,
    sensor_exhausted: bool,
}

impl<S: Sensor, C: Clock, T: Transport> Runtime<S, C, T> {
    pub fn new(
        sensor: S,
        clock: C,
        detector: ActivationDetector,
        outbox: EventOutbox,
        worker: DeliveryWorker<T>,
        telemetry: Box<dyn Telemetry>,
        period: Duration,
    ) -> Self {
        Self {
            sensor,
            clock,
            detector,
            outbox,
            worker,
            telemetry,
            period,
            stats: LoopStats::default(),
            sensor_exhausted: false,
        }
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn detector(&self) -> &ActivationDetector {
        &self.detector
    }

    pub fn outbox(&self) -> &EventOutbox {
        &self.outbox
    }

    pub fn worker(&self) -> &DeliveryWorker<T> {
        &self.worker
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            phase: self.detector.state().phase.as_str().to_string(),
            magnitude: self.detector.last_magnitude(),
            activations: self.stats.activations,
            pending_events: self.outbox.len(),
            delivered_events: self.worker.delivered(),
            dropped_events: self.outbox.dropped_count(),
            sensor_failures: self.stats.sensor_failures,
            rejected_samples: self.detector.rejected_samples(),
            deadline_misses: self.stats.deadline_misses,
            linked: self.worker.is_linked(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// One loop iteration. Never fails: a bad read is a missing sample and
    /// delivery problems stay inside the worker.
    pub fn tick(&mut self) {
        let started = Instant::now();
        let now = self.clock.now();

        match self.sensor.read_magnitude() {
            Ok(magnitude) => {
                if let Some(event) = self.detector.on_sample(magnitude, &now) {
                    self.stats.activations += 1;
                    self.telemetry.on_activation(&event);
                    self.outbox.enqueue(event, now.monotonic);
                }
            }
            Err(SensorError::Exhausted) => {
                if !self.sensor_exhausted {
                    info!("sensor has no more samples");
                }
                self.sensor_exhausted = true;
            }
            Err(e) => {
                self.stats.sensor_failures += 1;
                debug!(error = %e, failures = self.stats.sensor_failures, "sensor read failed");
            }
        }

        let status = self.status();
        if let Some(update) = self.worker.poll(&mut self.outbox, now.monotonic, &status) {
            self.detector.apply_settings(&update);
        }
        self.telemetry.on_status(now.monotonic, &status);

        let elapsed = started.elapsed();
        if elapsed > self.period {
            self.stats.deadline_misses += 1;
        }
        if elapsed > self.stats.worst_tick {
            self.stats.worst_tick = elapsed;
        }
        self.stats.ticks += 1;
    }

    /// Tick every `period` until the sensor runs dry (replays) or forever.
    pub fn run(&mut self) {
        info!(period_ms = self.period.as_millis() as u64, "sampling loop started");
        loop {
            let cycle_start = Instant::now();
            self.tick();
            if self.sensor_exhausted && !self.worker.is_busy() {
                break;
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < self.period {
                std::thread::sleep(self.period - elapsed);
            } else {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tick overran sampling period"
                );
            }
        }
        info!(
            ticks = self.stats.ticks,
            activations = self.stats.activations,
            pending = self.outbox.len(),
            "sampling loop stopped"
        );
    }
}
