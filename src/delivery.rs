/// Drains the outbox to the service, one request at a time.
///
/// The worker never blocks: each `poll` collects the outcome of the request
/// started on an earlier tick (if it has one) and starts the next. Until the
/// service handshake succeeds only the handshake is attempted; events keep
/// accumulating in the outbox meanwhile.
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::MonotonicTime;
use crate::event::EventId;
use crate::outbox::EventOutbox;
use crate::telemetry::StatusReport;
use crate::transport::{Ack, DeviceInfo, Request, SettingsUpdate, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Handshake,
    Event(EventId),
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Joining {
        attempts: u32,
        next_attempt_at: MonotonicTime,
    },
    Up,
}

pub struct DeliveryWorker<T> {
    transport: T,
    device: DeviceInfo,
    config: DeliveryConfig,
    rng: StdRng,
    link: Link,
    in_flight: Option<InFlight>,
    last_contact: Option<MonotonicTime>,
    last_heartbeat: Option<MonotonicTime>,
    delivered: u64,
    failed_attempts: u64,
}

impl<T: Transport> DeliveryWorker<T> {
    pub fn new(transport: T, device: DeviceInfo, config: DeliveryConfig) -> Self {
        Self::with_rng(transport, device, config, StdRng::from_entropy())
    }

    pub fn with_rng(transport: T, device: DeviceInfo, config: DeliveryConfig, rng: StdRng) -> Self {
        Self {
            transport,
            device,
            config,
            rng,
            link: Link::Joining {
                attempts: 0,
                next_attempt_at: MonotonicTime::ZERO,
            },
            in_flight: None,
            last_contact: None,
            last_heartbeat: None,
            delivered: 0,
            failed_attempts: 0,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.link == Link::Up
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One cooperative step. Returns calibration pushed by the service, if
    /// the request that just completed carried any.
    pub fn poll(
        &mut self,
        outbox: &mut EventOutbox,
        now: MonotonicTime,
        status: &StatusReport,
    ) -> Option<SettingsUpdate> {
        let mut settings = None;
        if let Some(kind) = self.in_flight {
            let outcome = self.transport.poll()?;
            self.in_flight = None;
            settings = self.complete(kind, outcome, outbox, now);
        }
        self.start_next(outbox, now, status);
        settings
    }

    fn complete(
        &mut self,
        kind: InFlight,
        outcome: Result<Ack, TransportError>,
        outbox: &mut EventOutbox,
        now: MonotonicTime,
    ) -> Option<SettingsUpdate> {
        match (kind, outcome) {
            (InFlight::Handshake, Ok(ack)) => {
                info!(device_id = %self.device.device_id, "linked to service");
                self.link = Link::Up;
                self.last_contact = Some(now);
                return ack.settings.filter(|s| !s.is_empty());
            }
            (InFlight::Handshake, Err(e)) => self.handshake_failed(&e, now),
            (InFlight::Event(id), Ok(ack)) => {
                if outbox.mark_delivered(id) {
                    self.delivered += 1;
                    info!(id = %id, delivered = self.delivered, "event delivered");
                } else {
                    debug!(id = %id, "acknowledged event no longer queued");
                }
                self.last_contact = Some(now);
                return ack.settings.filter(|s| !s.is_empty());
            }
            (InFlight::Event(id), Err(e)) => {
                self.failed_attempts += 1;
                let attempts = outbox.get(id).map(|entry| entry.attempts).unwrap_or(0);
                let backoff = self.config.backoff.delay(attempts, &mut self.rng);
                if outbox.mark_failed(id, now, backoff) {
                    warn!(
                        id = %id,
                        error = %e,
                        attempt = attempts + 1,
                        retry_in_secs = backoff.as_secs_f64(),
                        "event delivery failed"
                    );
                }
            }
            (InFlight::Heartbeat, Ok(ack)) => {
                debug!("heartbeat acknowledged");
                self.last_contact = Some(now);
                return ack.settings.filter(|s| !s.is_empty());
            }
            (InFlight::Heartbeat, Err(e)) => {
                warn!(error = %e, "heartbeat failed");
            }
        }
        None
    }

    fn start_next(&mut self, outbox: &mut EventOutbox, now: MonotonicTime, status: &StatusReport) {
        if self.in_flight.is_some() {
            return;
        }

        if let Link::Joining { next_attempt_at, .. } = self.link {
            if now >= next_attempt_at {
                match self.transport.submit(Request::Init(self.device.clone())) {
                    Ok(()) => self.in_flight = Some(InFlight::Handshake),
                    Err(e) => self.handshake_failed(&e, now),
                }
            }
            return;
        }

        if let Some(entry) = outbox.peek_ready(now) {
            let id = entry.event.id;
            let request = Request::Append(entry.event.clone());
            outbox.mark_in_flight(id);
            if let Err(e) = self.transport.submit(request) {
                self.failed_attempts += 1;
                let attempts = outbox.get(id).map(|entry| entry.attempts).unwrap_or(0);
                let backoff = self.config.backoff.delay(attempts, &mut self.rng);
                warn!(id = %id, error = %e, "could not start delivery");
                outbox.mark_failed(id, now, backoff);
            } else {
                self.in_flight = Some(InFlight::Event(id));
            }
            return;
        }

        if self.heartbeat_due(now) {
            self.last_heartbeat = Some(now);
            self.submit(InFlight::Heartbeat, Request::Ping(status.clone()));
        }
    }

    fn handshake_failed(&mut self, e: &TransportError, now: MonotonicTime) {
        let attempts = match self.link {
            Link::Joining { attempts, .. } => attempts,
            Link::Up => 0,
        };
        let backoff = self.config.backoff.delay(attempts, &mut self.rng);
        warn!(
            error = %e,
            attempt = attempts + 1,
            retry_in_secs = backoff.as_secs_f64(),
            "service handshake failed"
        );
        self.link = Link::Joining {
            attempts: attempts.saturating_add(1),
            next_attempt_at: now + backoff,
        };
    }

    fn heartbeat_due(&self, now: MonotonicTime) -> bool {
        let quiet_since = self.last_contact.max(self.last_heartbeat);
        match quiet_since {
            Some(t) => now.saturating_since(t) >= self.config.heartbeat_interval,
            None => true,
        }
    }

    fn submit(&mut self, kind: InFlight, request: Request) {
        match self.transport.submit(request) {
            Ok(()) => self.in_flight = Some(kind),
            Err(e) => warn!(error = %e, "could not start request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::event::ActivationEvent;
    use crate::outbox::{EntryState, MemoryStore};
    use crate::transport::{InlineTransport, Uplink};

    /// Fails the first `fail_appends` append requests, then accepts.
    #[derive(Default)]
    struct ScriptedUplink {
        fail_inits: u32,
        fail_appends: u32,
        inits: u32,
        appends: u32,
        pings: u32,
        accepted: Vec<EventId>,
        reply_settings: Option<SettingsUpdate>,
    }

    impl Uplink for ScriptedUplink {
        fn send(&mut self, request: &Request) -> Result<Ack, TransportError> {
            match request {
                Request::Init(_) => {
                    self.inits += 1;
                    if self.inits <= self.fail_inits {
                        return Err(TransportError::Connect("no route".into()));
                    }
                }
                Request::Append(event) => {
                    self.appends += 1;
                    if self.appends <= self.fail_appends {
                        return Err(TransportError::Status {
                            status: 503,
                            body: String::new(),
                        });
                    }
                    if !self.accepted.contains(&event.id) {
                        self.accepted.push(event.id);
                    }
                }
                Request::Ping(_) => self.pings += 1,
            }
            Ok(Ack {
                settings: self.reply_settings.clone(),
            })
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "pump-1".into(),
            version: "0.1.0".into(),
            timezone: "America/Los_Angeles".into(),
        }
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: 0.0,
            },
            heartbeat_interval: Duration::from_secs(3600),
        }
    }

    fn worker(uplink: ScriptedUplink) -> DeliveryWorker<InlineTransport<ScriptedUplink>> {
        DeliveryWorker::with_rng(
            InlineTransport::new(uplink),
            device(),
            config(),
            StdRng::seed_from_u64(3),
        )
    }

    fn event(clock: &ManualClock) -> ActivationEvent {
        let started_at = clock.wall_clock_now();
        ActivationEvent {
            id: EventId::new(),
            started_at,
            ended_at: started_at + chrono::Duration::seconds(12),
            duration: Duration::from_secs(12),
            peak_magnitude: 0.4,
            clock_synced: true,
        }
    }

    fn outbox() -> EventOutbox {
        EventOutbox::open(Box::new(MemoryStore::new()), 16, MonotonicTime::ZERO).unwrap()
    }

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn retries_until_delivered_exactly_once() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = worker(ScriptedUplink {
            fail_appends: 3,
            ..Default::default()
        });
        let e = event(&clock);
        outbox.enqueue(e.clone(), clock.monotonic_now());

        let mut attempts_seen = Vec::new();
        for _ in 0..300 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            if let Some(entry) = outbox.get(e.id) {
                if attempts_seen.last() != Some(&entry.attempts) {
                    attempts_seen.push(entry.attempts);
                }
            }
            clock.advance(TICK);
        }

        assert_eq!(attempts_seen, vec![0, 1, 2, 3]);
        assert!(outbox.is_empty());
        assert_eq!(w.transport().uplink().appends, 4);
        assert_eq!(w.transport().uplink().accepted, vec![e.id]);
        assert_eq!(w.delivered(), 1);
        assert_eq!(w.failed_attempts(), 3);
    }

    #[test]
    fn backoff_gaps_grow_between_attempts() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = worker(ScriptedUplink {
            fail_appends: u32::MAX,
            ..Default::default()
        });
        let e = event(&clock);
        outbox.enqueue(e.clone(), clock.monotonic_now());

        let mut gaps = Vec::new();
        let mut last_next = None;
        for _ in 0..3_000 {
            let now = clock.monotonic_now();
            w.poll(&mut outbox, now, &StatusReport::default());
            let entry = outbox.get(e.id).unwrap();
            if entry.state == EntryState::Pending && last_next != Some(entry.next_attempt_at) {
                if last_next.is_some() {
                    gaps.push(entry.next_attempt_at.saturating_since(now));
                }
                last_next = Some(entry.next_attempt_at);
            }
            clock.advance(TICK);
        }

        assert!(gaps.len() >= 5);
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "{gaps:?}");
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(60)));
    }

    #[test]
    fn handshake_retried_before_events_flow() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = worker(ScriptedUplink {
            fail_inits: 2,
            ..Default::default()
        });
        outbox.enqueue(event(&clock), clock.monotonic_now());

        for _ in 0..5 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        assert!(!w.is_linked());
        assert_eq!(w.transport().uplink().appends, 0);
        assert_eq!(outbox.len(), 1);

        for _ in 0..100 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        assert!(w.is_linked());
        assert_eq!(w.transport().uplink().inits, 3);
        assert!(outbox.is_empty());
    }

    /// Refuses every submit, like a transport whose uplink thread has died.
    #[derive(Default)]
    struct DeadTransport {
        submits: u32,
    }

    impl Transport for DeadTransport {
        fn submit(&mut self, _request: Request) -> Result<(), TransportError> {
            self.submits += 1;
            Err(TransportError::Disconnected)
        }

        fn poll(&mut self) -> Option<Result<Ack, TransportError>> {
            None
        }
    }

    #[test]
    fn refused_handshake_submit_backs_off() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = DeliveryWorker::with_rng(
            DeadTransport::default(),
            device(),
            config(),
            StdRng::seed_from_u64(3),
        );

        // 10s of ticks: attempts at 0s, 1s, 3s and 7s with 1s base backoff.
        for _ in 0..100 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        assert!(!w.is_linked());
        assert_eq!(w.transport().submits, 4);
    }

    #[test]
    fn preserves_fifo_order() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = worker(ScriptedUplink::default());
        let events: Vec<_> = (0..4).map(|_| event(&clock)).collect();
        for e in &events {
            outbox.enqueue(e.clone(), clock.monotonic_now());
        }

        for _ in 0..20 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(w.transport().uplink().accepted, ids);
    }

    #[test]
    fn heartbeat_sent_after_quiet_interval() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let mut w = worker(ScriptedUplink::default());

        for _ in 0..10 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        assert!(w.is_linked());
        assert_eq!(w.transport().uplink().pings, 0);

        clock.advance(Duration::from_secs(3600));
        for _ in 0..3 {
            w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default());
            clock.advance(TICK);
        }
        assert_eq!(w.transport().uplink().pings, 1);
    }

    #[test]
    fn reply_settings_are_returned() {
        let clock = ManualClock::starting_at_default();
        let mut outbox = outbox();
        let update = SettingsUpdate {
            high_threshold: Some(0.12),
            low_threshold: None,
            min_valid_duration_secs: None,
        };
        let mut w = worker(ScriptedUplink {
            reply_settings: Some(update.clone()),
            ..Default::default()
        });

        let mut received = None;
        for _ in 0..3 {
            if let Some(s) = w.poll(&mut outbox, clock.monotonic_now(), &StatusReport::default()) {
                received = Some(s);
            }
            clock.advance(TICK);
        }
        assert_eq!(received, Some(update));
    }
}
