/// Seam between the delivery worker and the network.
///
/// `Uplink` is the blocking collaborator that actually talks to the service.
/// `Transport` is what the worker drives: submit one request, then poll for
/// its outcome on later ticks so sampling is never blocked behind I/O.
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::ActivationEvent;
use crate::telemetry::StatusReport;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("service rejected request: {0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("a request is already in flight")]
    Busy,
    #[error("transport worker stopped")]
    Disconnected,
}

/// Identity sent with the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub version: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub enum Request {
    Init(DeviceInfo),
    Append(ActivationEvent),
    Ping(StatusReport),
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Init(_) => "init",
            Request::Append(_) => "append",
            Request::Ping(_) => "ping",
        }
    }
}

/// Calibration values the service may push back in any reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_valid_duration_secs: Option<f64>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.high_threshold.is_none()
            && self.low_threshold.is_none()
            && self.min_valid_duration_secs.is_none()
    }
}

/// Positive acknowledgment from the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ack {
    pub settings: Option<SettingsUpdate>,
}

pub trait Uplink {
    fn send(&mut self, request: &Request) -> Result<Ack, TransportError>;

    fn send_event(&mut self, event: &ActivationEvent) -> Result<Ack, TransportError> {
        self.send(&Request::Append(event.clone()))
    }
}

/// Polled, one-at-a-time request channel.
pub trait Transport {
    /// Start a request. Fails with `Busy` while another is outstanding.
    fn submit(&mut self, request: Request) -> Result<(), TransportError>;

    /// Outcome of the outstanding request, once it has one.
    fn poll(&mut self) -> Option<Result<Ack, TransportError>>;
}

/// Runs the uplink synchronously inside `submit`. For uplinks that never
/// block (fakes, replays) and for tests.
pub struct InlineTransport<U> {
    uplink: U,
    outcome: Option<Result<Ack, TransportError>>,
}

impl<U: Uplink> InlineTransport<U> {
    pub fn new(uplink: U) -> Self {
        Self {
            uplink,
            outcome: None,
        }
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }
}

impl<U: Uplink> Transport for InlineTransport<U> {
    fn submit(&mut self, request: Request) -> Result<(), TransportError> {
        if self.outcome.is_some() {
            return Err(TransportError::Busy);
        }
        self.outcome = Some(self.uplink.send(&request));
        Ok(())
    }

    fn poll(&mut self) -> Option<Result<Ack, TransportError>> {
        self.outcome.take()
    }
}

/// Runs the uplink on a dedicated thread; the caller's thread only ever
/// does channel operations.
pub struct ThreadedTransport {
    requests: mpsc::Sender<Request>,
    outcomes: mpsc::Receiver<Result<Ack, TransportError>>,
    outstanding: bool,
}

impl ThreadedTransport {
    pub fn spawn<U>(mut uplink: U) -> Self
    where
        U: Uplink + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (out_tx, out_rx) = mpsc::channel();

        thread::spawn(move || {
            while let Ok(request) = req_rx.recv() {
                debug!(op = request.op(), "uplink request started");
                let outcome = uplink.send(&request);
                if out_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("uplink thread exiting");
        });

        Self {
            requests: req_tx,
            outcomes: out_rx,
            outstanding: false,
        }
    }
}

impl Transport for ThreadedTransport {
    fn submit(&mut self, request: Request) -> Result<(), TransportError> {
        if self.outstanding {
            return Err(TransportError::Busy);
        }
        self.requests
            .send(request)
            .map_err(|_| TransportError::Disconnected)?;
        self.outstanding = true;
        Ok(())
    }

    fn poll(&mut self) -> Option<Result<Ack, TransportError>> {
        if !self.outstanding {
            return None;
        }
        match self.outcomes.try_recv() {
            Ok(outcome) => {
                self.outstanding = false;
                Some(outcome)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                warn!("uplink thread is gone");
                self.outstanding = false;
                Some(Err(TransportError::Disconnected))
            }
        }
    }
}
