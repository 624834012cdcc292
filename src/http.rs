/// JSON-over-HTTP uplink to the logging service.
///
/// The field names in the envelopes below are what the service's log is keyed
/// on; renaming any of them breaks existing deployments.
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{ActivationEvent, EventId};
use crate::telemetry::StatusReport;
use crate::transport::{Ack, Request, SettingsUpdate, TransportError, Uplink};

const USER_AGENT: &str = concat!("pumpwatch/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Envelope<'a> {
    Init {
        device_id: &'a str,
        version: &'a str,
        timezone: &'a str,
    },
    Append {
        device_id: &'a str,
        version: &'a str,
        values: Vec<EventRecord>,
    },
    Ping {
        device_id: &'a str,
        data: &'a StatusReport,
    },
}

#[derive(Debug, Serialize)]
struct EventRecord {
    id: EventId,
    started_at: String,
    ended_at: String,
    /// Seconds, one decimal.
    duration: f64,
    peak_magnitude: f64,
    clock_synced: bool,
}

impl From<&ActivationEvent> for EventRecord {
    fn from(e: &ActivationEvent) -> Self {
        Self {
            id: e.id,
            started_at: e.started_at.to_rfc3339(),
            ended_at: e.ended_at.to_rfc3339(),
            duration: (e.duration.as_secs_f64() * 10.0).round() / 10.0,
            peak_magnitude: e.peak_magnitude,
            clock_synced: e.clock_synced,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    settings: SettingsUpdate,
}

pub struct HttpUplink {
    client: Client,
    url: String,
    device_id: String,
    version: String,
}

impl HttpUplink {
    pub fn new(
        url: impl Into<String>,
        device_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            device_id: device_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn envelope<'a>(&'a self, request: &'a Request) -> Envelope<'a> {
        match request {
            Request::Init(info) => Envelope::Init {
                device_id: &info.device_id,
                version: &info.version,
                timezone: &info.timezone,
            },
            Request::Append(event) => Envelope::Append {
                device_id: &self.device_id,
                version: &self.version,
                values: vec![EventRecord::from(event)],
            },
            Request::Ping(status) => Envelope::Ping {
                device_id: &self.device_id,
                data: status,
            },
        }
    }
}

impl Uplink for HttpUplink {
    fn send(&mut self, request: &Request) -> Result<Ack, TransportError> {
        let envelope = self.envelope(request);
        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify)?;
        debug!(op = request.op(), status, "service replied");
        interpret_reply(status, &body)
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// A success status is the acknowledgment. The body is optional, but when
/// it is JSON with `"status": "error"` the service refused the request.
fn interpret_reply(status: u16, body: &str) -> Result<Ack, TransportError> {
    if !(200..300).contains(&status) {
        return Err(TransportError::Status {
            status,
            body: truncate(body),
        });
    }
    if body.trim().is_empty() {
        return Ok(Ack::default());
    }
    let reply: ServiceReply = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "reply body is not JSON, treating as plain ack");
            return Ok(Ack::default());
        }
    };
    if reply.status.as_deref() == Some("error") {
        return Err(TransportError::Rejected(
            reply.message.unwrap_or_else(|| "unspecified error".to_string()),
        ));
    }
    Ok(Ack {
        settings: Some(reply.settings).filter(|s| !s.is_empty()),
    })
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
