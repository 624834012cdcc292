//! Pump activation logger.
//!
//! Infers water-pump runs from accelerometer vibration, measures each run,
//! and delivers every completed run to a remote log through a durable
//! outbox that survives network outages and power loss.
//!
//! Data flows `sensor -> detector -> outbox -> delivery -> service`, driven
//! by the cooperative loop in [`runtime`].

pub mod backoff;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod detector;
pub mod event;
pub mod http;
pub mod outbox;
pub mod runtime;
pub mod sensor;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, MonotonicTime, Now, SystemClock, WallClockTime};
pub use config::Config;
pub use delivery::{DeliveryConfig, DeliveryWorker};
pub use detector::{ActivationDetector, DetectorConfig, DetectorState, Phase};
pub use event::{ActivationEvent, EventId};
pub use outbox::{EntryState, EventOutbox, OutboxEntry};
pub use runtime::Runtime;
