use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pumpwatch::config::{Config, SensorKind};
use pumpwatch::http::HttpUplink;
use pumpwatch::outbox::JsonFileStore;
use pumpwatch::sensor::{Mpu6050, ReplaySensor, Sensor};
use pumpwatch::telemetry::LogTelemetry;
use pumpwatch::transport::{DeviceInfo, ThreadedTransport};
use pumpwatch::{ActivationDetector, Clock, DeliveryWorker, EventOutbox, Runtime, SystemClock};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("usage: pumpwatch [CONFIG]   (default: config.toml)");
        return Ok(());
    }
    let config_path = args.get(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)?;
    let tz = config.tz()?;
    let device_id = config.resolve_device_id();
    info!(
        config = %config_path.display(),
        device_id = %device_id,
        service_url = %config.service_url,
        timezone = %tz,
        outbox = %config.outbox_path.display(),
        "starting pumpwatch {}",
        env!("CARGO_PKG_VERSION")
    );

    let sensor: Box<dyn Sensor> = match config.sensor.kind {
        SensorKind::Mpu6050 => Box::new(
            Mpu6050::open(
                &config.sensor.i2c_bus,
                config.sensor.address,
                config.sensor.burst_reads,
                std::time::Duration::from_millis(config.sensor.burst_interval_ms),
            )
            .context("failed to start accelerometer")?,
        ),
        SensorKind::Replay => {
            let path = config
                .sensor
                .replay_path
                .as_deref()
                .context("sensor.replay_path not set")?;
            Box::new(ReplaySensor::open(path).context("failed to open replay file")?)
        }
    };

    let clock = SystemClock::new(tz);
    if !clock.is_synchronized() {
        info!("wall clock not synchronized yet; events will be flagged");
    }

    let outbox = EventOutbox::open(
        Box::new(JsonFileStore::new(&config.outbox_path)),
        config.outbox.capacity,
        clock.monotonic_now(),
    )
    .context("failed to open outbox")?;

    let uplink = HttpUplink::new(&config.service_url, &device_id, config.request_timeout())
        .context("failed to build HTTP client")?;
    let worker = DeliveryWorker::new(
        ThreadedTransport::spawn(uplink),
        DeviceInfo {
            device_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timezone: config.timezone.clone(),
        },
        config.delivery_config(),
    );

    let mut runtime = Runtime::new(
        sensor,
        clock,
        ActivationDetector::new(config.detector_config()),
        outbox,
        worker,
        Box::new(LogTelemetry::new(config.status_interval())),
        config.sampling_interval(),
    );
    runtime.run();
    Ok(())
}
