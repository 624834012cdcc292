/// MPU-6050 accelerometer reader via Linux i2c-dev.
///
/// The vibration feature is the norm of the per-axis standard deviations over
/// a short burst of raw reads: gravity and mounting tilt cancel out, motor
/// vibration does not.
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::raw::{c_int, c_ulong};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

// ── Constants ───────────────────────────────────────────────────────────────

// <linux/i2c-dev.h>
const I2C_SLAVE: c_ulong = 0x0703;

// MPU-6050 registers
const REG_PWR_MGMT_1: u8 = 0x6B;
const REG_ACCEL_XOUT_H: u8 = 0x3B;
const REG_WHO_AM_I: u8 = 0x75;

const ACCEL_REPORT_LEN: usize = 6;
const ACCEL_SCALE: f64 = 16384.0; // ±2g full scale -> g
const WAKE_SETTLE: Duration = Duration::from_millis(50);

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("i2c {op} failed (errno {errno})")]
    Bus { op: &'static str, errno: i32 },
    #[error("unexpected device id 0x{0:02x}")]
    WrongDevice(u8),
    #[error("replay line {line}: cannot parse {value:?}")]
    Parse { line: usize, value: String },
    #[error("replay exhausted")]
    Exhausted,
}

/// One vibration magnitude per call. Failures are transient from the
/// caller's point of view; the tick just has no sample.
pub trait Sensor {
    fn read_magnitude(&mut self) -> Result<f64, SensorError>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn read_magnitude(&mut self) -> Result<f64, SensorError> {
        (**self).read_magnitude()
    }
}

// ── FFI bindings ────────────────────────────────────────────────────────────

extern "C" {
    fn ioctl(fd: c_int, request: c_ulong, ...) -> c_int;
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Big-endian signed 16-bit X/Y/Z to g.
pub fn decode_accel(raw: [u8; ACCEL_REPORT_LEN]) -> [f64; 3] {
    let axis = |hi: u8, lo: u8| i16::from_be_bytes([hi, lo]) as f64 / ACCEL_SCALE;
    [axis(raw[0], raw[1]), axis(raw[2], raw[3]), axis(raw[4], raw[5])]
}

fn stdev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n <= 1 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let ss: f64 = values.map(|v| (v - mean) * (v - mean)).sum();
    (ss / (n - 1) as f64).sqrt()
}

/// Norm of the per-axis sample standard deviations.
pub fn vibration_magnitude(readings: &[[f64; 3]]) -> f64 {
    let sx = stdev(readings.iter().map(|r| r[0]));
    let sy = stdev(readings.iter().map(|r| r[1]));
    let sz = stdev(readings.iter().map(|r| r[2]));
    (sx * sx + sy * sy + sz * sz).sqrt()
}

// ── MPU-6050 ────────────────────────────────────────────────────────────────

pub struct Mpu6050 {
    bus: File,
    burst_reads: usize,
    burst_interval: Duration,
}

impl Mpu6050 {
    /// Open the bus, select the device and take it out of sleep.
    pub fn open(
        bus_path: &Path,
        address: u16,
        burst_reads: usize,
        burst_interval: Duration,
    ) -> Result<Self, SensorError> {
        let bus = OpenOptions::new().read(true).write(true).open(bus_path)?;

        let rc = unsafe { ioctl(bus.as_raw_fd(), I2C_SLAVE, c_ulong::from(address)) };
        if rc < 0 {
            return Err(SensorError::Bus {
                op: "select device",
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            });
        }

        let mut sensor = Self {
            bus,
            burst_reads: burst_reads.max(2),
            burst_interval,
        };

        let mut who = [0u8; 1];
        sensor.read_registers(REG_WHO_AM_I, &mut who)?;
        // 0x68 regardless of the AD0 strap; clones report 0x70/0x72.
        if !matches!(who[0], 0x68 | 0x70 | 0x72) {
            return Err(SensorError::WrongDevice(who[0]));
        }

        sensor.bus.write_all(&[REG_PWR_MGMT_1, 0])?;
        thread::sleep(WAKE_SETTLE);

        info!(bus = %bus_path.display(), address = %format!("0x{address:02x}"), "accelerometer active");
        Ok(sensor)
    }

    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.bus.write_all(&[start])?;
        self.bus.read_exact(buf)?;
        Ok(())
    }

    fn read_accel(&mut self) -> Result<[f64; 3], SensorError> {
        let mut raw = [0u8; ACCEL_REPORT_LEN];
        self.read_registers(REG_ACCEL_XOUT_H, &mut raw)?;
        Ok(decode_accel(raw))
    }
}

impl Sensor for Mpu6050 {
    fn read_magnitude(&mut self) -> Result<f64, SensorError> {
        let mut readings = Vec::with_capacity(self.burst_reads);
        for i in 0..self.burst_reads {
            readings.push(self.read_accel()?);
            if i + 1 < self.burst_reads {
                thread::sleep(self.burst_interval);
            }
        }
        Ok(vibration_magnitude(&readings))
    }
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Feeds recorded magnitudes, one line per read. Blank lines and `#`
/// comments are skipped.
pub struct ReplaySensor<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl ReplaySensor<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, SensorError> {
        let file = File::open(path)?;
        info!(path = %path.display(), "replaying recorded magnitudes");
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ReplaySensor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Sensor for ReplaySensor<R> {
    fn read_magnitude(&mut self) -> Result<f64, SensorError> {
        loop {
            let line = self.lines.next().ok_or(SensorError::Exhausted)??;
            self.line_no += 1;
            let value = line.trim();
            if value.is_empty() || value.starts_with('#') {
                continue;
            }
            return value.parse::<f64>().map_err(|_| SensorError::Parse {
                line: self.line_no,
                value: value.to_string(),
            });
        }
    }
}
