//! Temperature/humidity sampling
//!
//! A [`SensorReader`] wraps one [`Measurement`] device. Each sample triggers a fresh
//! measurement cycle; nothing is retained between samples.

pub mod dht22;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SensorFault {
    #[error("Line timing fault while waiting for {phase}")]
    Timeout { phase: &'static str },

    #[error("Checksum mismatch: frame says {expected:#04x}, computed {computed:#04x}")]
    Checksum { expected: u8, computed: u8 },

    #[error("Sensor not ready after a failed cycle")]
    NotReady,

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

/// One sample attempt. Absent fields mean the value could not be obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Reading {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
}

impl Reading {
    pub fn new(temperature: f32, humidity: f32) -> Self {
        Self {
            temperature: Some(temperature),
            humidity: Some(humidity),
        }
    }

    /// The reading a failed measurement cycle degrades to
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some()
    }

    /// Telemetry payload `"<temperature>,<humidity>"`, only for complete readings.
    pub fn payload(&self) -> Option<String> {
        match (self.temperature, self.humidity) {
            (Some(temperature), Some(humidity)) => Some(format!(
                "{},{}",
                format_decimal(temperature),
                format_decimal(humidity)
            )),
            _ => None,
        }
    }
}

/// Shortest round-trip decimal form that always keeps a fractional digit (`24.0`, `-3.5`).
pub fn format_decimal(value: f32) -> String {
    format!("{value:?}")
}

/// A sensor peripheral that measures on demand.
///
/// `measure` runs one measurement cycle; the accessors return what that cycle produced.
pub trait Measurement {
    fn measure(&mut self) -> Result<(), SensorFault>;
    fn temperature(&self) -> Option<f32>;
    fn humidity(&self) -> Option<f32>;
}

pub struct SensorReader {
    device: Box<dyn Measurement>,
}

impl SensorReader {
    pub fn new(device: Box<dyn Measurement>) -> Self {
        Self { device }
    }

    pub fn try_sample(&mut self) -> Result<Reading, SensorFault> {
        self.device.measure()?;
        let reading = Reading {
            temperature: self.device.temperature(),
            humidity: self.device.humidity(),
        };
        debug!("Sampled {:?}", reading);
        Ok(reading)
    }

    /// Samples the sensor, turning a measurement fault into an all-absent reading.
    pub fn sample(&mut self) -> Reading {
        self.try_sample().unwrap_or_else(|fault| {
            warn!("Sensor measurement failed: {}", fault);
            Reading::absent()
        })
    }
}
