//! DHT22 (AM2302) single-wire driver on a Raspberry Pi GPIO line
//!
//! # Protocol
//!
//! ```text
//! host:   ──┐ 2ms  ┌ 30µs ┐
//!           └──────┘      └ release (input, pull-up)
//! sensor:                   ┐ 80µs ┌ 80µs ┐ 50µs ┌ 26-28µs = 0 / 70µs = 1 ┐ ... x40
//!                           └──────┘      └──────┘                        └
//! ```
//!
//! The 40 bits form five bytes: humidity (2), temperature (2), checksum (1).

use super::{Measurement, SensorFault};
use rppal::gpio::{Bias, Gpio, IoPin, Level, Mode};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const START_LOW: Duration = Duration::from_millis(2);
const START_RELEASE: Duration = Duration::from_micros(30);
const EDGE_TIMEOUT: Duration = Duration::from_micros(200);
const ONE_THRESHOLD: Duration = Duration::from_micros(50);
/// The sensor does not produce fresh values faster than this
const MIN_CYCLE: Duration = Duration::from_secs(2);
const FRAME_BITS: usize = 40;

/// Outcome of the most recent bus cycle
#[derive(Clone, Copy, Debug)]
struct LastCycle {
    at: Instant,
    /// `(temperature, humidity)` when the cycle produced a valid frame
    values: Option<(f32, f32)>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CyclePlan {
    Measure,
    Reuse(f32, f32),
    /// The last cycle failed and the sensor is not ready for another one
    Unavailable,
}

fn plan_cycle(last: Option<&LastCycle>, now: Instant) -> CyclePlan {
    match last {
        Some(cycle) if now.saturating_duration_since(cycle.at) < MIN_CYCLE => match cycle.values {
            Some((temperature, humidity)) => CyclePlan::Reuse(temperature, humidity),
            None => CyclePlan::Unavailable,
        },
        _ => CyclePlan::Measure,
    }
}

pub struct Dht22 {
    pin: IoPin,
    gpio_number: u8,
    last_cycle: Option<LastCycle>,
    temperature: Option<f32>,
    humidity: Option<f32>,
}

impl Dht22 {
    pub fn open(gpio: &Gpio, gpio_number: u8) -> Result<Self, SensorFault> {
        let mut pin = gpio.get(gpio_number)?.into_io(Mode::Input);
        pin.set_bias(Bias::PullUp);
        info!("DHT22 attached to GPIO {}", gpio_number);

        Ok(Self {
            pin,
            gpio_number,
            last_cycle: None,
            temperature: None,
            humidity: None,
        })
    }

    fn send_start_signal(&mut self) {
        self.pin.set_mode(Mode::Output);
        self.pin.set_low();
        std::thread::sleep(START_LOW);
        self.pin.set_high();
        spin_for(START_RELEASE);
        self.pin.set_mode(Mode::Input);
        self.pin.set_bias(Bias::PullUp);
    }

    /// Spins while the line stays at `level`, returning how long it stayed there.
    fn wait_while(&self, level: Level, phase: &'static str) -> Result<Duration, SensorFault> {
        let start = Instant::now();
        while self.pin.read() == level {
            if start.elapsed() > EDGE_TIMEOUT {
                return Err(SensorFault::Timeout { phase });
            }
        }
        Ok(start.elapsed())
    }

    fn read_frame(&mut self) -> Result<[u8; 5], SensorFault> {
        self.send_start_signal();

        self.wait_while(Level::High, "sensor response")?;
        self.wait_while(Level::Low, "response low phase")?;
        self.wait_while(Level::High, "response high phase")?;

        let mut pulses = [Duration::ZERO; FRAME_BITS];
        for pulse in pulses.iter_mut() {
            self.wait_while(Level::Low, "bit start")?;
            *pulse = self.wait_while(Level::High, "bit value")?;
        }

        Ok(pulses_to_frame(&pulses))
    }
}

impl Measurement for Dht22 {
    fn measure(&mut self) -> Result<(), SensorFault> {
        let now = Instant::now();
        match plan_cycle(self.last_cycle.as_ref(), now) {
            CyclePlan::Reuse(temperature, humidity) => {
                debug!("DHT22 measured less than {:?} ago, reusing values", MIN_CYCLE);
                self.temperature = Some(temperature);
                self.humidity = Some(humidity);
                return Ok(());
            }
            CyclePlan::Unavailable => {
                self.temperature = None;
                self.humidity = None;
                return Err(SensorFault::NotReady);
            }
            CyclePlan::Measure => {}
        }

        self.temperature = None;
        self.humidity = None;
        let decoded = self.read_frame().and_then(|frame| {
            let values = decode_frame(frame)?;
            debug!("DHT22 on GPIO {}: frame {:02x?}", self.gpio_number, frame);
            Ok(values)
        });
        self.last_cycle = Some(LastCycle {
            at: now,
            values: decoded.as_ref().ok().copied(),
        });

        let (temperature, humidity) = decoded?;
        debug!("DHT22 read {} C, {} %", temperature, humidity);
        self.temperature = Some(temperature);
        self.humidity = Some(humidity);
        Ok(())
    }

    fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    fn humidity(&self) -> Option<f32> {
        self.humidity
    }
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// Packs high-pulse lengths MSB first; pulses longer than 50µs are ones.
pub fn pulses_to_frame(pulses: &[Duration; FRAME_BITS]) -> [u8; 5] {
    let mut frame = [0u8; 5];
    for (index, pulse) in pulses.iter().enumerate() {
        if *pulse > ONE_THRESHOLD {
            frame[index / 8] |= 0x80 >> (index % 8);
        }
    }
    frame
}

/// Returns `(temperature °C, relative humidity %)`.
pub fn decode_frame(frame: [u8; 5]) -> Result<(f32, f32), SensorFault> {
    let computed = frame[..4]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    if computed != frame[4] {
        return Err(SensorFault::Checksum {
            expected: frame[4],
            computed,
        });
    }

    let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f32 / 10.0;
    let magnitude = u16::from_be_bytes([frame[2] & 0x7f, frame[3]]) as f32 / 10.0;
    let temperature = if frame[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    Ok((temperature, humidity))
}
