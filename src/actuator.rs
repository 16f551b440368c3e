//! Binary output (the LED) switched by control messages

use crate::mqtt::message_manager::ControlMessage;
use crate::mqtt::MessageHandler;
use rppal::gpio::{Gpio, OutputPin};
use std::fmt;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActuatorState {
    #[default]
    Off,
    On,
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActuatorState::Off => write!(f, "OFF"),
            ActuatorState::On => write!(f, "ON"),
        }
    }
}

/// Recognized control payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    On,
    Off,
}

impl ControlCommand {
    /// Exact byte match; anything else is not a command.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"ON" => Some(ControlCommand::On),
            b"OFF" => Some(ControlCommand::Off),
            _ => None,
        }
    }

    fn target_state(self) -> ActuatorState {
        match self {
            ControlCommand::On => ActuatorState::On,
            ControlCommand::Off => ActuatorState::Off,
        }
    }
}

/// A digital output line
pub trait DigitalOutput {
    fn set_level(&mut self, high: bool);
}

impl DigitalOutput for OutputPin {
    fn set_level(&mut self, high: bool) {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

/// Line level that puts the output in `state`
fn output_level(state: ActuatorState, active_low: bool) -> bool {
    (state == ActuatorState::On) != active_low
}

/// Claims the pin already at its OFF level so the output never blinks on at boot.
pub fn open_output(
    gpio: &Gpio,
    gpio_number: u8,
    active_low: bool,
) -> Result<OutputPin, rppal::gpio::Error> {
    let pin = gpio.get(gpio_number)?;
    let pin = if output_level(ActuatorState::Off, active_low) {
        pin.into_output_high()
    } else {
        pin.into_output_low()
    };
    info!("Output attached to GPIO {}", gpio_number);
    Ok(pin)
}

pub struct Actuator {
    pin: Box<dyn DigitalOutput>,
    state: ActuatorState,
    control_topic: String,
    active_low: bool,
}

impl Actuator {
    /// Takes ownership of the pin and drives it to the OFF level.
    pub fn new(
        pin: Box<dyn DigitalOutput>,
        control_topic: impl Into<String>,
        active_low: bool,
    ) -> Self {
        let mut actuator = Self {
            pin,
            state: ActuatorState::Off,
            control_topic: control_topic.into(),
            active_low,
        };
        actuator.drive(ActuatorState::Off);
        actuator
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn apply(&mut self, command: ControlCommand) {
        let target = command.target_state();
        self.drive(target);
        info!("LED turned {}", target);
    }

    fn drive(&mut self, state: ActuatorState) {
        self.pin
            .set_level(output_level(state, self.active_low));
        self.state = state;
    }
}

impl MessageHandler for Actuator {
    fn on_message(&mut self, message: &ControlMessage) {
        info!(
            "Message received on topic {}: {:?}",
            message.topic(),
            String::from_utf8_lossy(message.payload())
        );
        if message.topic() != self.control_topic {
            warn!("Ignoring message on unexpected topic {}", message.topic());
            return;
        }
        match ControlCommand::parse(message.payload()) {
            Some(command) => self.apply(command),
            None => warn!("Ignoring unrecognized control payload: {}", message),
        }
    }
}
