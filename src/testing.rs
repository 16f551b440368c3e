//! Recording fakes for the hardware and transport seams

use crate::actuator::DigitalOutput;
use crate::mqtt::message_manager::ControlMessage;
use crate::mqtt::{BrokerClient, ConnectionFault, MessageHandler};
use crate::network::NetworkLink;
use crate::sensor::{Measurement, SensorFault};
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
pub struct RecordingHandler {
    pub messages: Vec<ControlMessage>,
}

impl MessageHandler for RecordingHandler {
    fn on_message(&mut self, message: &ControlMessage) {
        self.messages.push(message.clone());
    }
}

pub struct RecordingPin {
    levels: Rc<RefCell<Vec<bool>>>,
}

impl RecordingPin {
    pub fn new() -> (Self, Rc<RefCell<Vec<bool>>>) {
        let levels = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                levels: levels.clone(),
            },
            levels,
        )
    }
}

impl DigitalOutput for RecordingPin {
    fn set_level(&mut self, high: bool) {
        self.levels.borrow_mut().push(high);
    }
}

/// `Ok((temperature, humidity))` for a completed cycle, `Err(())` for a failed one
pub type ScriptedOutcome = Result<(Option<f32>, Option<f32>), ()>;

pub struct ScriptedSensor {
    script: VecDeque<ScriptedOutcome>,
    measurements: Rc<Cell<usize>>,
    temperature: Option<f32>,
    humidity: Option<f32>,
}

impl ScriptedSensor {
    pub fn new(script: Vec<ScriptedOutcome>) -> (Self, Rc<Cell<usize>>) {
        let measurements = Rc::new(Cell::new(0));
        (
            Self {
                script: script.into(),
                measurements: measurements.clone(),
                temperature: None,
                humidity: None,
            },
            measurements,
        )
    }
}

impl Measurement for ScriptedSensor {
    fn measure(&mut self) -> Result<(), SensorFault> {
        self.measurements.set(self.measurements.get() + 1);
        match self.script.pop_front() {
            Some(Ok((temperature, humidity))) => {
                self.temperature = temperature;
                self.humidity = humidity;
                Ok(())
            }
            Some(Err(())) | None => Err(SensorFault::Timeout {
                phase: "sensor response",
            }),
        }
    }

    fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    fn humidity(&self) -> Option<f32> {
        self.humidity
    }
}

#[derive(Debug, Default)]
pub struct BrokerLog {
    pub connects: usize,
    pub subscriptions: Vec<String>,
    /// `(topic, payload)`
    pub published: Vec<(String, String)>,
    pub publish_attempts: usize,
    pub checks: usize,
    pub disconnects: usize,
}

#[derive(Default)]
pub struct FakeBroker {
    log: Rc<RefCell<BrokerLog>>,
    connected: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_publish_at: Option<usize>,
    fail_check_at: Option<usize>,
    inbound: VecDeque<Vec<ControlMessage>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Rc<RefCell<BrokerLog>> {
        self.log.clone()
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    /// The n-th publish (1-based) fails
    pub fn failing_publish_at(mut self, attempt: usize) -> Self {
        self.fail_publish_at = Some(attempt);
        self
    }

    /// The n-th check (1-based) fails
    pub fn failing_check_at(mut self, check: usize) -> Self {
        self.fail_check_at = Some(check);
        self
    }

    /// Messages delivered by the next check without queued messages
    pub fn with_inbound(mut self, batch: Vec<ControlMessage>) -> Self {
        self.inbound.push_back(batch);
        self
    }
}

#[async_trait(?Send)]
impl BrokerClient for FakeBroker {
    async fn connect(&mut self) -> Result<(), ConnectionFault> {
        self.log.borrow_mut().connects += 1;
        if self.fail_connect {
            return Err(ConnectionFault::ConnectTimeout(1));
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionFault> {
        if self.fail_subscribe || !self.connected {
            return Err(ConnectionFault::NotConnected);
        }
        self.log.borrow_mut().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ConnectionFault> {
        let mut log = self.log.borrow_mut();
        log.publish_attempts += 1;
        if !self.connected || self.fail_publish_at == Some(log.publish_attempts) {
            return Err(ConnectionFault::NotConnected);
        }
        log.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    async fn check_for_message(
        &mut self,
        handler: &mut dyn MessageHandler,
    ) -> Result<usize, ConnectionFault> {
        let check = {
            let mut log = self.log.borrow_mut();
            log.checks += 1;
            log.checks
        };
        if !self.connected || self.fail_check_at == Some(check) {
            self.connected = false;
            return Err(ConnectionFault::NotConnected);
        }

        let batch = self.inbound.pop_front().unwrap_or_default();
        for message in &batch {
            handler.on_message(message);
        }
        Ok(batch.len())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionFault> {
        self.log.borrow_mut().disconnects += 1;
        self.connected = false;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNetwork {
    joins: Rc<RefCell<Vec<(String, String)>>>,
    fail: bool,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn joins(&self) -> Rc<RefCell<Vec<(String, String)>>> {
        self.joins.clone()
    }
}

#[async_trait(?Send)]
impl NetworkLink for FakeNetwork {
    async fn join(&mut self, ssid: &str, credential: &str) -> Result<(), ConnectionFault> {
        self.joins
            .borrow_mut()
            .push((ssid.to_string(), credential.to_string()));
        if self.fail {
            return Err(ConnectionFault::JoinTimeout {
                ssid: ssid.to_string(),
                secs: 0,
            });
        }
        Ok(())
    }
}
