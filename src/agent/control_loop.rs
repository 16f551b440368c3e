//! Sense/publish/check loop with statum state machine
//!
//! # State Machine
//!
//! ```text
//! Starting ──► Running ──► Stopping ──► Stopped
//!     │                       ▲
//!     └── (connection fault) ─┴─ aborts before Running, nothing to tear down
//! ```
//!
//! Each Running cycle: check for control messages, sample, publish if the reading is
//! complete, sleep. A failed sample or a failed publish only costs that cycle. A
//! transport fault while checking for messages ends the loop.

use crate::actuator::{Actuator, ActuatorState};
use crate::config::AgentConfig;
use crate::mqtt::{BrokerClient, ConnectionFault};
use crate::network::NetworkLink;
use crate::sensor::SensorReader;
use statum::{machine, state};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why the loop left Running
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Fault(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::Fault(fault) => write!(f, "fault: {}", fault),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Published(String),
    Skipped,
    PublishFailed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub published: u64,
    pub skipped: u64,
    pub publish_failures: u64,
    pub messages_delivered: u64,
}

#[derive(Clone)]
pub struct LoopSettings {
    pub join_network: bool,
    pub ssid: String,
    pub credential: String,
    pub telemetry_topic: String,
    pub control_topic: String,
    pub publish_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            join_network: config.network.enabled,
            ssid: config.network.ssid.clone(),
            credential: config.network.credential.clone(),
            telemetry_topic: config.broker.telemetry_topic.clone(),
            control_topic: config.broker.control_topic.clone(),
            publish_interval: config.control_loop.publish_interval(),
        }
    }
}

impl fmt::Debug for LoopSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopSettings")
            .field("join_network", &self.join_network)
            .field("ssid", &self.ssid)
            .field("credential", &if self.credential.is_empty() { "" } else { "***" })
            .field("telemetry_topic", &self.telemetry_topic)
            .field("control_topic", &self.control_topic)
            .field("publish_interval", &self.publish_interval)
            .finish()
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum AgentState {
    Starting,
    Running,
    Stopping(StopReason),
    Stopped(StopReason),
}

/// Owns every resource of the agent: link, broker session, sensor and output pin.
#[machine]
pub struct ControlLoop<S: AgentState> {
    network: Box<dyn NetworkLink>,
    broker: Box<dyn BrokerClient>,
    sensor: SensorReader,
    actuator: Actuator,
    settings: LoopSettings,
    stats: CycleStats,
}

impl<S: AgentState> ControlLoop<S> {
    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn actuator_state(&self) -> ActuatorState {
        self.actuator.state()
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }
}

impl ControlLoop<Starting> {
    pub fn create(
        network: Box<dyn NetworkLink>,
        broker: Box<dyn BrokerClient>,
        sensor: SensorReader,
        actuator: Actuator,
        settings: LoopSettings,
    ) -> Self {
        info!("Creating control loop with settings: {:?}", settings);
        Self::new(
            network,
            broker,
            sensor,
            actuator,
            settings,
            CycleStats::default(),
        )
    }

    /// Joins the network, opens the broker session and subscribes to the control topic.
    ///
    /// A connect failure leaves nothing to tear down. A subscribe failure closes the
    /// freshly opened session before returning.
    pub async fn start(mut self) -> Result<ControlLoop<Running>, ConnectionFault> {
        if self.settings.join_network {
            self.network
                .join(&self.settings.ssid, &self.settings.credential)
                .await?;
        } else {
            info!("Network join disabled, assuming the link is up");
        }

        self.broker.connect().await?;

        if let Err(fault) = self.broker.subscribe(&self.settings.control_topic).await {
            error!(
                "Failed to subscribe to {}: {}",
                self.settings.control_topic, fault
            );
            if let Err(e) = self.broker.disconnect().await {
                warn!("Disconnect after failed subscribe also failed: {}", e);
            }
            return Err(fault);
        }

        info!("Control loop started");
        Ok(self.transition())
    }
}

impl ControlLoop<Running> {
    /// One iteration without the trailing sleep.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, ConnectionFault> {
        self.stats.cycles += 1;

        let delivered = self.broker.check_for_message(&mut self.actuator).await?;
        if delivered > 0 {
            debug!("Delivered {} control message(s)", delivered);
        }
        self.stats.messages_delivered += delivered as u64;

        Ok(self.publish_reading().await)
    }

    pub async fn publish_reading(&mut self) -> CycleOutcome {
        let reading = self.sensor.sample();
        let Some(payload) = reading.payload() else {
            warn!("Failed to read from DHT sensor, skipping publish ({:?})", reading);
            self.stats.skipped += 1;
            return CycleOutcome::Skipped;
        };

        match self
            .broker
            .publish(&self.settings.telemetry_topic, payload.as_bytes())
            .await
        {
            Ok(()) => {
                info!("Published: {}", payload);
                self.stats.published += 1;
                CycleOutcome::Published(payload)
            }
            Err(fault) => {
                error!("Error publishing data: {}", fault);
                self.stats.publish_failures += 1;
                CycleOutcome::PublishFailed
            }
        }
    }

    /// Cycles until `shutdown` resolves or a transport fault escapes a cycle.
    pub async fn run<F>(mut self, shutdown: F) -> ControlLoop<Stopping>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Publishing to {} every {:?}",
            self.settings.telemetry_topic, self.settings.publish_interval
        );

        loop {
            if let Err(fault) = self.run_cycle().await {
                error!("Error in main loop: {}", fault);
                return self.stop(StopReason::Fault(fault.to_string()));
            }

            let interrupted = tokio::select! {
                _ = &mut shutdown => true,
                _ = tokio::time::sleep(self.settings.publish_interval) => false,
            };
            if interrupted {
                return self.stop(StopReason::Interrupted);
            }
        }
    }

    pub fn stop(self, reason: StopReason) -> ControlLoop<Stopping> {
        info!("Leaving control loop: {}", reason);
        self.transition_with(reason)
    }
}

impl ControlLoop<Stopping> {
    pub fn reason(&self) -> Option<&StopReason> {
        self.get_state_data()
    }

    /// Closes the broker session regardless of why the loop stopped.
    pub async fn shutdown(mut self) -> ControlLoop<Stopped> {
        let reason = self
            .get_state_data()
            .cloned()
            .unwrap_or(StopReason::Interrupted);

        if let Err(e) = self.broker.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        info!("Disconnected from MQTT");
        info!("Control loop finished after {:?}", self.stats);
        self.transition_with(reason)
    }
}

impl ControlLoop<Stopped> {
    pub fn reason(&self) -> Option<&StopReason> {
        self.get_state_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::ControlMessage;
    use crate::testing::{FakeBroker, FakeNetwork, RecordingPin, ScriptedSensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn settings(interval: Duration) -> LoopSettings {
        LoopSettings {
            join_network: true,
            ssid: "Wokwi-GUEST".into(),
            credential: String::new(),
            telemetry_topic: "Tempdata".into(),
            control_topic: "lights".into(),
            publish_interval: interval,
        }
    }

    struct Harness {
        control_loop: ControlLoop<Starting>,
        broker: Rc<RefCell<crate::testing::BrokerLog>>,
        joins: Rc<RefCell<Vec<(String, String)>>>,
        levels: Rc<RefCell<Vec<bool>>>,
    }

    fn harness(
        broker: FakeBroker,
        network: FakeNetwork,
        script: Vec<crate::testing::ScriptedOutcome>,
        settings: LoopSettings,
    ) -> Harness {
        let broker_log = broker.log();
        let joins = network.joins();
        let (sensor, _) = ScriptedSensor::new(script);
        let (pin, levels) = RecordingPin::new();
        let actuator = Actuator::new(Box::new(pin), settings.control_topic.clone(), false);

        Harness {
            control_loop: ControlLoop::create(
                Box::new(network),
                Box::new(broker),
                SensorReader::new(Box::new(sensor)),
                actuator,
                settings,
            ),
            broker: broker_log,
            joins,
            levels,
        }
    }

    #[tokio::test]
    async fn failed_middle_sample_publishes_twice() {
        let h = harness(
            FakeBroker::new(),
            FakeNetwork::new(),
            vec![
                Ok((Some(21.5), Some(40.0))),
                Err(()),
                Ok((Some(-2.0), Some(88.5))),
            ],
            settings(Duration::ZERO),
        );

        let mut running = h.control_loop.start().await.unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(running.run_cycle().await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                CycleOutcome::Published("21.5,40.0".into()),
                CycleOutcome::Skipped,
                CycleOutcome::Published("-2.0,88.5".into()),
            ]
        );
        let log = h.broker.borrow();
        assert_eq!(log.checks, 3);
        assert_eq!(
            log.published,
            vec![
                ("Tempdata".to_string(), "21.5,40.0".to_string()),
                ("Tempdata".to_string(), "-2.0,88.5".to_string()),
            ]
        );
        assert_eq!(running.stats().published, 2);
        assert_eq!(running.stats().skipped, 1);
    }

    #[tokio::test]
    async fn partial_reading_is_never_published() {
        let h = harness(
            FakeBroker::new(),
            FakeNetwork::new(),
            vec![Ok((Some(20.0), None)), Ok((None, Some(35.0)))],
            settings(Duration::ZERO),
        );

        let mut running = h.control_loop.start().await.unwrap();
        assert_eq!(running.run_cycle().await.unwrap(), CycleOutcome::Skipped);
        assert_eq!(running.run_cycle().await.unwrap(), CycleOutcome::Skipped);
        assert!(h.broker.borrow().published.is_empty());
    }

    #[tokio::test]
    async fn startup_joins_then_subscribes() {
        let h = harness(
            FakeBroker::new(),
            FakeNetwork::new(),
            vec![],
            settings(Duration::ZERO),
        );

        let running = h.control_loop.start().await.unwrap();
        assert_eq!(
            *h.joins.borrow(),
            vec![("Wokwi-GUEST".to_string(), String::new())]
        );
        let log = h.broker.borrow();
        assert_eq!(log.connects, 1);
        assert_eq!(log.subscriptions, vec!["lights".to_string()]);
        assert_eq!(running.actuator_state(), ActuatorState::Off);
    }

    #[tokio::test]
    async fn connect_failure_never_runs_or_disconnects() {
        let h = harness(
            FakeBroker::new().failing_connect(),
            FakeNetwork::new(),
            vec![Ok((Some(21.0), Some(40.0)))],
            settings(Duration::ZERO),
        );

        let result = h.control_loop.start().await;
        assert!(matches!(result, Err(ConnectionFault::ConnectTimeout(_))));
        let log = h.broker.borrow();
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, 0);
        assert_eq!(log.checks, 0);
        assert!(log.subscriptions.is_empty());
        assert!(log.published.is_empty());
    }

    #[tokio::test]
    async fn join_failure_aborts_before_connecting() {
        let h = harness(
            FakeBroker::new(),
            FakeNetwork::failing(),
            vec![],
            settings(Duration::ZERO),
        );

        assert!(matches!(
            h.control_loop.start().await,
            Err(ConnectionFault::JoinTimeout { .. })
        ));
        assert_eq!(h.broker.borrow().connects, 0);
    }

    #[tokio::test]
    async fn disabled_join_goes_straight_to_the_broker() {
        let mut settings = settings(Duration::ZERO);
        settings.join_network = false;
        let h = harness(FakeBroker::new(), FakeNetwork::new(), vec![], settings);

        assert!(h.control_loop.start().await.is_ok());
        assert!(h.joins.borrow().is_empty());
        assert_eq!(h.broker.borrow().connects, 1);
    }

    #[tokio::test]
    async fn subscribe_failure_closes_the_session() {
        let h = harness(
            FakeBroker::new().failing_subscribe(),
            FakeNetwork::new(),
            vec![],
            settings(Duration::ZERO),
        );

        assert!(h.control_loop.start().await.is_err());
        assert_eq!(h.broker.borrow().disconnects, 1);
    }

    #[tokio::test]
    async fn control_messages_reach_the_actuator_before_sampling() {
        let broker = FakeBroker::new()
            .with_inbound(vec![ControlMessage::new("lights", b"ON".to_vec())])
            .with_inbound(vec![
                ControlMessage::new("lights", b"garbage".to_vec()),
                ControlMessage::new("lights", b"OFF".to_vec()),
            ]);
        let h = harness(
            broker,
            FakeNetwork::new(),
            vec![Ok((Some(21.0), Some(40.0))), Ok((Some(21.0), Some(40.0)))],
            settings(Duration::ZERO),
        );

        let mut running = h.control_loop.start().await.unwrap();
        running.run_cycle().await.unwrap();
        assert_eq!(running.actuator_state(), ActuatorState::On);
        running.run_cycle().await.unwrap();
        assert_eq!(running.actuator_state(), ActuatorState::Off);

        assert_eq!(*h.levels.borrow(), vec![false, true, false]);
        assert_eq!(running.stats().messages_delivered, 3);
    }

    #[tokio::test]
    async fn failed_publish_only_costs_one_cycle() {
        let h = harness(
            FakeBroker::new().failing_publish_at(1),
            FakeNetwork::new(),
            vec![Ok((Some(21.0), Some(40.0))), Ok((Some(21.5), Some(40.5)))],
            settings(Duration::ZERO),
        );

        let mut running = h.control_loop.start().await.unwrap();
        assert_eq!(running.run_cycle().await.unwrap(), CycleOutcome::PublishFailed);
        assert_eq!(
            running.run_cycle().await.unwrap(),
            CycleOutcome::Published("21.5,40.5".into())
        );
        assert_eq!(running.stats().publish_failures, 1);
    }

    #[tokio::test]
    async fn transport_fault_stops_and_disconnects() {
        let h = harness(
            FakeBroker::new().failing_check_at(2),
            FakeNetwork::new(),
            vec![Ok((Some(21.0), Some(40.0))), Ok((Some(21.0), Some(40.0)))],
            settings(Duration::ZERO),
        );

        let running = h.control_loop.start().await.unwrap();
        let stopping = running.run(std::future::pending::<()>()).await;
        assert!(matches!(stopping.reason(), Some(StopReason::Fault(_))));

        let stopped = stopping.shutdown().await;
        assert!(matches!(stopped.reason(), Some(StopReason::Fault(_))));

        let log = h.broker.borrow();
        assert_eq!(log.checks, 2);
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_the_loop_after_the_current_cycle() {
        let h = harness(
            FakeBroker::new(),
            FakeNetwork::new(),
            vec![Ok((Some(23.0), Some(45.0)))],
            settings(Duration::from_secs(3600)),
        );

        let running = h.control_loop.start().await.unwrap();
        let stopped = running.run(async {}).await.shutdown().await;

        assert_eq!(stopped.reason(), Some(&StopReason::Interrupted));
        assert_eq!(stopped.stats().cycles, 1);
        let log = h.broker.borrow();
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.disconnects, 1);
    }

    #[test]
    fn settings_debug_hides_the_credential() {
        let mut settings = settings(Duration::from_secs(5));
        settings.credential = "hunter2".into();
        let rendered = format!("{:?}", settings);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
