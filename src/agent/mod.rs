//! Agent assembly and lifecycle
//!
//! [`build_agent`] acquires the hardware and wires the collaborators into a
//! [`ControlLoop`]; [`run_agent`] drives it from Starting to Stopped.
//!
//! ```text
//! DHT22 ──► SensorReader ──► ControlLoop ──► MqttBrokerClient ──► telemetry topic
//!                                 ▲
//! control topic ──► MqttBrokerClient ──► Actuator ──► LED
//! ```

pub mod control_loop;

use crate::actuator::{self, Actuator};
use crate::config::{AgentConfig, ConfigError};
use crate::mqtt::mqtt_handler::MqttBrokerClient;
use crate::mqtt::ConnectionFault;
use crate::network::NmcliLink;
use crate::sensor::dht22::Dht22;
use crate::sensor::{SensorFault, SensorReader};
use control_loop::{ControlLoop, CycleStats, LoopSettings, Starting, StopReason};
use rppal::gpio::Gpio;
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("GPIO unavailable: {0}")]
    Hardware(#[from] rppal::gpio::Error),

    #[error("Sensor setup failed: {0}")]
    Sensor(#[from] SensorFault),

    #[error("Startup failed: {0}")]
    Connection(#[from] ConnectionFault),

    #[error("Control loop terminated: {0}")]
    Terminated(String),
}

/// How a run ended
#[derive(Debug)]
pub enum AgentOutcome {
    /// The loop never reached Running
    StartupFailed(ConnectionFault),
    Stopped {
        reason: StopReason,
        stats: CycleStats,
    },
}

impl AgentOutcome {
    /// An interrupt is a clean exit; everything else is reported as an error.
    pub fn into_result(self) -> Result<CycleStats, AgentError> {
        match self {
            AgentOutcome::StartupFailed(fault) => Err(AgentError::Connection(fault)),
            AgentOutcome::Stopped {
                reason: StopReason::Interrupted,
                stats,
            } => Ok(stats),
            AgentOutcome::Stopped {
                reason: StopReason::Fault(fault),
                ..
            } => Err(AgentError::Terminated(fault)),
        }
    }
}

/// Loads the configuration, writing a default file on first start.
pub async fn load_config(path: &Path) -> Result<AgentConfig, AgentError> {
    Ok(AgentConfig::ensure_and_load(path).await?)
}

pub fn build_agent(config: &AgentConfig) -> Result<ControlLoop<Starting>, AgentError> {
    let gpio = Gpio::new()?;
    let dht = Dht22::open(&gpio, config.hardware.dht_pin)?;
    let led = actuator::open_output(
        &gpio,
        config.hardware.led_pin,
        config.hardware.led_active_low,
    )?;

    let actuator = Actuator::new(
        Box::new(led),
        config.broker.control_topic.clone(),
        config.hardware.led_active_low,
    );

    Ok(ControlLoop::create(
        Box::new(NmcliLink::new(&config.network)),
        Box::new(MqttBrokerClient::new(&config.broker)),
        SensorReader::new(Box::new(dht)),
        actuator,
        LoopSettings::from_config(config),
    ))
}

pub async fn run_agent<F>(control_loop: ControlLoop<Starting>, shutdown: F) -> AgentOutcome
where
    F: Future<Output = ()>,
{
    let running = match control_loop.start().await {
        Ok(running) => running,
        Err(fault) => {
            error!("Error connecting to Wi-Fi or MQTT: {}", fault);
            return AgentOutcome::StartupFailed(fault);
        }
    };

    let stopped = running.run(shutdown).await.shutdown().await;
    AgentOutcome::Stopped {
        reason: stopped
            .reason()
            .cloned()
            .unwrap_or(StopReason::Interrupted),
        stats: stopped.stats(),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c => info!("Received interrupt"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            if let Err(e) = ctrl_c.await {
                warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received interrupt");
        }
    }
}
