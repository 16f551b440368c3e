//! # MQTT Integration Module
//!
//! The agent talks to exactly one broker: it publishes telemetry to one topic and listens
//! for control commands on another. This module defines the contract the control loop
//! consumes and provides the rumqttc-backed implementation of it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker identity, topics and timing
//! ├── message_manager.rs  - Inbound message representation
//! └── mqtt_handler.rs     - rumqttc session adapter
//! ```
//!
//! ## Delivery Model
//!
//! There is no push path. Inbound messages only reach a [`MessageHandler`] while
//! [`BrokerClient::check_for_message`] runs, synchronously and on the caller's task.
//! Publishing is fire-and-forget at QoS 0, but `publish` and `subscribe` only return once
//! their packet has been written to the socket.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use async_trait::async_trait;
use message_manager::ControlMessage;
use thiserror::Error;

/// Network join or broker transport failure
#[derive(Debug, Error)]
pub enum ConnectionFault {
    #[error("Network join failed: {0}")]
    Join(String),

    #[error("Network '{ssid}' not joined within {secs}s")]
    JoinTimeout { ssid: String, secs: u64 },

    #[error("Broker did not acknowledge the connection within {0}s")]
    ConnectTimeout(u64),

    #[error("{packet} was not written to the broker within {secs}s")]
    SendTimeout { packet: &'static str, secs: u64 },

    #[error("Broker transport error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),

    #[error("Broker request rejected: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("Broker session is not connected")]
    NotConnected,
}

/// Receives inbound messages during [`BrokerClient::check_for_message`].
pub trait MessageHandler {
    fn on_message(&mut self, message: &ControlMessage);
}

/// Publish/subscribe session consumed by the control loop.
#[async_trait(?Send)]
pub trait BrokerClient {
    /// Opens the session.
    async fn connect(&mut self) -> Result<(), ConnectionFault>;

    /// Registers interest in `topic`. Matching messages arrive via `check_for_message`.
    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionFault>;

    /// Writes `payload` to `topic` without waiting for any acknowledgment.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ConnectionFault>;

    /// Hands every queued inbound message to `handler` and returns without waiting for
    /// new ones. Returns the number of messages delivered.
    async fn check_for_message(
        &mut self,
        handler: &mut dyn MessageHandler,
    ) -> Result<usize, ConnectionFault>;

    /// Releases the session. Calling it on a closed or never-opened session does nothing.
    async fn disconnect(&mut self) -> Result<(), ConnectionFault>;
}
