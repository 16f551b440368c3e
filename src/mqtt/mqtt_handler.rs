use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::config::BrokerConfig;
use super::message_manager::ControlMessage;
use super::{BrokerClient, ConnectionFault, MessageHandler};

// Bounds a single check so a chatty broker cannot starve the sampling cycle
const MAX_EVENTS_PER_CHECK: usize = 64;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);
const MAX_ERROR_HISTORY: usize = 10;
const REQUEST_CAPACITY: usize = 10;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl SessionStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_HISTORY {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }

    fn touch(&mut self) {
        self.last_activity = Some(chrono::Local::now());
    }
}

/// [`BrokerClient`] backed by a rumqttc session.
///
/// The event loop is only driven from inside the trait methods, so all network
/// activity happens on the caller's task. Inbound messages read while an outgoing
/// packet is being flushed are held until the next `check_for_message`.
pub struct MqttBrokerClient {
    status: SessionStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    pending: VecDeque<ControlMessage>,
    server: String,
    connect_timeout: Duration,
    poll_window: Duration,
}

impl MqttBrokerClient {
    pub fn new(config: &BrokerConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), REQUEST_CAPACITY);

        MqttBrokerClient {
            status: SessionStatus::default(),
            client,
            eventloop,
            pending: VecDeque::new(),
            server: config.server(),
            connect_timeout: config.connect_timeout(),
            poll_window: config.poll_window(),
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    fn ensure_connected(&self) -> Result<(), ConnectionFault> {
        if self.status.connection_state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ConnectionFault::NotConnected)
        }
    }

    fn fail(&mut self, fault: ConnectionFault) -> ConnectionFault {
        error!("MQTT session with {} failed: {}", self.server, fault);
        self.status.connection_state = ConnectionState::Failed;
        self.status.record_error(fault.to_string());
        fault
    }

    /// Books an event seen outside of connect/disconnect. Inbound PUBLISH packets are
    /// queued for the handler.
    fn absorb(&mut self, event: Event) -> Result<(), ConnectionFault> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                let message = ControlMessage::new(publish.topic.clone(), publish.payload.to_vec());
                debug!("Inbound message: {}", message);
                self.status.messages_received += 1;
                self.status.touch();
                self.pending.push_back(message);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker {} closed the session", self.server);
                return Err(self.fail(ConnectionFault::NotConnected));
            }
            other => debug!("MQTT event: {:?}", other),
        }
        Ok(())
    }

    /// Drives the event loop until `written` matches an outgoing packet, i.e. the
    /// request has been flushed to the socket.
    async fn flush_until<F>(&mut self, packet: &'static str, written: F) -> Result<(), ConnectionFault>
    where
        F: Fn(&Outgoing) -> bool,
    {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let event = match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    let fault = ConnectionFault::SendTimeout {
                        packet,
                        secs: self.connect_timeout.as_secs(),
                    };
                    return Err(self.fail(fault));
                }
                Ok(Ok(event)) => event,
                Ok(Err(e)) => return Err(self.fail(e.into())),
            };

            match event {
                Event::Outgoing(outgoing) if written(&outgoing) => return Ok(()),
                other => self.absorb(other)?,
            }
        }
    }
}

#[async_trait(?Send)]
impl BrokerClient for MqttBrokerClient {
    async fn connect(&mut self) -> Result<(), ConnectionFault> {
        info!("Connecting to MQTT broker {}", self.server);

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    let fault = ConnectionFault::ConnectTimeout(self.connect_timeout.as_secs());
                    return Err(self.fail(fault));
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        let fault: ConnectionFault =
                            ConnectionError::ConnectionRefused(ack.code).into();
                        return Err(self.fail(fault));
                    }
                    self.status.connection_state = ConnectionState::Connected;
                    self.status.touch();
                    info!("Connected to MQTT broker {}", self.server);
                    return Ok(());
                }
                Ok(Ok(event)) => debug!("MQTT event while connecting: {:?}", event),
                Ok(Err(e)) => return Err(self.fail(e.into())),
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionFault> {
        self.ensure_connected()?;
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        self.flush_until("SUBSCRIBE", |outgoing| matches!(outgoing, Outgoing::Subscribe(_)))
            .await?;
        info!("Subscribed to: {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ConnectionFault> {
        self.ensure_connected()?;
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
        self.flush_until("PUBLISH", |outgoing| matches!(outgoing, Outgoing::Publish(_)))
            .await?;
        self.status.messages_sent += 1;
        self.status.touch();
        debug!("Wrote {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    async fn check_for_message(
        &mut self,
        handler: &mut dyn MessageHandler,
    ) -> Result<usize, ConnectionFault> {
        self.ensure_connected()?;

        let mut delivered = 0;
        for _ in 0..MAX_EVENTS_PER_CHECK {
            while let Some(message) = self.pending.pop_front() {
                handler.on_message(&message);
                delivered += 1;
            }

            match timeout(self.poll_window, self.eventloop.poll()).await {
                // Nothing ready within the window
                Err(_) => break,
                Ok(Ok(event)) => self.absorb(event)?,
                Ok(Err(e)) => return Err(self.fail(e.into())),
            }
        }

        while let Some(message) = self.pending.pop_front() {
            handler.on_message(&message);
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionFault> {
        self.pending.clear();
        if self.status.connection_state != ConnectionState::Connected {
            debug!(
                "Skipping disconnect, session is {:?}",
                self.status.connection_state
            );
            self.status.connection_state = ConnectionState::Disconnected;
            return Ok(());
        }

        self.status.connection_state = ConnectionState::Disconnected;
        self.client.try_disconnect()?;

        // Drive the event loop until the DISCONNECT packet is written
        let deadline = Instant::now() + DISCONNECT_FLUSH;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
                Ok(Ok(event)) => debug!("MQTT event while disconnecting: {:?}", event),
                Ok(Err(e)) => {
                    debug!("Event loop closed while disconnecting: {}", e);
                    break;
                }
                Err(_) => {
                    warn!("DISCONNECT to {} not confirmed in time", self.server);
                    break;
                }
            }
        }

        info!(
            "Disconnected from MQTT broker {} ({} sent, {} received, {} errors, last activity {})",
            self.server,
            self.status.messages_sent,
            self.status.messages_received,
            self.status.error_messages.len(),
            self.status
                .last_activity
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        Ok(())
    }
}
