use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker identity, topics and transport timing
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Must be unique among clients connected to the same broker
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Publish-only
    pub telemetry_topic: String,
    /// Subscribe-only
    pub control_topic: String,
    pub connect_timeout_secs: u64,
    /// Upper bound for a single non-blocking message check
    pub poll_window_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: "raspberry_pi_pico_client".to_string(),
            keep_alive_secs: 60,
            telemetry_topic: "Tempdata".to_string(),
            control_topic: "lights".to_string(),
            connect_timeout_secs: 10,
            poll_window_ms: 50,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn poll_window(&self) -> Duration {
        Duration::from_millis(self.poll_window_ms.max(1))
    }

    /// Keep-alive announced to the broker, never below 5s
    pub fn effective_keep_alive_secs(&self) -> u64 {
        self.keep_alive_secs.max(5)
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.effective_keep_alive_secs()))
            .set_clean_session(true);
        options
    }

    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
