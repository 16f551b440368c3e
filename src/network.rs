//! Wi-Fi join through NetworkManager's `nmcli`

use crate::config::NetworkConfig;
use crate::mqtt::ConnectionFault;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NMCLI: &str = "nmcli";

/// Brings up the wireless link the agent publishes over.
#[async_trait(?Send)]
pub trait NetworkLink {
    /// Returns once the link to `ssid` is up.
    async fn join(&mut self, ssid: &str, credential: &str) -> Result<(), ConnectionFault>;
}

pub struct NmcliLink {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl NmcliLink {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            poll_interval: config.join_poll_interval(),
            timeout: config.join_timeout(),
        }
    }

    async fn active_ssid(&self) -> Result<Option<String>, ConnectionFault> {
        let output = Command::new(NMCLI)
            .args(["-t", "-f", "ACTIVE,SSID", "device", "wifi"])
            .output()
            .await
            .map_err(|e| ConnectionFault::Join(format!("failed to run {NMCLI}: {e}")))?;

        if !output.status.success() {
            warn!(
                "{} could not list networks: {}",
                NMCLI,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        Ok(parse_active_ssid(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn request_connect(&self, ssid: &str, credential: &str) -> Result<(), ConnectionFault> {
        let mut command = Command::new(NMCLI);
        command.args(["device", "wifi", "connect", ssid]);
        if !credential.is_empty() {
            command.args(["password", credential]);
        }

        let output = command
            .output()
            .await
            .map_err(|e| ConnectionFault::Join(format!("failed to run {NMCLI}: {e}")))?;
        if output.status.success() {
            debug!("{} accepted connect request for {}", NMCLI, ssid);
        } else {
            // Keep polling, the link may still come up on its own
            warn!(
                "Connect request for {} failed: {}",
                ssid,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl NetworkLink for NmcliLink {
    async fn join(&mut self, ssid: &str, credential: &str) -> Result<(), ConnectionFault> {
        if self.active_ssid().await?.as_deref() == Some(ssid) {
            info!("Already connected to Wi-Fi: {}", ssid);
            return Ok(());
        }

        info!("Joining Wi-Fi network {}", ssid);
        self.request_connect(ssid, credential).await?;

        let started = Instant::now();
        loop {
            if self.active_ssid().await?.as_deref() == Some(ssid) {
                info!("Connected to Wi-Fi: {}", ssid);
                return Ok(());
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    return Err(ConnectionFault::JoinTimeout {
                        ssid: ssid.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            }
            info!("Connecting to WiFi...");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Picks the active network out of `nmcli -t -f ACTIVE,SSID device wifi` output.
fn parse_active_ssid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("yes:"))
        .map(unescape_terse)
        .filter(|ssid| !ssid.is_empty())
}

// Terse mode escapes ':' and '\' with a backslash
fn unescape_terse(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                result.push(escaped);
            }
        } else {
            result.push(c);
        }
    }
    result
}
