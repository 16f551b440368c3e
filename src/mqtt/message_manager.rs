use chrono::NaiveDateTime;
use std::fmt;

/// Inbound message as handed to a [`MessageHandler`](super::MessageHandler)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    topic: String,
    payload: Vec<u8>,
    received_at: NaiveDateTime,
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.payload).chars().take(32).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

impl ControlMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        ControlMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn received_at(&self) -> NaiveDateTime {
        self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let message = ControlMessage::new("lights", vec![b'x'; 100]);
        let rendered = message.to_string();
        assert!(rendered.ends_with(&format!("lights: {}", "x".repeat(32))));
    }

    #[test]
    fn binary_payload_is_kept_verbatim() {
        let message = ControlMessage::new("lights", vec![0xff, 0x00, b'O']);
        assert_eq!(message.payload(), &[0xff, 0x00, b'O']);
        assert_eq!(message.topic(), "lights");
    }
}
