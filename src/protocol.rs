//! Wire messages exchanged over the broadcast channels.
//!
//! Messages are JSON-encoded. A payload that fails to decode is dropped by
//! the receiver (logged at warn), never treated as fatal.

use serde::{Deserialize, Serialize};

/// Message on the status channel: startup readiness and round outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The node's progress listener is subscribed and live.
    Ready { node: String },
    /// The node's "produced new work" flag for a round.
    Status {
        node: String,
        round: u64,
        produced: bool,
    },
}

/// Message on the progress channel: fractional round completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub node: String,
    pub round: u64,
    pub fraction: f64,
}

impl Message {
    pub fn encode(&self) -> String {
        // Serialization of these field types cannot fail.
        serde_json::to_string(self).expect("status message serializes")
    }

    pub fn decode(payload: &str) -> Option<Self> {
        match serde_json::from_str(payload) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::warn!(%err, payload, "dropping malformed status message");
                None
            }
        }
    }
}

impl ProgressMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("progress message serializes")
    }

    pub fn decode(payload: &str) -> Option<Self> {
        match serde_json::from_str(payload) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::warn!(%err, payload, "dropping malformed progress message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        let msg = Message::Status {
            node: "10.0.0.1:7001".into(),
            round: 3,
            produced: true,
        };
        assert_eq!(Message::decode(&msg.encode()), Some(msg));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert_eq!(Message::decode("not json"), None);
        assert_eq!(Message::decode(r#"{"type":"unknown"}"#), None);
        assert_eq!(ProgressMessage::decode(r#"{"node":"x"}"#), None);
    }

    #[test]
    fn progress_round_trip() {
        let msg = ProgressMessage {
            node: "10.0.0.2:7001".into(),
            round: 1,
            fraction: 0.5,
        };
        assert_eq!(ProgressMessage::decode(&msg.encode()), Some(msg));
    }
}
