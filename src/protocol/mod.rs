pub mod json;
pub mod msgpack;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::BenchResult;

/// SignalR record separator terminating every JSON-framed message.
pub const MESSAGE_TERMINATOR: u8 = 0x1e;

/// SignalR message type of an invocation; everything else (pings, acks,
/// completions) is ignored by the receive path.
pub const INVOCATION_MESSAGE_TYPE: i32 = 1;

/// Serialization flavor of a SignalR connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Json,
    Msgpack,
}

impl Flavor {
    /// Name used in the protocol-selection handshake frame.
    pub fn protocol_name(self) -> &'static str {
        match self {
            Flavor::Json => "json",
            Flavor::Msgpack => "messagepack",
        }
    }
}

/// A SignalR invocation, the common decode target of both codecs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Invocation {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(rename = "invocationId")]
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<String>,
    #[serde(rename = "nonBlocking")]
    pub non_blocking: bool,
}

/// Protocol-selection frame sent right after the WebSocket upgrade:
/// `{"protocol":<name>,"version":1}` followed by the record separator.
pub fn protocol_selection_frame(protocol: &str) -> Message {
    let mut text = serde_json::json!({ "protocol": protocol, "version": 1 }).to_string();
    text.push('\u{1e}');
    Message::Text(text)
}

/// Wall-clock nanoseconds embedded in echo payloads so the receive path can
/// compute a round trip against the same clock.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn random_payload(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Produces one invocation frame per tick of a session's writer loop.
///
/// Echo-style generators emit `[clientId, sendNanos]` so the server's echo
/// carries the send time back; group-send generators lead with the
/// session's group name instead.
#[derive(Debug, Clone)]
pub struct MessageGenerator {
    flavor: Flavor,
    target: String,
    interval: Duration,
    group_name: Option<String>,
    payload: Option<String>,
    invocation_id: u64,
}

impl MessageGenerator {
    pub fn echo(flavor: Flavor, target: &str, interval: Duration, payload: Option<String>) -> Self {
        Self {
            flavor,
            target: target.to_string(),
            interval,
            group_name: None,
            payload,
            invocation_id: 0,
        }
    }

    pub fn group(flavor: Flavor, target: &str, interval: Duration, group_name: String) -> Self {
        Self {
            flavor,
            target: target.to_string(),
            interval,
            group_name: Some(group_name),
            payload: None,
            invocation_id: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn generate(&mut self, client_id: &str) -> BenchResult<Message> {
        self.invocation_id += 1;
        let lead = match &self.group_name {
            Some(group) => group.clone(),
            None => self
                .payload
                .clone()
                .unwrap_or_else(|| client_id.to_string()),
        };
        let arguments = vec![lead, now_nanos().to_string()];
        let invocation_id = self.invocation_id.to_string();
        match self.flavor {
            Flavor::Json => json::invocation_frame(&invocation_id, &self.target, &arguments),
            Flavor::Msgpack => msgpack::invocation_frame(&invocation_id, &self.target, &arguments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_frame_is_terminated_text() {
        let frame = protocol_selection_frame("json");
        match frame {
            Message::Text(text) => {
                assert!(text.ends_with('\u{1e}'));
                let body: serde_json::Value =
                    serde_json::from_str(text.trim_end_matches('\u{1e}')).unwrap();
                assert_eq!(body["protocol"], "json");
                assert_eq!(body["version"], 1);
            }
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn generator_embeds_send_time() {
        let mut generator = MessageGenerator::echo(
            Flavor::Json,
            "echo",
            Duration::from_millis(100),
            None,
        );
        let before = now_nanos();
        let frame = generator.generate("client1").unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let invocation: Invocation =
            serde_json::from_str(text.trim_end_matches('\u{1e}')).unwrap();
        assert_eq!(invocation.kind, INVOCATION_MESSAGE_TYPE);
        assert_eq!(invocation.target, "echo");
        assert_eq!(invocation.arguments[0], "client1");
        let nanos: i64 = invocation.arguments[1].parse().unwrap();
        assert!(nanos >= before);
    }

    #[test]
    fn generator_invocation_ids_increase() {
        let mut generator = MessageGenerator::echo(
            Flavor::Json,
            "echo",
            Duration::from_millis(100),
            None,
        );
        for expected in 1..=3u64 {
            let Message::Text(text) = generator.generate("c").unwrap() else {
                panic!("expected text frame");
            };
            let invocation: Invocation =
                serde_json::from_str(text.trim_end_matches('\u{1e}')).unwrap();
            assert_eq!(invocation.invocation_id, expected.to_string());
        }
    }
}
