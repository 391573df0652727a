//! SignalR JSON framing: UTF-8 JSON objects concatenated with the `0x1e`
//! record separator. One physical text frame may carry several logical
//! messages.

use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{BenchError, BenchResult};
use crate::protocol::{INVOCATION_MESSAGE_TYPE, Invocation, MESSAGE_TERMINATOR};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: i32,
}

/// Splits a received buffer into logical messages, dropping the empty
/// pieces produced by adjacent or trailing separators.
pub fn split_messages(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|byte| *byte == MESSAGE_TERMINATOR)
        .filter(|piece| !piece.is_empty())
}

/// Reads the common envelope and returns the message type.
pub fn decode_kind(piece: &[u8]) -> BenchResult<i32> {
    let envelope: Envelope = serde_json::from_slice(piece)?;
    Ok(envelope.kind)
}

pub fn decode_invocation(piece: &[u8]) -> BenchResult<Invocation> {
    Ok(serde_json::from_slice(piece)?)
}

/// Encodes a type-1 invocation as a terminated text frame.
pub fn invocation_frame(
    invocation_id: &str,
    target: &str,
    arguments: &[String],
) -> BenchResult<Message> {
    let invocation = Invocation {
        kind: INVOCATION_MESSAGE_TYPE,
        invocation_id: invocation_id.to_string(),
        target: target.to_string(),
        arguments: arguments.to_vec(),
        non_blocking: false,
    };
    let mut text = serde_json::to_string(&invocation)?;
    text.push('\u{1e}');
    Ok(Message::Text(text))
}

/// One-shot request frame for the join/leave-group verbs.
pub fn group_request(target: &str, group_name: &str) -> BenchResult<Message> {
    if target.is_empty() {
        return Err(BenchError::send("no group target configured"));
    }
    invocation_frame("0", target, &[group_name.to_string(), "perf".to_string()])
}
