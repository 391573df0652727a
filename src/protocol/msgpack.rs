//! SignalR MessagePack framing: every logical message is prefixed with a
//! 7-bit-per-byte little-endian varint length (continuation bit in the
//! MSB, at most 5 bytes). The payload is a MessagePack array
//! `[messageType, invocationId, target, params]`; for non-invocation
//! types the trailing fields are absent.

use rmpv::Value;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{BenchError, BenchResult};
use crate::protocol::{INVOCATION_MESSAGE_TYPE, Invocation};

const NUM_BITS_TO_SHIFT: [u32; 5] = [0, 7, 14, 21, 28];

/// Encodes a payload length as a varint prefix. Zero encodes as a single
/// zero byte.
pub fn encode_length(mut length: usize) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(5);
    while length > 0 {
        let mut current = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            current |= 0x80;
        }
        prefix.push(current);
    }
    if prefix.is_empty() {
        prefix.push(0);
    }
    prefix
}

/// Decodes a varint length prefix, returning `(length, bytes_consumed)`.
pub fn decode_length(data: &[u8]) -> BenchResult<(usize, usize)> {
    let mut length = 0usize;
    let mut consumed = 0usize;
    let mut more = true;
    while more && consumed < data.len() && consumed < 5 {
        let byte = data[consumed];
        length |= ((byte & 0x7f) as usize) << NUM_BITS_TO_SHIFT[consumed];
        more = byte & 0x80 != 0;
        consumed += 1;
    }
    if consumed == 0 {
        return Err(BenchError::decode("empty length prefix"));
    }
    if more && consumed < 5 {
        return Err(BenchError::decode("unterminated length prefix"));
    }
    Ok((length, consumed))
}

/// Splits a binary frame into its varint-framed payloads. A declared
/// length running past the end of the buffer is a framing error.
pub fn split_messages(data: &[u8]) -> BenchResult<Vec<&[u8]>> {
    let mut payloads = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (length, consumed) = decode_length(&data[offset..])?;
        let start = offset + consumed;
        let end = start + length;
        if end > data.len() {
            return Err(BenchError::decode(format!(
                "not enough data in message, message length = {}, length section bytes = {}, data length = {}",
                length,
                consumed,
                data.len() - offset,
            )));
        }
        payloads.push(&data[start..end]);
        offset = end;
    }
    Ok(payloads)
}

pub fn decode_invocation(payload: &[u8]) -> BenchResult<Invocation> {
    let mut cursor = payload;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|err| BenchError::decode(format!("malformed msgpack message: {}", err)))?;
    let items = value
        .as_array()
        .ok_or_else(|| BenchError::decode("msgpack message is not an array"))?;
    let kind = items
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| BenchError::decode("msgpack message has no type tag"))? as i32;
    if kind != INVOCATION_MESSAGE_TYPE {
        return Ok(Invocation {
            kind,
            ..Invocation::default()
        });
    }

    let invocation_id = items
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| BenchError::decode("invocation is missing its id"))?;
    let target = items
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| BenchError::decode("invocation is missing its target"))?;
    let params = items
        .get(3)
        .and_then(Value::as_array)
        .ok_or_else(|| BenchError::decode("invocation is missing its params"))?;
    let arguments = params
        .iter()
        .map(|param| {
            param
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| BenchError::decode("invocation param is not a string"))
        })
        .collect::<BenchResult<Vec<_>>>()?;

    Ok(Invocation {
        kind,
        invocation_id: invocation_id.to_string(),
        target: target.to_string(),
        arguments,
        non_blocking: false,
    })
}

fn encode_body(invocation_id: &str, target: &str, arguments: &[String]) -> BenchResult<Vec<u8>> {
    let params = Value::Array(
        arguments
            .iter()
            .map(|argument| Value::from(argument.as_str()))
            .collect(),
    );
    let value = Value::Array(vec![
        Value::from(INVOCATION_MESSAGE_TYPE),
        Value::from(invocation_id),
        Value::from(target),
        params,
    ]);
    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &value)
        .map_err(|err| BenchError::send(format!("failed to encode msgpack invocation: {}", err)))?;
    Ok(body)
}

/// Encodes a type-1 invocation as a varint-prefixed binary frame.
pub fn invocation_frame(
    invocation_id: &str,
    target: &str,
    arguments: &[String],
) -> BenchResult<Message> {
    let body = encode_body(invocation_id, target, arguments)?;
    let mut frame = encode_length(body.len());
    frame.extend_from_slice(&body);
    Ok(Message::Binary(frame))
}

/// One-shot request frame for the join/leave-group verbs.
pub fn group_request(target: &str, group_name: &str) -> BenchResult<Message> {
    if target.is_empty() {
        return Err(BenchError::send("no group target configured"));
    }
    invocation_frame("0", target, &[group_name.to_string(), "perf".to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for n in [0usize, 1, 3, 127, 128, 300, 16_383, 16_384, (1 << 28) - 1] {
            let encoded = encode_length(n);
            let (decoded, consumed) = decode_length(&encoded).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn varint_encoded_lengths() {
        assert_eq!(encode_length(0), vec![0]);
        assert_eq!(encode_length(127).len(), 1);
        assert_eq!(encode_length(128).len(), 2);
        assert_eq!(encode_length(16_383).len(), 2);
        assert_eq!(encode_length(16_384).len(), 3);
        assert_eq!(encode_length((1 << 28) - 1).len(), 4);
    }

    #[test]
    fn truncated_payload_is_a_framing_error() {
        let mut frame = encode_length(10);
        frame.extend_from_slice(&[1, 2, 3]);
        assert!(split_messages(&frame).is_err());
    }

    #[test]
    fn invocation_round_trip() {
        let arguments = vec!["client1".to_string(), "123456789".to_string()];
        let Message::Binary(frame) = invocation_frame("5", "echo", &arguments).unwrap() else {
            panic!("expected binary frame");
        };
        let payloads = split_messages(&frame).unwrap();
        assert_eq!(payloads.len(), 1);

        let invocation = decode_invocation(payloads[0]).unwrap();
        assert_eq!(invocation.kind, 1);
        assert_eq!(invocation.invocation_id, "5");
        assert_eq!(invocation.target, "echo");
        assert_eq!(invocation.arguments, arguments);
    }

    #[test]
    fn two_concatenated_messages_split() {
        let Message::Binary(mut frame) =
            invocation_frame("1", "echo", &["a".to_string(), "1".to_string()]).unwrap()
        else {
            panic!("expected binary frame");
        };
        let Message::Binary(second) =
            invocation_frame("2", "echo", &["b".to_string(), "2".to_string()]).unwrap()
        else {
            panic!("expected binary frame");
        };
        frame.extend_from_slice(&second);

        let payloads = split_messages(&frame).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(decode_invocation(payloads[0]).unwrap().arguments[0], "a");
        assert_eq!(decode_invocation(payloads[1]).unwrap().arguments[0], "b");
    }

    #[test]
    fn non_invocation_type_stops_after_tag() {
        // A ping is a bare [6] array with no trailing fields.
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &Value::Array(vec![Value::from(6)])).unwrap();
        let invocation = decode_invocation(&body).unwrap();
        assert_eq!(invocation.kind, 6);
        assert!(invocation.arguments.is_empty());
    }
}
