use rand::Rng;

use websocket_bench::counter::latency_bucket;
use websocket_bench::protocol::{Invocation, json, msgpack};

#[test]
fn varint_round_trips_across_the_encodable_range() {
    let mut samples: Vec<usize> = vec![0, 1, 2, 127, 128, 129, 16_383, 16_384, (1 << 21) - 1];
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        samples.push(rng.gen_range(0..(1usize << 28)));
    }

    for n in samples {
        let encoded = msgpack::encode_length(n);
        let bits = (usize::BITS - n.leading_zeros()) as usize;
        let expected_len = if n == 0 { 1 } else { (bits + 6) / 7 };
        assert_eq!(encoded.len(), expected_len, "length of encode({})", n);

        let (decoded, consumed) = msgpack::decode_length(&encoded).unwrap();
        assert_eq!(decoded, n);
        assert_eq!(consumed, encoded.len());
    }
}

#[test]
fn decoding_zero_consumes_one_byte() {
    let (length, consumed) = msgpack::decode_length(&[0]).unwrap();
    assert_eq!(length, 0);
    assert_eq!(consumed, 1);
}

#[test]
fn json_frame_splitting_classifies_in_order_and_skips_noise() {
    let a = serde_json::json!({
        "type": 1, "invocationId": "1", "target": "echo",
        "arguments": ["a", "100"], "nonBlocking": false,
    })
    .to_string();
    let b = serde_json::json!({
        "type": 1, "invocationId": "2", "target": "echo",
        "arguments": ["b", "200"], "nonBlocking": false,
    })
    .to_string();
    let ping = r#"{"type":6}"#;

    // a + ping + empty segment + b, all in one physical frame.
    let buffer = format!("{}\u{1e}{}\u{1e}\u{1e}{}\u{1e}", a, ping, b);

    let mut invocations: Vec<Invocation> = Vec::new();
    for piece in json::split_messages(buffer.as_bytes()) {
        if json::decode_kind(piece).unwrap() != 1 {
            continue;
        }
        invocations.push(json::decode_invocation(piece).unwrap());
    }

    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].arguments[0], "a");
    assert_eq!(invocations[1].arguments[0], "b");
}

#[test]
fn msgpack_concatenated_invocations_both_decode() {
    let first = msgpack::invocation_frame("1", "echo", &["a".to_string(), "100".to_string()])
        .unwrap()
        .into_data();
    let second = msgpack::invocation_frame("2", "echo", &["b".to_string(), "200".to_string()])
        .unwrap()
        .into_data();

    let mut buffer = first;
    buffer.extend_from_slice(&second);

    let payloads = msgpack::split_messages(&buffer).unwrap();
    assert_eq!(payloads.len(), 2);
    let invocations: Vec<Invocation> = payloads
        .iter()
        .map(|payload| msgpack::decode_invocation(payload).unwrap())
        .collect();
    assert_eq!(invocations[0].arguments, vec!["a", "100"]);
    assert_eq!(invocations[1].arguments, vec!["b", "200"]);
}

#[test]
fn latency_buckets_match_the_fixed_grid() {
    let cases = [
        (0, "message:lt:100"),
        (99, "message:lt:100"),
        (100, "message:lt:200"),
        (550, "message:lt:600"),
        (999, "message:lt:1000"),
        (1000, "message:ge:1000"),
        (999_999, "message:ge:1000"),
    ];
    for (latency, expected) in cases {
        assert_eq!(latency_bucket("message", latency), expected);
    }
}
