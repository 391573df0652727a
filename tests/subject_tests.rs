use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

use websocket_bench::config::BenchConfig;
use websocket_bench::protocol::json;
use websocket_bench::subject;

/// Mock SUT that echoes every frame after the protocol-selection
/// handshake.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut negotiated = false;
                while let Some(Ok(frame)) = ws.next().await {
                    match frame {
                        Message::Text(text) => {
                            if !negotiated {
                                negotiated = true;
                                continue;
                            }
                            if ws.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Message::Binary(data) => {
                            if !negotiated {
                                negotiated = true;
                                continue;
                            }
                            if ws.send(Message::Binary(data)).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });
    addr
}

fn config_for(host: SocketAddr, subject: &str) -> BenchConfig {
    BenchConfig {
        host: host.to_string(),
        subject: subject.to_string(),
        ..BenchConfig::default()
    }
}

#[tokio::test]
async fn json_echo_round_trip_counts_latency() {
    let addr = start_echo_server().await;
    let subject = subject::build(&config_for(addr, "SignalrCoreJsonEcho")).unwrap();

    subject.ensure_connections(3, 3).await.unwrap();
    assert_eq!(subject.session_count().await, 3);
    let counters = subject.counters().await;
    assert_eq!(counters.get("connection:established"), Some(&3));
    assert_eq!(counters.get("connection:inprogress"), Some(&0));

    subject.send(2, 50).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    subject.send(0, 50).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counters = subject.counters().await;
    let sent = counters.get("message:sent").copied().unwrap_or(0);
    let received = counters.get("message:received").copied().unwrap_or(0);
    assert!(sent >= 4, "expected at least 4 sends, got {}", sent);
    assert!(received >= 2, "expected at least 2 echoes, got {}", received);
    assert!(received <= sent);

    let bucketed: i64 = counters
        .iter()
        .filter(|(name, _)| name.starts_with("message:lt:") || name.starts_with("message:ge:"))
        .map(|(_, value)| value)
        .sum();
    assert_eq!(bucketed, received);
    assert_eq!(counters.get("message:decode_error"), None);
}

#[tokio::test]
async fn msgpack_echo_round_trip_classifies_invocations() {
    let addr = start_echo_server().await;
    let subject = subject::build(&config_for(addr, "SignalrCoreMsgpackEcho")).unwrap();

    subject.ensure_connections(2, 2).await.unwrap();
    subject.send(2, 50).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    subject.send(0, 50).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counters = subject.counters().await;
    assert!(counters.get("message:received").copied().unwrap_or(0) >= 2);
    assert_eq!(counters.get("message:decode_error"), None);
}

#[tokio::test]
async fn ensure_connection_converges_and_drops_the_tail() {
    let addr = start_echo_server().await;
    let subject = subject::build(&config_for(addr, "SignalrCoreJsonEcho")).unwrap();

    subject.ensure_connections(4, 4).await.unwrap();
    assert_eq!(subject.session_count().await, 4);

    subject.ensure_connections(1, 1).await.unwrap();
    assert_eq!(subject.session_count().await, 1);

    // Growing again only dials the difference.
    subject.ensure_connections(2, 2).await.unwrap();
    assert_eq!(subject.session_count().await, 2);
    let counters = subject.counters().await;
    assert_eq!(counters.get("connection:established"), Some(&5));
}

#[tokio::test]
async fn dial_failures_do_not_count_against_the_pool() {
    // Nothing listens on this address; grab a port and release it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let subject = subject::build(&config_for(addr, "SignalrCoreJsonEcho")).unwrap();
    subject.ensure_connections(2, 2).await.unwrap();

    assert_eq!(subject.session_count().await, 0);
    let counters = subject.counters().await;
    assert_eq!(counters.get("connection:error"), Some(&2));
    assert_eq!(counters.get("connection:inprogress"), Some(&0));
}

/// Service-style mock: an HTTP `/negotiate` endpoint pointing at a
/// WebSocket server that records join/leave invocations and echoes them
/// back.
async fn start_group_server() -> (SocketAddr, Arc<Mutex<Vec<(String, String)>>>) {
    let recorded: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    let ws_recorded = Arc::clone(&recorded);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = ws_listener.accept().await else {
                return;
            };
            let recorded = Arc::clone(&ws_recorded);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut negotiated = false;
                while let Some(Ok(frame)) = ws.next().await {
                    let Message::Text(text) = frame else {
                        continue;
                    };
                    if !negotiated {
                        negotiated = true;
                        continue;
                    }
                    for piece in json::split_messages(text.as_bytes()) {
                        let invocation = json::decode_invocation(piece).unwrap();
                        recorded.lock().await.push((
                            invocation.target.clone(),
                            invocation.arguments.first().cloned().unwrap_or_default(),
                        ));
                    }
                    if ws.send(Message::Text(text.clone())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let negotiate = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    negotiate.set_nonblocking(true).unwrap();
    let negotiate_addr = negotiate.local_addr().unwrap();
    let router = Router::new().route(
        "/negotiate",
        get(move || async move {
            Json(serde_json::json!({
                "url": format!("http://{}/client/?hub=bench", ws_addr),
                "accessToken": "test-token",
            }))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::Server::from_tcp(negotiate)
            .unwrap()
            .serve(router.into_make_service())
            .await;
    });

    (negotiate_addr, recorded)
}

#[tokio::test]
async fn join_group_forms_blocks_and_leave_group_undoes_them() {
    let (addr, recorded) = start_group_server().await;
    let subject =
        subject::build(&config_for(addr, "SignalrServiceJsonGroupBroadcast")).unwrap();

    subject.ensure_connections(4, 4).await.unwrap();
    assert_eq!(subject.session_count().await, 4);

    subject.join_group(2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let joins = recorded.lock().await;
        assert_eq!(joins.len(), 4);
        let mut members_per_group: HashMap<&str, usize> = HashMap::new();
        for (target, group) in joins.iter() {
            assert_eq!(target, "JoinGroup");
            assert!(!group.is_empty());
            *members_per_group.entry(group.as_str()).or_insert(0) += 1;
        }
        let groups: HashSet<_> = members_per_group.keys().collect();
        assert_eq!(groups.len(), 2);
        assert!(members_per_group.values().all(|count| *count == 2));
    }

    // Join confirmations were echoed back and classified.
    let counters = subject.counters().await;
    assert_eq!(counters.get("connection:groupjoin"), Some(&4));

    recorded.lock().await.clear();
    subject.leave_group().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let leaves = recorded.lock().await;
    assert_eq!(leaves.len(), 4);
    assert!(leaves.iter().all(|(target, _)| target == "LeaveGroup"));
    drop(leaves);

    let counters = subject.counters().await;
    assert_eq!(counters.get("connection:groupjoin"), Some(&0));
}

#[tokio::test]
async fn second_send_supersedes_the_first() {
    let addr = start_echo_server().await;
    let subject = subject::build(&config_for(addr, "SignalrCoreJsonEcho")).unwrap();
    subject.ensure_connections(3, 3).await.unwrap();

    subject.send(3, 40).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Reinstall on a single session, then measure a quiet window: only
    // one generator may be pacing.
    subject.send(1, 100).await.unwrap();
    subject.clear("message").await.unwrap();
    tokio::time::sleep(Duration::from_millis(650)).await;

    let counters = subject.counters().await;
    let sent = counters.get("message:sent").copied().unwrap_or(0);
    assert!(sent >= 1, "one generator should still be pacing");
    // Two leaked generators would roughly double this; a lone 100ms
    // generator stays well under the bound even with scheduling jitter.
    assert!(
        sent <= 12,
        "more sends than a single 100ms generator could produce: {}",
        sent
    );
}
