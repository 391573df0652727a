use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::counter::Counter;
use crate::error::{BenchError, BenchResult};
use crate::protocol::MessageGenerator;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A frame received by a session, tagged with its client id, delivered on
/// the owning subject's shared channel.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub client_id: String,
    pub content: Vec<u8>,
}

enum SessionCommand {
    Install(MessageGenerator),
    Remove,
    Write(Message),
    Close,
}

/// One live WebSocket connection: a reader task forwarding every frame to
/// the subject, and a writer task that owns the sink.
///
/// All writes (paced generator ticks, one-shot group frames, the close
/// handshake) funnel through the writer's command channel, so outbound
/// frames are serialized and a generator swap can never corrupt an
/// in-flight send. Removing the generator stops pacing without tearing
/// down the socket.
pub struct Session {
    pub id: String,
    pub group_name: Option<String>,
    commands: mpsc::Sender<SessionCommand>,
}

impl Session {
    pub fn start(
        id: String,
        stream: WsStream,
        received: mpsc::Sender<ReceivedMessage>,
        counter: Arc<Counter>,
    ) -> Self {
        let (sink, source) = stream.split();
        let (commands, command_rx) = mpsc::channel(16);

        tokio::spawn(reader_loop(
            source,
            id.clone(),
            received,
            Arc::clone(&counter),
        ));
        tokio::spawn(writer_loop(sink, command_rx, id.clone(), counter));

        Self {
            id,
            group_name: None,
            commands,
        }
    }

    /// Sends the SignalR protocol-selection frame.
    pub async fn negotiate_protocol(&self, protocol: &str) -> BenchResult<()> {
        self.write_message(crate::protocol::protocol_selection_frame(protocol))
            .await
    }

    /// Installs `generator` as the active message generator; the writer
    /// starts pacing at its interval on the next tick.
    pub async fn install_generator(&self, generator: MessageGenerator) {
        let _ = self
            .commands
            .send(SessionCommand::Install(generator))
            .await;
    }

    /// Removes the active generator; pacing stops, the connection stays up.
    pub async fn remove_generator(&self) {
        let _ = self.commands.send(SessionCommand::Remove).await;
    }

    /// Enqueues one opportunistic frame (join/leave group).
    pub async fn write_message(&self, message: Message) -> BenchResult<()> {
        self.commands
            .send(SessionCommand::Write(message))
            .await
            .map_err(|_| BenchError::send(format!("session {} is closed", self.id)))
    }

    /// Initiates an orderly shutdown.
    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }
}

async fn reader_loop(
    mut source: WsSource,
    client_id: String,
    received: mpsc::Sender<ReceivedMessage>,
    counter: Arc<Counter>,
) {
    while let Some(next) = source.next().await {
        match next {
            Ok(Message::Text(text)) => {
                let message = ReceivedMessage {
                    client_id: client_id.clone(),
                    content: text.into_bytes(),
                };
                if received.send(message).await.is_err() {
                    return;
                }
            }
            Ok(Message::Binary(content)) => {
                let message = ReceivedMessage {
                    client_id: client_id.clone(),
                    content,
                };
                if received.send(message).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                counter.stat("connection:closed", 1).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(client = %client_id, error = %err, "session read failed");
                counter.stat("connection:error", 1).await;
                return;
            }
        }
    }
    counter.stat("connection:closed", 1).await;
}

async fn writer_loop(
    mut sink: WsSink,
    mut commands: mpsc::Receiver<SessionCommand>,
    client_id: String,
    counter: Arc<Counter>,
) {
    let mut generator: Option<MessageGenerator> = None;
    let mut ticker: Option<Interval> = None;

    loop {
        let command = match ticker.as_mut() {
            Some(tick) => {
                tokio::select! {
                    command = commands.recv() => command,
                    _ = tick.tick() => {
                        let Some(active) = generator.as_mut() else {
                            continue;
                        };
                        match active.generate(&client_id) {
                            Ok(message) => {
                                if sink.send(message).await.is_ok() {
                                    counter.stat("message:sent", 1).await;
                                } else {
                                    counter.stat("message:send_error", 1).await;
                                    return;
                                }
                            }
                            Err(err) => {
                                debug!(client = %client_id, error = %err, "failed to generate message");
                                counter.stat("message:send_error", 1).await;
                            }
                        }
                        continue;
                    }
                }
            }
            None => commands.recv().await,
        };

        match command {
            Some(SessionCommand::Install(next)) => {
                let period = next.interval();
                generator = Some(next);
                ticker = Some(tokio::time::interval_at(Instant::now() + period, period));
            }
            Some(SessionCommand::Remove) => {
                generator = None;
                ticker = None;
            }
            Some(SessionCommand::Write(message)) => {
                if sink.send(message).await.is_err() {
                    counter.stat("message:send_error", 1).await;
                    return;
                }
            }
            Some(SessionCommand::Close) | None => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Flavor;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn connect_pair() -> (WsStream, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let url = format!("ws://{}", addr);
        let (client, _) = tokio_tungstenite::client_async(url, MaybeTlsStream::Plain(tcp))
            .await
            .unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn paced_sending_starts_and_stops_with_generator() {
        let (client, mut server) = connect_pair().await;
        let counter = Arc::new(Counter::new());
        let (received_tx, _received_rx) = mpsc::channel(16);

        let session = Session::start(
            "c1".to_string(),
            client,
            received_tx,
            Arc::clone(&counter),
        );
        session
            .install_generator(MessageGenerator::echo(
                Flavor::Json,
                "echo",
                Duration::from_millis(20),
                None,
            ))
            .await;

        // Two paced frames arrive on the server side.
        for _ in 0..2 {
            let frame = server.next().await.unwrap().unwrap();
            assert!(matches!(frame, Message::Text(_)));
        }

        session.remove_generator().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent_before = counter.snapshot().await.get("message:sent").copied();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent_after = counter.snapshot().await.get("message:sent").copied();
        assert_eq!(sent_before, sent_after);

        session.close().await;
    }

    #[tokio::test]
    async fn received_frames_are_tagged_with_client_id() {
        let (client, mut server) = connect_pair().await;
        let counter = Arc::new(Counter::new());
        let (received_tx, mut received_rx) = mpsc::channel(16);

        let _session = Session::start(
            "c7".to_string(),
            client,
            received_tx,
            Arc::clone(&counter),
        );
        server
            .send(Message::Text("hello".to_string()))
            .await
            .unwrap();

        let message = received_rx.recv().await.unwrap();
        assert_eq!(message.client_id, "c7");
        assert_eq!(message.content, b"hello");
    }
}
