use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::counter::{Counter, latency_bucket};
use crate::error::{BenchError, BenchResult};
use crate::protocol::Flavor;
use crate::session::{ReceivedMessage, Session, WsStream};
use crate::subject::short_id;

/// How a subject reaches the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Dial `ws(s)://host` directly.
    CoreDirect,
    /// `GET /negotiate` first, then dial the returned URL with its token.
    ServiceNegotiate,
}

#[derive(Debug, Deserialize)]
struct ServiceHandshake {
    url: String,
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Opens sessions against the configured endpoint and wires them to the
/// subject's receive channel.
#[derive(Clone)]
pub struct Connector {
    host: String,
    use_wss: bool,
    endpoint: Endpoint,
    flavor: Flavor,
    http: reqwest::Client,
}

impl Connector {
    pub fn new(host: String, use_wss: bool, endpoint: Endpoint, flavor: Flavor) -> Self {
        Self {
            host,
            use_wss,
            endpoint,
            flavor,
            http: reqwest::Client::new(),
        }
    }

    /// Dials one session. Failures land in `connection:error`; the
    /// in-progress gauge is balanced on both paths.
    pub async fn open(
        &self,
        received: mpsc::Sender<ReceivedMessage>,
        counter: Arc<Counter>,
    ) -> BenchResult<Session> {
        counter.stat("connection:inprogress", 1).await;
        match self.open_session(received, &counter).await {
            Ok(session) => {
                counter.stat("connection:inprogress", -1).await;
                counter.stat("connection:established", 1).await;
                Ok(session)
            }
            Err(err) => {
                counter.stat("connection:inprogress", -1).await;
                counter.stat("connection:error", 1).await;
                Err(err)
            }
        }
    }

    async fn open_session(
        &self,
        received: mpsc::Sender<ReceivedMessage>,
        counter: &Arc<Counter>,
    ) -> BenchResult<Session> {
        let stream = match self.endpoint {
            Endpoint::CoreDirect => {
                let ws_url = format!("{}://{}", self.scheme(), self.host);
                let tcp = dial(&ws_url).await?;
                let (stream, _) = tokio_tungstenite::client_async_tls(ws_url, tcp).await?;
                stream
            }
            Endpoint::ServiceNegotiate => self.negotiate_and_dial(counter).await?,
        };

        let session = Session::start(short_id(), stream, received, Arc::clone(counter));
        session
            .negotiate_protocol(self.flavor.protocol_name())
            .await?;
        Ok(session)
    }

    async fn negotiate_and_dial(&self, counter: &Arc<Counter>) -> BenchResult<WsStream> {
        let negotiate_url = format!("http://{}/negotiate", self.host);
        let handshake: ServiceHandshake = self
            .http
            .get(&negotiate_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let ws_url = format!(
            "{}&access_token={}",
            rewrite_scheme(&handshake.url, self.use_wss),
            handshake.access_token
        );

        let started = Instant::now();
        let tcp = dial(&ws_url).await?;
        let dial_millis = started.elapsed().as_millis() as i64;
        counter
            .stat(latency_bucket("connection:dial", dial_millis), 1)
            .await;
        // Short-lived sockets at scale would otherwise exhaust the port
        // range sitting in TIME_WAIT.
        tcp.set_linger(Some(Duration::from_secs(0)))?;

        let (stream, _) = tokio_tungstenite::client_async_tls(ws_url, tcp).await?;
        Ok(stream)
    }

    fn scheme(&self) -> &'static str {
        if self.use_wss { "wss" } else { "ws" }
    }
}

async fn dial(ws_url: &str) -> BenchResult<TcpStream> {
    let parsed = Url::parse(ws_url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| BenchError::connection(format!("no host in url {}", ws_url)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| BenchError::connection(format!("no port in url {}", ws_url)))?;
    Ok(TcpStream::connect((host, port)).await?)
}

fn rewrite_scheme(url: &str, use_wss: bool) -> String {
    let ws = if use_wss { "wss://" } else { "ws://" };
    if let Some(rest) = url.strip_prefix("https://") {
        format!("{}{}", ws, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("{}{}", ws, rest)
    } else {
        url.to_string()
    }
}
