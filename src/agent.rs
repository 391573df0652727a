use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{BenchError, BenchResult};
use crate::metrics;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::subject::{self, Subject};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Local command executor. Owns exactly one subject, chosen when the
/// controller replicates its configuration through `Setup`.
pub struct Agent {
    role: String,
    subject: RwLock<Option<Arc<dyn Subject>>>,
}

impl Agent {
    pub fn new(role: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            role: role.into(),
            subject: RwLock::new(None),
        })
    }

    /// Server mode: accepts RPC connections and serves each one on its own
    /// task; calls within a connection are answered serially.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> BenchResult<()> {
        info!(role = %self.role, addr = %listener.local_addr()?, "agent listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(peer = %peer, "controller connected");
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                agent.serve_connection(stream).await;
            });
        }
    }

    /// Reverse mode: dials the forwarder and serves RPC over the tunnel,
    /// reconnecting with a fixed backoff when it drops.
    pub async fn serve_reverse(self: Arc<Self>, forwarder_addr: String) -> BenchResult<()> {
        info!(role = %self.role, forwarder = %forwarder_addr, "agent dialing forwarder");
        loop {
            match TcpStream::connect(&forwarder_addr).await {
                Ok(stream) => {
                    info!(forwarder = %forwarder_addr, "tunnel established");
                    self.serve_connection(stream).await;
                    warn!(forwarder = %forwarder_addr, "tunnel closed, reconnecting");
                }
                Err(err) => {
                    warn!(forwarder = %forwarder_addr, error = %err, "failed to reach forwarder");
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn serve_connection(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }

            let response = match serde_json::from_str::<RpcRequest>(line.trim_end()) {
                Ok(request) => self.handle(request).await,
                Err(err) => RpcResponse::failure(format!("malformed request: {}", err)),
            };
            let mut encoded = match serde_json::to_string(&response) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(error = %err, "failed to encode response");
                    return;
                }
            };
            encoded.push('\n');
            if write_half.write_all(encoded.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Setup { config } => match subject::build(&config) {
                Ok(built) => {
                    info!(subject = %built.name(), host = %config.host, "agent set up");
                    *self.subject.write().await = Some(built);
                    RpcResponse::ok()
                }
                Err(err) => RpcResponse::failure(err.to_string()),
            },
            RpcRequest::Invoke { command, arguments } => {
                match self.invoke(&command, &arguments).await {
                    Ok(()) => RpcResponse::ok(),
                    Err(err) => RpcResponse::failure(err.to_string()),
                }
            }
            RpcRequest::CollectCounters => match self.subject().await {
                Ok(active) => RpcResponse::with_data(json!(active.counters().await)),
                Err(err) => RpcResponse::failure(err.to_string()),
            },
            RpcRequest::CollectMetrics { collect_processes } => {
                let collected = metrics::collect(&collect_processes).await;
                match serde_json::to_value(collected) {
                    Ok(data) => RpcResponse::with_data(data),
                    Err(err) => RpcResponse::failure(err.to_string()),
                }
            }
        }
    }

    async fn subject(&self) -> BenchResult<Arc<dyn Subject>> {
        self.subject
            .read()
            .await
            .clone()
            .ok_or_else(|| BenchError::invalid_command("agent is not set up"))
    }

    async fn invoke(&self, command: &str, arguments: &[String]) -> BenchResult<()> {
        let active = self.subject().await?;
        match command {
            "EnsureConnection" => {
                let count = parse_arg(arguments, 0, None)?;
                let per_second = parse_arg(arguments, 1, Some(usize::MAX))?;
                active.ensure_connections(count, per_second).await
            }
            "Send" => {
                let clients = parse_arg(arguments, 0, None)?;
                let interval = parse_arg(arguments, 1, Some(1000))?;
                active.send(clients, interval as u64).await
            }
            "GroupSend" => {
                let clients = parse_arg(arguments, 0, None)?;
                let interval = parse_arg(arguments, 1, Some(1000))?;
                active.group_send(clients, interval as u64).await
            }
            "JoinGroup" => {
                let members = parse_arg(arguments, 0, None)?;
                active.join_group(members).await
            }
            "LeaveGroup" => active.leave_group().await,
            "Clear" => {
                let prefix = arguments.first().map(String::as_str).unwrap_or("");
                active.clear(prefix).await
            }
            other => Err(BenchError::invalid_command(format!(
                "unknown command: {}",
                other
            ))),
        }
    }
}

fn parse_arg(arguments: &[String], index: usize, default: Option<usize>) -> BenchResult<usize> {
    match arguments.get(index) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BenchError::invalid_command(format!("bad numeric argument: {}", raw))),
        None => {
            default.ok_or_else(|| BenchError::invalid_command("missing numeric argument"))
        }
    }
}
