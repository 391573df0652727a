use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{BenchError, BenchResult};

type TunnelAddrs = Arc<RwLock<BTreeSet<String>>>;

/// Reverse-tunnel hub for NATed agents. Every agent connection gets its
/// own ephemeral local listener; the first local dialer is bridged
/// byte-for-byte to the tunneled agent. The forwarder never interprets
/// the RPC payload.
pub struct Forwarder {
    tunnel_addrs: TunnelAddrs,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            tunnel_addrs: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Binds the public and management listeners, serving both on
    /// background tasks, and returns the bound addresses.
    pub async fn start(
        &self,
        public_addr: &str,
        management_addr: &str,
    ) -> BenchResult<(SocketAddr, SocketAddr)> {
        let public = TcpListener::bind(public_addr).await?;
        let public_local = public.local_addr()?;

        let management = std::net::TcpListener::bind(management_addr)?;
        management.set_nonblocking(true)?;
        let management_local = management.local_addr()?;

        let router = Router::new()
            .route("/agents", get(list_agents))
            .with_state(self.tunnel_addrs.clone());
        let server = axum::Server::from_tcp(management)
            .map_err(|err| BenchError::config(err.to_string()))?
            .serve(router.into_make_service());
        tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(error = %err, "management endpoint failed");
            }
        });

        info!(public = %public_local, management = %management_local, "forwarder listening");

        let tunnel_addrs = self.tunnel_addrs.clone();
        tokio::spawn(async move {
            loop {
                match public.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_agent_connection(
                            stream,
                            peer,
                            tunnel_addrs.clone(),
                        ));
                    }
                    Err(err) => warn!(error = %err, "failed to accept agent connection"),
                }
            }
        });

        Ok((public_local, management_local))
    }

    /// Runs the forwarder until the process exits.
    pub async fn run(&self, public_addr: &str, management_addr: &str) -> BenchResult<()> {
        self.start(public_addr, management_addr).await?;
        let () = std::future::pending().await;
        Ok(())
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

async fn list_agents(State(tunnel_addrs): State<TunnelAddrs>) -> String {
    let addrs = tunnel_addrs.read().await;
    addrs.iter().map(|addr| format!("{}\n", addr)).collect()
}

async fn handle_agent_connection(agent_conn: TcpStream, peer: SocketAddr, addrs: TunnelAddrs) {
    let local = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => {
            error!(peer = %peer, error = %err, "failed to open local listener");
            return;
        }
    };
    let local_addr = match local.local_addr() {
        Ok(addr) => addr.to_string(),
        Err(err) => {
            error!(peer = %peer, error = %err, "failed to read local listener address");
            return;
        }
    };

    info!("forwarding {} -> {}", local_addr, peer);
    addrs.write().await.insert(local_addr.clone());

    bridge(agent_conn, local).await;

    addrs.write().await.remove(&local_addr);
    info!("stop forwarding {} -> {}", local_addr, peer);
}

/// Waits for the first local dialer and copies bytes both ways until
/// either side closes. If the tunnel drops before a dialer shows up the
/// listener is abandoned.
async fn bridge(mut agent_conn: TcpStream, local: TcpListener) {
    let mut probe = [0u8; 1];
    let mut dialer = tokio::select! {
        accepted = local.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(_) => return,
        },
        peeked = agent_conn.peek(&mut probe) => match peeked {
            Ok(0) | Err(_) => return,
            // The agent spoke before any dialer arrived; buffered bytes
            // are delivered once the bridge is up.
            Ok(_) => match local.accept().await {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        },
    };

    info!(
        "established connection {} - {}",
        dialer.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        agent_conn.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
    );
    let _ = tokio::io::copy_bidirectional(&mut agent_conn, &mut dialer).await;
}
