pub mod connect;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::BenchConfig;
use crate::counter::{Counter, latency_bucket};
use crate::error::{BenchError, BenchResult};
use crate::protocol::{
    Flavor, INVOCATION_MESSAGE_TYPE, Invocation, MessageGenerator, json, msgpack, now_nanos,
    random_payload,
};
use crate::session::ReceivedMessage;
use connect::{Connector, Endpoint};
use pool::SessionPool;

/// Short random identifier for clients and groups.
pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// A named workload. Each variant selects a protocol flavor, a connect
/// strategy and its invocation targets; the pool management and receive
/// dispatch behavior is shared.
#[async_trait]
pub trait Subject: Send + Sync {
    fn name(&self) -> &str;

    async fn counters(&self) -> HashMap<String, i64>;

    async fn session_count(&self) -> usize;

    async fn ensure_connections(&self, count: usize, per_second: usize) -> BenchResult<()>;

    async fn send(&self, clients: usize, interval_ms: u64) -> BenchResult<()>;

    async fn group_send(&self, clients: usize, interval_ms: u64) -> BenchResult<()>;

    async fn join_group(&self, members_per_group: usize) -> BenchResult<()>;

    async fn leave_group(&self) -> BenchResult<()>;

    async fn clear(&self, prefix: &str) -> BenchResult<()>;
}

/// Static description of one SignalR workload variant. An empty group
/// target means the variant has no group semantics; no frame is ever
/// built for an empty target.
#[derive(Debug, Clone, Copy)]
pub struct SubjectProfile {
    pub name: &'static str,
    pub flavor: Flavor,
    pub endpoint: Endpoint,
    pub latency_target: &'static str,
    pub join_group_target: &'static str,
    pub leave_group_target: &'static str,
}

impl SubjectProfile {
    fn has_group_semantics(&self) -> bool {
        !self.join_group_target.is_empty()
    }
}

const PROFILES: &[SubjectProfile] = &[
    SubjectProfile {
        name: "SignalrCoreJsonEcho",
        flavor: Flavor::Json,
        endpoint: Endpoint::CoreDirect,
        latency_target: "echo",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrCoreJsonBroadcast",
        flavor: Flavor::Json,
        endpoint: Endpoint::CoreDirect,
        latency_target: "broadcastMessage",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrCoreMsgpackEcho",
        flavor: Flavor::Msgpack,
        endpoint: Endpoint::CoreDirect,
        latency_target: "echo",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrCoreMsgpackBroadcast",
        flavor: Flavor::Msgpack,
        endpoint: Endpoint::CoreDirect,
        latency_target: "broadcastMessage",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrServiceJsonEcho",
        flavor: Flavor::Json,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "echo",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrServiceJsonBroadcast",
        flavor: Flavor::Json,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "broadcastMessage",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrServiceJsonGroupBroadcast",
        flavor: Flavor::Json,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "SendToGroup",
        join_group_target: "JoinGroup",
        leave_group_target: "LeaveGroup",
    },
    SubjectProfile {
        name: "SignalrServiceMsgpackEcho",
        flavor: Flavor::Msgpack,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "echo",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrServiceMsgpackBroadcast",
        flavor: Flavor::Msgpack,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "broadcastMessage",
        join_group_target: "",
        leave_group_target: "",
    },
    SubjectProfile {
        name: "SignalrServiceMsgpackGroupBroadcast",
        flavor: Flavor::Msgpack,
        endpoint: Endpoint::ServiceNegotiate,
        latency_target: "SendToGroup",
        join_group_target: "JoinGroup",
        leave_group_target: "LeaveGroup",
    },
];

/// Builds the subject named by the configuration.
pub fn build(config: &BenchConfig) -> BenchResult<Arc<dyn Subject>> {
    match config.subject.as_str() {
        "Dummy" => Ok(Arc::new(DummySubject)),
        "TlsConnect" => Ok(Arc::new(TlsSubject::new(config))),
        name => {
            let profile = PROFILES
                .iter()
                .find(|profile| profile.name == name)
                .ok_or_else(|| BenchError::config(format!("unknown test subject: {}", name)))?;
            Ok(SignalrSubject::start(*profile, config))
        }
    }
}

/// All SignalR variants share this runtime: a session pool, a counter and
/// a dispatch task draining the shared receive channel.
pub struct SignalrSubject {
    profile: SubjectProfile,
    counter: Arc<Counter>,
    pool: SessionPool,
    connector: Connector,
    send_size: usize,
}

impl SignalrSubject {
    fn start(profile: SubjectProfile, config: &BenchConfig) -> Arc<Self> {
        let counter = Arc::new(Counter::new());
        let (received_tx, received_rx) = mpsc::channel(4096);
        let pool = SessionPool::new(received_tx, Arc::clone(&counter));
        let connector = Connector::new(
            config.host.clone(),
            config.use_wss,
            profile.endpoint,
            profile.flavor,
        );

        let mut classifiers = vec![Classifier::Latency];
        if profile.has_group_semantics() {
            classifiers.push(Classifier::GroupMembership);
        }
        let context = ClassifierContext {
            counter: Arc::clone(&counter),
            latency_target: profile.latency_target.to_string(),
            join_group_target: profile.join_group_target.to_string(),
            leave_group_target: profile.leave_group_target.to_string(),
            classifiers,
        };
        tokio::spawn(dispatch_loop(received_rx, profile.flavor, context));

        Arc::new(Self {
            profile,
            counter,
            pool,
            connector,
            send_size: config.send_size,
        })
    }

    fn make_payload(&self) -> Option<String> {
        (self.send_size > 0).then(|| random_payload(self.send_size))
    }

    fn group_frame(&self, target: &str, group: &str) -> BenchResult<tokio_tungstenite::tungstenite::protocol::Message> {
        match self.profile.flavor {
            Flavor::Json => json::group_request(target, group),
            Flavor::Msgpack => msgpack::group_request(target, group),
        }
    }
}

#[async_trait]
impl Subject for SignalrSubject {
    fn name(&self) -> &str {
        self.profile.name
    }

    async fn counters(&self) -> HashMap<String, i64> {
        self.counter.snapshot().await
    }

    async fn session_count(&self) -> usize {
        self.pool.len().await
    }

    async fn ensure_connections(&self, count: usize, per_second: usize) -> BenchResult<()> {
        self.pool
            .ensure_connections(count, per_second, &self.connector)
            .await
    }

    async fn send(&self, clients: usize, interval_ms: u64) -> BenchResult<()> {
        if self.profile.has_group_semantics() {
            // Group workloads send through group_send only.
            return Ok(());
        }
        let flavor = self.profile.flavor;
        let target = self.profile.latency_target;
        let interval = Duration::from_millis(interval_ms);
        self.pool
            .install_generators(clients, |_session| {
                MessageGenerator::echo(flavor, target, interval, self.make_payload())
            })
            .await
    }

    async fn group_send(&self, clients: usize, interval_ms: u64) -> BenchResult<()> {
        if !self.profile.has_group_semantics() {
            return Ok(());
        }
        let flavor = self.profile.flavor;
        let target = self.profile.latency_target;
        let interval = Duration::from_millis(interval_ms);
        self.pool
            .install_generators(clients, |session| {
                MessageGenerator::group(
                    flavor,
                    target,
                    interval,
                    session.group_name.clone().unwrap_or_default(),
                )
            })
            .await
    }

    async fn join_group(&self, members_per_group: usize) -> BenchResult<()> {
        if !self.profile.has_group_semantics() {
            return Ok(());
        }
        let target = self.profile.join_group_target;
        self.pool
            .join_groups(members_per_group, |group| self.group_frame(target, group))
            .await
    }

    async fn leave_group(&self) -> BenchResult<()> {
        if !self.profile.has_group_semantics() {
            return Ok(());
        }
        let target = self.profile.leave_group_target;
        self.pool
            .leave_groups(|group| self.group_frame(target, group))
            .await
    }

    async fn clear(&self, prefix: &str) -> BenchResult<()> {
        self.counter.clear(prefix).await;
        Ok(())
    }
}

enum Classifier {
    Latency,
    GroupMembership,
}

struct ClassifierContext {
    counter: Arc<Counter>,
    latency_target: String,
    join_group_target: String,
    leave_group_target: String,
    classifiers: Vec<Classifier>,
}

impl ClassifierContext {
    async fn classify(&self, invocation: &Invocation, recv_size: i64) {
        for classifier in &self.classifiers {
            if self.run(classifier, invocation, recv_size).await {
                break;
            }
        }
    }

    /// Returns true only when the classifier consumed the message; decode
    /// failures record `message:decode_error` and let later classifiers
    /// run.
    async fn run(&self, classifier: &Classifier, invocation: &Invocation, recv_size: i64) -> bool {
        match classifier {
            Classifier::Latency => {
                if invocation.target != self.latency_target {
                    return false;
                }
                let Some(send_start) = invocation
                    .arguments
                    .get(1)
                    .and_then(|raw| raw.parse::<i64>().ok())
                else {
                    debug!(target = %invocation.target, "failed to decode start timestamp");
                    self.counter.stat("message:decode_error", 1).await;
                    return false;
                };
                self.counter.stat("message:received", 1).await;
                self.counter.stat("message:recvSize", recv_size).await;
                let latency_ms = (now_nanos() - send_start) / 1_000_000;
                self.counter
                    .stat(latency_bucket("message", latency_ms), 1)
                    .await;
                true
            }
            Classifier::GroupMembership => {
                if invocation.target == self.join_group_target {
                    self.counter.stat("connection:groupjoin", 1).await;
                    true
                } else if invocation.target == self.leave_group_target {
                    self.counter.stat("connection:groupjoin", -1).await;
                    true
                } else {
                    false
                }
            }
        }
    }
}

async fn dispatch_loop(
    mut received: mpsc::Receiver<ReceivedMessage>,
    flavor: Flavor,
    context: ClassifierContext,
) {
    while let Some(message) = received.recv().await {
        match flavor {
            Flavor::Json => dispatch_json(&context, &message).await,
            Flavor::Msgpack => dispatch_msgpack(&context, &message).await,
        }
    }
}

async fn dispatch_json(context: &ClassifierContext, message: &ReceivedMessage) {
    for piece in json::split_messages(&message.content) {
        let kind = match json::decode_kind(piece) {
            Ok(kind) => kind,
            Err(err) => {
                debug!(client = %message.client_id, error = %err, "failed to decode message header");
                context.counter.stat("message:decode_error", 1).await;
                continue;
            }
        };
        if kind != INVOCATION_MESSAGE_TYPE {
            continue;
        }
        match json::decode_invocation(piece) {
            Ok(invocation) => context.classify(&invocation, piece.len() as i64).await,
            Err(err) => {
                debug!(client = %message.client_id, error = %err, "failed to decode invocation");
                context.counter.stat("message:decode_error", 1).await;
            }
        }
    }
}

async fn dispatch_msgpack(context: &ClassifierContext, message: &ReceivedMessage) {
    let payloads = match msgpack::split_messages(&message.content) {
        Ok(payloads) => payloads,
        Err(err) => {
            debug!(client = %message.client_id, error = %err, "failed to frame binary message");
            context.counter.stat("message:decode_error", 1).await;
            return;
        }
    };
    for payload in payloads {
        match msgpack::decode_invocation(payload) {
            Ok(invocation) if invocation.kind == INVOCATION_MESSAGE_TYPE => {
                context.classify(&invocation, payload.len() as i64).await;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(client = %message.client_id, error = %err, "failed to decode invocation");
                context.counter.stat("message:decode_error", 1).await;
            }
        }
    }
}

/// Raw TLS handshake benchmark; no WebSocket, no pool. Each call dials
/// `count` fresh connections at the requested rate and records handshake
/// latency under `tls:dial`.
pub struct TlsSubject {
    host: String,
    counter: Arc<Counter>,
}

impl TlsSubject {
    fn new(config: &BenchConfig) -> Self {
        Self {
            host: config.host.clone(),
            counter: Arc::new(Counter::new()),
        }
    }

    async fn dial_once(host: String, counter: Arc<Counter>) {
        let jitter = rand::thread_rng().gen_range(0..1000u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        counter.stat("tls:inprogress", 1).await;
        let started = tokio::time::Instant::now();
        match tls_dial(&host).await {
            Ok(()) => {
                counter.stat("tls:inprogress", -1).await;
                counter.stat("tls:connected", 1).await;
                let millis = started.elapsed().as_millis() as i64;
                counter.stat(latency_bucket("tls:dial", millis), 1).await;
            }
            Err(err) => {
                counter.stat("tls:inprogress", -1).await;
                counter.stat("tls:error", 1).await;
                warn!(error = %err, "failed to build connection");
            }
        }
    }
}

async fn tls_dial(host: &str) -> BenchResult<()> {
    let domain = host.split(':').next().unwrap_or(host);
    let tcp = tokio::net::TcpStream::connect(host).await?;
    let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
    connector
        .connect(domain, tcp)
        .await
        .map_err(|err| BenchError::connection(err.to_string()))?;
    Ok(())
}

#[async_trait]
impl Subject for TlsSubject {
    fn name(&self) -> &str {
        "TlsConnect"
    }

    async fn counters(&self) -> HashMap<String, i64> {
        self.counter.snapshot().await
    }

    async fn session_count(&self) -> usize {
        0
    }

    async fn ensure_connections(&self, count: usize, per_second: usize) -> BenchResult<()> {
        let per_second = per_second.max(1);
        let mut remaining = count;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while remaining > 0 {
            ticker.tick().await;
            let batch = remaining.min(per_second);
            let mut dials = JoinSet::new();
            for _ in 0..batch {
                dials.spawn(Self::dial_once(
                    self.host.clone(),
                    Arc::clone(&self.counter),
                ));
            }
            while dials.join_next().await.is_some() {}
            remaining -= batch;
        }
        Ok(())
    }

    async fn send(&self, _clients: usize, _interval_ms: u64) -> BenchResult<()> {
        Ok(())
    }

    async fn group_send(&self, _clients: usize, _interval_ms: u64) -> BenchResult<()> {
        Ok(())
    }

    async fn join_group(&self, _members_per_group: usize) -> BenchResult<()> {
        Ok(())
    }

    async fn leave_group(&self) -> BenchResult<()> {
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> BenchResult<()> {
        self.counter.clear(prefix).await;
        Ok(())
    }
}

/// Inert subject used to smoke-test the control plane.
pub struct DummySubject;

#[async_trait]
impl Subject for DummySubject {
    fn name(&self) -> &str {
        "Dummy"
    }

    async fn counters(&self) -> HashMap<String, i64> {
        HashMap::from([("counter1".to_string(), 100), ("counter2".to_string(), 50)])
    }

    async fn session_count(&self) -> usize {
        0
    }

    async fn ensure_connections(&self, _count: usize, _per_second: usize) -> BenchResult<()> {
        Ok(())
    }

    async fn send(&self, _clients: usize, _interval_ms: u64) -> BenchResult<()> {
        Ok(())
    }

    async fn group_send(&self, _clients: usize, _interval_ms: u64) -> BenchResult<()> {
        Ok(())
    }

    async fn join_group(&self, _members_per_group: usize) -> BenchResult<()> {
        Ok(())
    }

    async fn leave_group(&self) -> BenchResult<()> {
        Ok(())
    }

    async fn clear(&self, _prefix: &str) -> BenchResult<()> {
        Ok(())
    }
}
