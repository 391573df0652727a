use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};
use crate::metrics::AgentMetrics;
use crate::rpc::{RpcClient, RpcRequest, RpcResponse};
use crate::snapshot::{AgentMetricsRecord, SnapshotWriter};

pub const AGENT_ROLE_CLIENT: &str = "client";

const COUNTER_FIELDS: [&str; 21] = [
    "connection:inprogress",
    "connection:established",
    "connection:closed",
    "connection:error",
    "connection:groupjoin",
    "message:lt:100",
    "message:lt:200",
    "message:lt:300",
    "message:lt:400",
    "message:lt:500",
    "message:lt:600",
    "message:lt:700",
    "message:lt:800",
    "message:lt:900",
    "message:lt:1000",
    "message:ge:1000",
    "message:sent",
    "message:received",
    "message:send_error",
    "message:receive_error",
    "message:decode_error",
];

/// Splits `total` across `agents` workers: agent `index` receives
/// `floor(total/agents)` plus one unit of the remainder when its index is
/// low enough, so the per-agent counts sum to `total` exactly and differ
/// by at most one.
pub fn split_number(total: usize, index: usize, agents: usize) -> usize {
    let base = total / agents;
    if index < total % agents { base + 1 } else { base }
}

/// The controller's view of one remote agent.
pub struct AgentProxy {
    pub name: String,
    pub address: String,
    client: RpcClient,
}

impl AgentProxy {
    pub async fn connect(address: &str) -> BenchResult<Self> {
        let name = address.split(':').next().unwrap_or(address).to_string();
        let client = RpcClient::connect(address).await?;
        Ok(Self {
            name,
            address: address.to_string(),
            client,
        })
    }

    async fn call(&self, request: &RpcRequest) -> BenchResult<RpcResponse> {
        self.client.call(request).await
    }
}

/// Orchestrates all registered agents: replicates the configuration,
/// scripts the scenario, scrapes counters/metrics and feeds the snapshot
/// writers. Watchers and waits subscribe to a controller-owned stop scope
/// that the Ctrl-C drain closes.
pub struct Controller {
    snapshot_writers: Vec<Arc<dyn SnapshotWriter>>,
    agents: Vec<AgentProxy>,
    agent_roles: HashMap<String, String>,
    collect_processes: Vec<String>,
    stop: broadcast::Sender<()>,
}

impl Controller {
    pub fn new(
        snapshot_writers: Vec<Arc<dyn SnapshotWriter>>,
        collect_processes: Vec<String>,
    ) -> Self {
        let (stop, _) = broadcast::channel(8);
        Self {
            snapshot_writers,
            agents: Vec::new(),
            agent_roles: HashMap::new(),
            collect_processes,
            stop,
        }
    }

    pub async fn register_agent(&mut self, address: &str, role: &str) -> BenchResult<()> {
        let proxy = AgentProxy::connect(address).await?;
        info!(agent = %proxy.name, address = %proxy.address, role = %role, "registered agent");
        self.agent_roles.insert(proxy.name.clone(), role.to_string());
        self.agents.push(proxy);
        Ok(())
    }

    fn client_agents(&self) -> Vec<&AgentProxy> {
        self.agents
            .iter()
            .filter(|proxy| {
                self.agent_roles.get(&proxy.name).map(String::as_str) == Some(AGENT_ROLE_CLIENT)
            })
            .collect()
    }

    pub async fn run(self: Arc<Self>, config: &BenchConfig) -> BenchResult<()> {
        self.setup_agents(config).await?;

        let controller = Arc::clone(&self);
        tokio::spawn(async move {
            shutdown_signal().await;
            println!("Handling Ctrl-C, draining agents");
            controller.drain().await;
            std::process::exit(1);
        });

        if config.cmd_file.is_empty() {
            Self::interactive_run(&self).await
        } else {
            Self::batch_run(&self, &config.cmd_file).await
        }
    }

    async fn setup_agents(&self, config: &BenchConfig) -> BenchResult<()> {
        let calls = self.agents.iter().map(|proxy| async move {
            let request = RpcRequest::Setup {
                config: config.clone(),
            };
            match proxy.call(&request).await {
                Ok(response) if response.success => Ok(()),
                Ok(response) => Err(BenchError::rpc(format!(
                    "agent {} refused setup: {}",
                    proxy.address,
                    response.error.unwrap_or_default()
                ))),
                Err(err) => Err(BenchError::rpc(format!(
                    "agent {} setup failed: {}",
                    proxy.address, err
                ))),
            }
        });
        for result in join_all(calls).await {
            result?;
        }
        Ok(())
    }

    async fn batch_run(controller: &Arc<Self>, cmd_file: &str) -> BenchResult<()> {
        let script = tokio::fs::read_to_string(cmd_file)
            .await
            .map_err(|_| BenchError::script(format!("failed to open {}", cmd_file)))?;
        for line in script.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if let Err(err) = Self::execute(controller, &parts).await {
                eprintln!("{}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn interactive_run(controller: &Arc<Self>) -> BenchResult<()> {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush().ok();
            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if let Err(err) = Self::execute(controller, &parts).await {
                println!("{}", err);
            }
        }
    }

    async fn execute(controller: &Arc<Self>, parts: &[&str]) -> BenchResult<()> {
        match parts[0] {
            "r" | "result" => {
                let counters = controller.collect_counters().await;
                controller.print_counters(&counters);
                Ok(())
            }
            "m" | "metrics" => {
                let metrics = controller.collect_metrics().await;
                print_metrics(&metrics);
                Ok(())
            }
            "v" => controller.clear_wait_dump(10).await,
            "c" | "EnsureConnection" => controller.connect_verb(parts).await,
            "s" | "Send" => controller.send_verb(parts, "Send").await,
            "gs" | "GroupSend" => controller.send_verb(parts, "GroupSend").await,
            "jg" | "JoinGroup" => controller.join_group_verb(parts).await,
            "lg" | "LeaveGroup" => {
                controller
                    .invoke_clients_uniform("LeaveGroup", Vec::new())
                    .await;
                Ok(())
            }
            "w" | "Wait" => controller.wait_verb(parts, true).await,
            "wc" | "WaitAndContinue" => controller.wait_verb(parts, false).await,
            "wr" | "WatchResult" => {
                Self::watch_counters(controller);
                Ok(())
            }
            "wm" | "WatchMetrics" => {
                Self::watch_metrics(controller);
                Ok(())
            }
            "cm" | "ClearMessage" => {
                controller
                    .invoke_all("Clear", vec!["message".to_string()])
                    .await;
                Ok(())
            }
            verb => {
                // Unknown verbs are forwarded to every agent verbatim.
                let arguments = parts[1..].iter().map(|part| part.to_string()).collect();
                controller.invoke_all(verb, arguments).await;
                Ok(())
            }
        }
    }

    async fn connect_verb(&self, parts: &[&str]) -> BenchResult<()> {
        if parts.len() < 2 || parts.len() > 3 {
            return Err(BenchError::script(
                "SYNTAX: c <connection_count> [connection_per_second]",
            ));
        }
        let count = parse_script_number(parts[1])?;
        let per_second = match parts.get(2) {
            Some(raw) => parse_script_number(raw)?,
            None => usize::MAX,
        };
        self.connect_fanout(count, per_second).await
    }

    async fn connect_fanout(&self, count: usize, per_second: usize) -> BenchResult<()> {
        let clients = self.client_agents();
        if clients.is_empty() {
            return Err(BenchError::script("no client agents registered"));
        }
        let calls = clients.iter().enumerate().map(|(index, proxy)| {
            let arguments = vec![
                split_number(count, index, clients.len()).to_string(),
                split_number(per_second, index, clients.len()).to_string(),
            ];
            invoke_agent(proxy, "EnsureConnection", arguments)
        });
        join_all(calls).await;
        Ok(())
    }

    async fn send_verb(&self, parts: &[&str], command: &str) -> BenchResult<()> {
        if parts.len() < 2 || parts.len() > 3 {
            return Err(BenchError::script("SYNTAX: s <clients> [interval_millis]"));
        }
        let clients = parse_script_number(parts[1])?;
        let interval = match parts.get(2) {
            Some(raw) => parse_script_number(raw)?,
            None => 1000,
        };
        self.send_fanout(command, clients, interval).await
    }

    async fn send_fanout(&self, command: &str, clients: usize, interval: usize) -> BenchResult<()> {
        let agents = self.client_agents();
        if agents.is_empty() {
            return Err(BenchError::script("no client agents registered"));
        }
        let calls = agents.iter().enumerate().map(|(index, proxy)| {
            let arguments = vec![
                split_number(clients, index, agents.len()).to_string(),
                interval.to_string(),
            ];
            invoke_agent(proxy, command, arguments)
        });
        join_all(calls).await;
        Ok(())
    }

    async fn join_group_verb(&self, parts: &[&str]) -> BenchResult<()> {
        if parts.len() != 2 {
            return Err(BenchError::script("SYNTAX: jg <members_per_group>"));
        }
        let members = parse_script_number(parts[1])?;
        self.invoke_clients_uniform("JoinGroup", vec![members.to_string()])
            .await;
        Ok(())
    }

    /// Sends the same invocation to every client-role agent in parallel.
    async fn invoke_clients_uniform(&self, command: &str, arguments: Vec<String>) {
        let calls = self
            .client_agents()
            .into_iter()
            .map(|proxy| invoke_agent(proxy, command, arguments.clone()))
            .collect::<Vec<_>>();
        join_all(calls).await;
    }

    /// Sends the same invocation to every agent regardless of role.
    async fn invoke_all(&self, command: &str, arguments: Vec<String>) {
        let calls = self
            .agents
            .iter()
            .map(|proxy| invoke_agent(proxy, command, arguments.clone()))
            .collect::<Vec<_>>();
        join_all(calls).await;
    }

    async fn wait_verb(&self, parts: &[&str], clear: bool) -> BenchResult<()> {
        if parts.len() != 2 {
            return Err(BenchError::script("SYNTAX: w <wait_time_seconds>"));
        }
        let seconds = parse_script_number(parts[1])?;
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds as u64)) => {
                println!("--- Finished after {} sec ---", seconds);
            }
            _ = stop.recv() => {
                println!("--- Stopped ---");
            }
        }
        if clear {
            self.drain().await;
        }
        Ok(())
    }

    /// The Ctrl-C drain sequence: stop sending, close connections, then
    /// close the stop scope so watchers and waits return.
    pub async fn drain(&self) {
        println!("Stop sending: s 0");
        if let Err(err) = self.send_fanout("Send", 0, 1000).await {
            println!("Failed to stop sending: {}", err);
        }
        println!("Close connections: c 0");
        if let Err(err) = self.connect_fanout(0, usize::MAX).await {
            println!("Failed to close connections: {}", err);
        }
        let _ = self.stop.send(());
    }

    fn watch_counters(controller: &Arc<Self>) {
        let controller = Arc::clone(controller);
        let mut stop = controller.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let counters = controller.collect_counters().await;
                        let now = Utc::now();
                        for writer in &controller.snapshot_writers {
                            if let Err(err) = writer.write_counters(now, &counters).await {
                                error!(error = %err, "failed to write counter snapshot");
                            }
                        }
                        controller.print_counters(&counters);
                    }
                    _ = stop.recv() => return,
                }
            }
        });
    }

    fn watch_metrics(controller: &Arc<Self>) {
        let controller = Arc::clone(controller);
        let mut stop = controller.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let metrics = controller.collect_metrics().await;
                        let now = Utc::now();
                        for writer in &controller.snapshot_writers {
                            if let Err(err) = writer.write_metrics(now, &metrics).await {
                                error!(error = %err, "failed to write metrics snapshot");
                            }
                        }
                    }
                    _ = stop.recv() => return,
                }
            }
        });
    }

    pub async fn collect_counters(&self) -> HashMap<String, i64> {
        let calls = self.agents.iter().map(|proxy| async move {
            let result = proxy
                .call(&RpcRequest::CollectCounters)
                .await
                .and_then(|response| response.decode::<HashMap<String, i64>>());
            match result {
                Ok(counters) => Some(counters),
                Err(err) => {
                    error!(agent = %proxy.address, error = %err, "failed to list counters from agent");
                    None
                }
            }
        });

        let mut total: HashMap<String, i64> = HashMap::new();
        for counters in join_all(calls).await.into_iter().flatten() {
            for (name, value) in counters {
                *total.entry(name).or_insert(0) += value;
            }
        }
        total
    }

    pub async fn collect_metrics(&self) -> Vec<AgentMetricsRecord> {
        let calls = self.agents.iter().map(|proxy| async move {
            let request = RpcRequest::CollectMetrics {
                collect_processes: self.collect_processes.clone(),
            };
            let result = proxy
                .call(&request)
                .await
                .and_then(|response| response.decode::<AgentMetrics>());
            match result {
                Ok(metrics) => Some(AgentMetricsRecord {
                    metrics,
                    agent: proxy.name.clone(),
                    agent_role: self
                        .agent_roles
                        .get(&proxy.name)
                        .cloned()
                        .unwrap_or_default(),
                }),
                Err(err) => {
                    error!(agent = %proxy.address, error = %err, "failed to list metrics from agent");
                    None
                }
            }
        });
        join_all(calls).await.into_iter().flatten().collect()
    }

    fn print_counters(&self, counters: &HashMap<String, i64>) {
        let mut rows: Vec<_> = counters.iter().collect();
        rows.sort_by(|left, right| left.0.cmp(right.0));
        println!("Counters:");
        for (name, value) in rows {
            println!("    {}: {}", name, value);
        }
    }

    async fn clear_wait_dump(&self, wait_seconds: u64) -> BenchResult<()> {
        self.invoke_all("Clear", vec!["message".to_string()]).await;
        tokio::time::sleep(Duration::from_secs(wait_seconds)).await;
        println!("{}", csv_header());
        println!("{}", csv_record(&self.collect_counters().await));
        Ok(())
    }
}

async fn invoke_agent(proxy: &AgentProxy, command: &str, arguments: Vec<String>) {
    let joined = arguments.join(",");
    let request = RpcRequest::Invoke {
        command: command.to_string(),
        arguments,
    };
    match proxy.call(&request).await {
        Ok(response) if response.success => {}
        Ok(response) => {
            warn!(
                agent = %proxy.address,
                command = %command,
                arguments = %joined,
                error = %response.error.unwrap_or_default(),
                "agent rejected command"
            );
        }
        Err(err) => {
            warn!(
                agent = %proxy.address,
                command = %command,
                arguments = %joined,
                error = %err,
                "agent call failed"
            );
        }
    }
}

fn print_metrics(metrics: &[AgentMetricsRecord]) {
    println!("Metrics:");
    for record in metrics {
        println!("    {}: {:?}", record.agent, record.metrics);
    }
}

fn parse_script_number(raw: &str) -> BenchResult<usize> {
    raw.parse()
        .map_err(|_| BenchError::script(format!("not a number: {}", raw)))
}

fn csv_header() -> String {
    COUNTER_FIELDS
        .iter()
        .map(|field| field.splitn(2, ':').nth(1).unwrap_or(field))
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_record(counters: &HashMap<String, i64>) -> String {
    COUNTER_FIELDS
        .iter()
        .map(|field| counters.get(*field).copied().unwrap_or(0).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sums_to_total_and_stays_balanced() {
        for total in [0usize, 1, 6, 7, 100, 12_345] {
            for agents in 1..=8usize {
                let shares: Vec<usize> =
                    (0..agents).map(|index| split_number(total, index, agents)).collect();
                assert_eq!(shares.iter().sum::<usize>(), total);
                let max = shares.iter().max().unwrap();
                let min = shares.iter().min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn split_hands_remainder_to_lowest_indices() {
        // c 7 3 across two agents: (4, 2) and (3, 1).
        assert_eq!(split_number(7, 0, 2), 4);
        assert_eq!(split_number(7, 1, 2), 3);
        assert_eq!(split_number(3, 0, 2), 2);
        assert_eq!(split_number(3, 1, 2), 1);
    }

    #[test]
    fn csv_header_strips_counter_group() {
        let header = csv_header();
        assert!(header.starts_with("inprogress,established,closed,error,groupjoin"));
        assert!(header.ends_with("sent,received,send_error,receive_error,decode_error"));
    }

    #[test]
    fn csv_record_follows_field_order() {
        let counters = HashMap::from([
            ("connection:inprogress".to_string(), 2),
            ("message:decode_error".to_string(), 9),
        ]);
        let record = csv_record(&counters);
        assert!(record.starts_with("2,"));
        assert!(record.ends_with(",9"));
    }

    #[test]
    fn script_numbers_must_be_unsigned_integers() {
        assert!(parse_script_number("10").is_ok());
        assert!(parse_script_number("-1").is_err());
        assert!(parse_script_number("ten").is_err());
    }
}
