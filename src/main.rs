use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tokio::net::TcpListener;

use websocket_bench::agent::Agent;
use websocket_bench::config::BenchConfig;
use websocket_bench::controller::Controller;
use websocket_bench::error::{BenchError, BenchResult};
use websocket_bench::forwarder::Forwarder;
use websocket_bench::snapshot::{InfluxDbSnapshotWriter, JsonSnapshotWriter, SnapshotWriter};

const AGENT_PID_FILE: &str = "/tmp/websocket-bench.pid";
const MASTER_PID_FILE: &str = "/tmp/websocket-bench-master.pid";

fn cli() -> Command {
    Command::new("websocket-bench")
        .version("1.0")
        .about("Distributed WebSocket load generator for SignalR-compatible services")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Run mode: agent, master or forwarder")
                .default_value("agent"),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Snapshot output directory")
                .default_value("output"),
        )
        .arg(
            Arg::new("listen-address")
                .short('l')
                .long("listen-address")
                .value_name("ADDRESS")
                .help("Agent listen address; in forwarder mode a public,management pair; with --reverse the forwarder address to dial")
                .default_value(":7000"),
        )
        .arg(
            Arg::new("agents")
                .short('a')
                .long("agents")
                .value_name("AGENTS")
                .help("Agent addresses separated by comma, or path to a 'host role' file"),
        )
        .arg(
            Arg::new("role")
                .long("role")
                .value_name("ROLE")
                .help("Agent role")
                .default_value("client"),
        )
        .arg(
            Arg::new("collect-processes")
                .long("collect-processes")
                .value_name("NAMES")
                .help("Process names to sample on agents, separated by comma")
                .default_value(""),
        )
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("HOST:PORT")
                .help("Websocket server host:port"),
        )
        .arg(
            Arg::new("test-subject")
                .short('t')
                .long("test-subject")
                .value_name("SUBJECT")
                .help("Test subject"),
        )
        .arg(
            Arg::new("cmd-file")
                .short('c')
                .long("cmd-file")
                .value_name("FILE")
                .help("Command file; empty runs the interactive prompt")
                .default_value(""),
        )
        .arg(
            Arg::new("use-security-connection")
                .short('u')
                .long("use-security-connection")
                .help("Prefer wss connections")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("send-size")
                .short('b')
                .long("send-size")
                .value_name("BYTES")
                .help("Send message size in bytes; 0 means a short id plus timestamp")
                .default_value("0"),
        )
        .arg(
            Arg::new("reverse")
                .short('r')
                .long("reverse")
                .help("Dial the forwarder instead of listening")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("influxdb-addr")
                .long("influxdb-addr")
                .value_name("URL")
                .help("Output InfluxDB address")
                .default_value(""),
        )
        .arg(
            Arg::new("influxdb-name")
                .long("influxdb-name")
                .value_name("NAME")
                .help("Output InfluxDB database name")
                .default_value(""),
        )
}

#[tokio::main]
async fn main() {
    websocket_bench::init_tracing();
    let matches = cli().get_matches();

    let mode = flag(&matches, "mode");
    let result = match mode.as_str() {
        "agent" => run_agent(&matches).await,
        "master" => run_master(&matches).await,
        "forwarder" => run_forwarder(&matches).await,
        other => Err(BenchError::config(format!("unknown mode: {}", other))),
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn flag(matches: &ArgMatches, name: &str) -> String {
    matches
        .get_one::<String>(name)
        .cloned()
        .unwrap_or_default()
}

async fn run_agent(matches: &ArgMatches) -> BenchResult<()> {
    let role = flag(matches, "role");
    let listen_address = flag(matches, "listen-address");
    let agent = Agent::new(role);

    if matches.get_flag("reverse") {
        write_pid_file(AGENT_PID_FILE)?;
        agent.serve_reverse(listen_address).await
    } else {
        let listener = TcpListener::bind(normalize_listen_addr(&listen_address)).await?;
        write_pid_file(AGENT_PID_FILE)?;
        agent.serve(listener).await
    }
}

async fn run_master(matches: &ArgMatches) -> BenchResult<()> {
    let agents_flag = matches
        .get_one::<String>("agents")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BenchError::config("no agents specified"))?;
    let agents = parse_agents(agents_flag, &flag(matches, "role"))?;

    let config = BenchConfig {
        host: flag(matches, "server"),
        subject: flag(matches, "test-subject"),
        cmd_file: flag(matches, "cmd-file"),
        use_wss: matches.get_flag("use-security-connection"),
        send_size: flag(matches, "send-size")
            .parse()
            .map_err(|_| BenchError::config("send-size must be a number"))?,
        output_dir: flag(matches, "output-dir"),
        influxdb_addr: flag(matches, "influxdb-addr"),
        influxdb_name: flag(matches, "influxdb-name"),
    };
    config.validate()?;

    write_pid_file(MASTER_PID_FILE)?;

    let mut snapshot_writers: Vec<Arc<dyn SnapshotWriter>> = Vec::new();
    if !config.output_dir.is_empty() {
        std::fs::create_dir_all(&config.output_dir)?;
        tracing::info!(dir = %config.output_dir, "writing snapshots");
        snapshot_writers.push(Arc::new(JsonSnapshotWriter::new(&config.output_dir)));
    }
    if !config.influxdb_addr.is_empty() && !config.influxdb_name.is_empty() {
        tracing::info!(addr = %config.influxdb_addr, db = %config.influxdb_name, "writing to InfluxDB");
        snapshot_writers.push(Arc::new(InfluxDbSnapshotWriter::new(
            config.influxdb_addr.clone(),
            config.influxdb_name.clone(),
        )));
    }

    let collect_processes = split_csv(&flag(matches, "collect-processes"));
    let mut controller = Controller::new(snapshot_writers, collect_processes);
    for (address, role) in agents {
        controller
            .register_agent(&address, &role)
            .await
            .map_err(|err| {
                BenchError::config(format!("failed to register agent {}: {}", address, err))
            })?;
    }

    Arc::new(controller).run(&config).await
}

async fn run_forwarder(matches: &ArgMatches) -> BenchResult<()> {
    let listen_address = flag(matches, "listen-address");
    let Some((public, management)) = listen_address.split_once(',') else {
        return Err(BenchError::config(
            "forwarder mode takes -l <public_addr>,<management_addr>",
        ));
    };
    Forwarder::new()
        .run(
            &normalize_listen_addr(public),
            &normalize_listen_addr(management),
        )
        .await
}

/// A bare `:port` listens on all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Agents are given either inline (`host:port,host:port`) or as a file of
/// `host:port role` lines.
fn parse_agents(raw: &str, default_role: &str) -> BenchResult<Vec<(String, String)>> {
    if std::path::Path::new(raw).is_file() {
        let content = std::fs::read_to_string(raw)?;
        let mut agents = Vec::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(address) = parts.next() else {
                continue;
            };
            let role = parts.next().unwrap_or(default_role);
            agents.push((address.to_string(), role.to_string()));
        }
        Ok(agents)
    } else {
        Ok(split_csv(raw)
            .into_iter()
            .map(|address| (address, default_role.to_string()))
            .collect())
    }
}

fn write_pid_file(path: &str) -> BenchResult<()> {
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}
