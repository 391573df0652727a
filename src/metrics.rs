//! Machine and process resource sampling for `CollectMetrics`: 1-minute
//! load average and memory from /proc, per-process CPU%/RSS via `ps`.
//! Unparseable lines are skipped silently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BenchResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub machine_memory_total: u64,
    pub machine_memory_free: u64,
    pub machine_memory_available: u64,
    pub machine_cpu_load: f64,
    #[serde(default)]
    pub processes: Vec<ProcessResourceUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResourceUsage {
    pub name: String,
    pub memory_rss: i64,
    pub cpu_percentage: f64,
}

pub async fn collect(collect_processes: &[String]) -> AgentMetrics {
    let mut metrics = AgentMetrics::default();

    match tokio::fs::read_to_string("/proc/loadavg").await {
        Ok(raw) => {
            if let Some(load) = parse_loadavg(&raw) {
                metrics.machine_cpu_load = load;
            }
        }
        Err(err) => debug!(error = %err, "failed to read /proc/loadavg"),
    }

    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(raw) => {
            let memory = parse_meminfo(&raw);
            metrics.machine_memory_total = memory.total;
            metrics.machine_memory_free = memory.free;
            metrics.machine_memory_available = memory.available;
        }
        Err(err) => debug!(error = %err, "failed to read /proc/meminfo"),
    }

    if !collect_processes.is_empty() {
        match process_usages(collect_processes).await {
            Ok(processes) => metrics.processes = processes,
            Err(err) => debug!(error = %err, "failed to sample processes"),
        }
    }

    metrics
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MachineMemory {
    total: u64,
    free: u64,
    available: u64,
}

fn parse_meminfo(raw: &str) -> MachineMemory {
    let mut memory = MachineMemory::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches("kB").trim();
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        match key.trim() {
            "MemTotal" => memory.total = kib * 1024,
            "MemFree" => memory.free = kib * 1024,
            "MemAvailable" => memory.available = kib * 1024,
            _ => {}
        }
    }
    memory
}

async fn process_usages(names: &[String]) -> BenchResult<Vec<ProcessResourceUsage>> {
    let output = tokio::process::Command::new("ps")
        .arg("-C")
        .arg(names.join(","))
        .args(["-o", "comm,rss,%cpu", "--no-headers"])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ps_output(&stdout, names))
}

fn parse_ps_output(raw: &str, names: &[String]) -> Vec<ProcessResourceUsage> {
    let mut rss_by_name: HashMap<&str, i64> = HashMap::new();
    let mut cpu_by_name: HashMap<&str, f64> = HashMap::new();

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(rss_raw), Some(cpu_raw)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (Ok(rss), Ok(cpu)) = (rss_raw.parse::<i64>(), cpu_raw.parse::<f64>()) else {
            continue;
        };
        *rss_by_name.entry(name).or_insert(0) += rss;
        *cpu_by_name.entry(name).or_insert(0.0) += cpu;
    }

    names
        .iter()
        .map(|name| ProcessResourceUsage {
            name: name.clone(),
            memory_rss: rss_by_name.get(name.as_str()).copied().unwrap_or(0),
            cpu_percentage: cpu_by_name.get(name.as_str()).copied().unwrap_or(0.0),
        })
        .collect()
}
