//! Snapshot sinks. The file sink appends one JSON object plus `,\n` per
//! record, so consumers parse `counters.txt` / `metrics.txt` line by line.
//! The InfluxDB sink posts line protocol over HTTP.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{BenchError, BenchResult};
use crate::metrics::AgentMetrics;

/// A per-agent metrics record as the controller collected it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricsRecord {
    #[serde(rename = "Metrics")]
    pub metrics: AgentMetrics,
    #[serde(rename = "Agent")]
    pub agent: String,
    #[serde(rename = "AgentRole")]
    pub agent_role: String,
}

#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write_counters(
        &self,
        now: DateTime<Utc>,
        counters: &HashMap<String, i64>,
    ) -> BenchResult<()>;

    async fn write_metrics(
        &self,
        now: DateTime<Utc>,
        metrics: &[AgentMetricsRecord],
    ) -> BenchResult<()>;
}

#[derive(Serialize)]
struct CountersRow<'a> {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Counters")]
    counters: &'a HashMap<String, i64>,
}

#[derive(Serialize)]
struct MetricsRow<'a> {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Metrics")]
    metrics: &'a [AgentMetricsRecord],
}

pub struct JsonSnapshotWriter {
    out_dir: PathBuf,
}

impl JsonSnapshotWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    async fn append_row(&self, filename: &str, mut row: String) -> BenchResult<()> {
        row.push_str(",\n");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out_dir.join(filename))
            .await?;
        file.write_all(row.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotWriter for JsonSnapshotWriter {
    async fn write_counters(
        &self,
        now: DateTime<Utc>,
        counters: &HashMap<String, i64>,
    ) -> BenchResult<()> {
        let row = serde_json::to_string(&CountersRow {
            time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            counters,
        })?;
        self.append_row("counters.txt", row).await
    }

    async fn write_metrics(
        &self,
        now: DateTime<Utc>,
        metrics: &[AgentMetricsRecord],
    ) -> BenchResult<()> {
        let row = serde_json::to_string(&MetricsRow {
            time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            metrics,
        })?;
        self.append_row("metrics.txt", row).await
    }
}

pub struct InfluxDbSnapshotWriter {
    addr: String,
    database: String,
    http: reqwest::Client,
}

impl InfluxDbSnapshotWriter {
    pub fn new(addr: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            database: database.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_lines(&self, lines: String) -> BenchResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/write?db={}",
            self.addr.trim_end_matches('/'),
            self.database
        );
        let response = self.http.post(&url).body(lines).send().await?;
        if !response.status().is_success() {
            return Err(BenchError::Snapshot(format!(
                "influxdb write failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotWriter for InfluxDbSnapshotWriter {
    async fn write_counters(
        &self,
        now: DateTime<Utc>,
        counters: &HashMap<String, i64>,
    ) -> BenchResult<()> {
        self.post_lines(counters_lines(now, counters)).await
    }

    async fn write_metrics(
        &self,
        now: DateTime<Utc>,
        metrics: &[AgentMetricsRecord],
    ) -> BenchResult<()> {
        self.post_lines(metrics_lines(now, metrics)).await
    }
}

fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn timestamp(now: DateTime<Utc>) -> i64 {
    now.timestamp_nanos_opt().unwrap_or_default()
}

fn counters_lines(now: DateTime<Utc>, counters: &HashMap<String, i64>) -> String {
    if counters.is_empty() {
        return String::new();
    }
    let mut fields: Vec<_> = counters.iter().collect();
    fields.sort_by(|left, right| left.0.cmp(right.0));
    let fields = fields
        .iter()
        .map(|(name, value)| format!("{}={}i", name, value))
        .collect::<Vec<_>>()
        .join(",");
    format!("counters {} {}\n", fields, timestamp(now))
}

fn metrics_lines(now: DateTime<Utc>, metrics: &[AgentMetricsRecord]) -> String {
    let nanos = timestamp(now);
    let mut lines = String::new();
    for record in metrics {
        let tags = format!(
            "agent={},agentRole={}",
            escape_tag(&record.agent),
            escape_tag(&record.agent_role)
        );
        lines.push_str(&format!(
            "metrics,{} machineMemoryTotal={}i,machineMemoryFree={}i,machineMemoryAvailable={}i,machineCpuLoad={} {}\n",
            tags,
            record.metrics.machine_memory_total,
            record.metrics.machine_memory_free,
            record.metrics.machine_memory_available,
            record.metrics.machine_cpu_load,
            nanos,
        ));
        for process in &record.metrics.processes {
            lines.push_str(&format!(
                "metrics,{},process={} memoryRss={}i,cpuPercentage={} {}\n",
                tags,
                escape_tag(&process.name),
                process.memory_rss,
                process.cpu_percentage,
                nanos,
            ));
        }
    }
    lines
}
