use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};

/// Immutable per-run configuration. Created once by the controller and
/// replicated to every agent through the `Setup` RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Websocket server under test, as `host:port`.
    pub host: String,
    /// Subject name, e.g. `SignalrCoreJsonEcho`.
    pub subject: String,
    /// Script file path; empty means interactive mode.
    #[serde(default)]
    pub cmd_file: String,
    /// Prefer `wss://` when dialing.
    #[serde(default)]
    pub use_wss: bool,
    /// If >0, echo payloads are a random ASCII blob of this many bytes.
    #[serde(default)]
    pub send_size: usize,
    /// Snapshot output directory; empty disables the file sink.
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub influxdb_addr: String,
    #[serde(default)]
    pub influxdb_name: String,
}

impl BenchConfig {
    pub fn validate(&self) -> BenchResult<()> {
        if self.host.is_empty() {
            return Err(BenchError::config("server host:port was not specified"));
        }
        if self.subject.is_empty() {
            return Err(BenchError::config("test subject was not specified"));
        }
        Ok(())
    }
}
