//! Controller <-> agent RPC: newline-delimited JSON request/response
//! records over a plain TCP stream, so the same framing works through the
//! forwarder's byte tunnel.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    Setup {
        config: BenchConfig,
    },
    Invoke {
        command: String,
        arguments: Vec<String>,
    },
    CollectCounters,
    CollectMetrics {
        collect_processes: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Deserializes the payload of a successful response.
    pub fn decode<T: serde::de::DeserializeOwned>(self) -> BenchResult<T> {
        if !self.success {
            return Err(BenchError::rpc(
                self.error.unwrap_or_else(|| "unknown agent error".to_string()),
            ));
        }
        let data = self
            .data
            .ok_or_else(|| BenchError::rpc("response carries no data"))?;
        Ok(serde_json::from_value(data)?)
    }
}

struct ClientIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One persistent RPC connection to an agent. Calls are serialized on the
/// wire; the agent answers them in order.
pub struct RpcClient {
    io: Mutex<ClientIo>,
}

impl RpcClient {
    pub async fn connect(address: &str) -> BenchResult<Self> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            io: Mutex::new(ClientIo {
                reader: BufReader::new(read_half),
                writer,
            }),
        }
    }

    pub async fn call(&self, request: &RpcRequest) -> BenchResult<RpcResponse> {
        let mut io = self.io.lock().await;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        io.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if io.reader.read_line(&mut reply).await? == 0 {
            return Err(BenchError::rpc("connection closed by agent"));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let request = RpcRequest::Invoke {
            command: "EnsureConnection".to_string(),
            arguments: vec!["10".to_string(), "5".to_string()],
        };
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""method":"invoke""#));

        let decoded: RpcRequest = serde_json::from_str(&encoded).unwrap();
        match decoded {
            RpcRequest::Invoke { command, arguments } => {
                assert_eq!(command, "EnsureConnection");
                assert_eq!(arguments, vec!["10", "5"]);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn failure_responses_surface_as_errors() {
        let response = RpcResponse::failure("unknown command: Explode");
        let result: BenchResult<serde_json::Value> = response.decode();
        assert!(matches!(result, Err(BenchError::Rpc(_))));
    }
}
