//! Routing daemon wire protocol
//!
//! Messages are bare JSON objects written back to back on a local stream
//! socket (a Unix domain socket, or a named pipe on Windows), with no length
//! prefix or delimiter. [`FrameReader`] recovers message boundaries from the
//! JSON itself so that split and coalesced reads decode correctly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Reply status codes
pub mod status_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const UNSUPPORTED_ROUTING_TABLE: i32 = 2;
}

/// Client to daemon requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "parameters", rename_all = "camelCase")]
pub enum RoutingRequest {
    /// Route all traffic through the proxy at `proxy_ip`
    #[serde(rename_all = "camelCase")]
    ConfigureRouting {
        proxy_ip: String,
        is_auto_connect: bool,
    },
    /// Restore the original routing table
    ResetRouting {},
}

impl RoutingRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Action field of daemon messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseAction {
    ConfigureRouting,
    ResetRouting,
    StatusChanged,
    #[serde(other)]
    Unknown,
}

/// Daemon to client messages: replies and status pushes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingResponse {
    pub action: ResponseAction,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub connection_status: Option<i32>,
}

impl RoutingResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == Some(status_code::SUCCESS)
    }
}

/// Network state pushed by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

impl NetworkStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(NetworkStatus::Connected),
            1 => Some(NetworkStatus::Disconnected),
            2 => Some(NetworkStatus::Reconnecting),
            _ => None,
        }
    }
}

/// Splits a byte stream of concatenated JSON values into messages
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every message it completes
    ///
    /// An incomplete trailing value is kept for the next call. Unparseable
    /// input cannot be resynchronised, so it is returned as an error and the
    /// buffer is discarded.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Value, serde_json::Error>> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut consumed = 0;
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();

        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    messages.push(Ok(value));
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    consumed = self.buf.len();
                    messages.push(Err(e));
                    break;
                }
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }

        self.buf.drain(..consumed);
        messages
    }

    /// Bytes buffered while waiting for the rest of a message
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// A connected local stream to the daemon
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

/// Connect to the daemon listening at `path`
#[cfg(unix)]
pub async fn connect_transport(path: &Path) -> std::io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

/// Connect to the daemon listening at `path`
#[cfg(windows)]
pub async fn connect_transport(path: &Path) -> std::io::Result<Box<dyn IpcStream>> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(pipe))
}
