// JSON-RPC client for the berthd Unix socket.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use berth_common::protocol::jsonrpc::{self, Request, RequestId, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

const SOCKET_RELATIVE_PATH: &str = ".berth/daemon.sock";
// Opening a session waits for the agent runtime to pass its readiness probe.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Nothing is listening on the daemon socket.
#[derive(Debug)]
pub struct DaemonUnavailable {
    socket_path: PathBuf,
    source: io::Error,
}

impl DaemonUnavailable {
    pub(crate) fn new(socket_path: PathBuf, source: io::Error) -> Self {
        Self { socket_path, source }
    }
}

impl fmt::Display for DaemonUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon is not running (socket `{}`)", self.socket_path.display())
    }
}

impl std::error::Error for DaemonUnavailable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The daemon understood the call and refused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Stable name such as `NOT_CLAIMED` or `INVALID_PARAMS`.
    pub code: String,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<jsonrpc::RpcError> for RpcError {
    fn from(error: jsonrpc::RpcError) -> Self {
        Self { code: error.code_name(), message: error.message }
    }
}

#[derive(Debug)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
    next_id: AtomicI64,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path, timeout: DEFAULT_TIMEOUT, next_id: AtomicI64::new(1) }
    }

    /// Call `method` and decode its result.
    ///
    /// A dropped connection is retried once; an answer from the daemon,
    /// error or not, is final.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).context("failed to encode json-rpc params")?;
        let request =
            Request::new(method, Some(params), RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed)));
        let mut line = serde_json::to_vec(&request).context("failed to encode json-rpc request")?;
        line.push(b'\n');

        let response = match self.exchange(&line).await {
            Ok(response) => response,
            Err(first) => {
                debug!(method, error = %format!("{first:#}"), "retrying json-rpc call");
                self.exchange(&line)
                    .await
                    .map_err(|second| second.context(format!("retry after: {first:#}")))?
            }
        };

        let value = response.into_result().map_err(RpcError::from)?;
        serde_json::from_value(value)
            .with_context(|| format!("unexpected `{method}` result from daemon"))
    }

    /// One request line out, one response line back.
    async fn exchange(&self, line: &[u8]) -> Result<Response> {
        let stream = match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => {
                return Err(DaemonUnavailable::new(self.socket_path.clone(), err).into());
            }
            Ok(Err(err)) => {
                return Err(err).with_context(|| {
                    format!("failed to connect to daemon socket `{}`", self.socket_path.display())
                });
            }
            Err(elapsed) => return Err(elapsed).context("timed out connecting to daemon socket"),
        };

        let (read_half, mut write_half) = stream.into_split();
        let mut reply = Vec::new();
        timeout(self.timeout, async {
            write_half.write_all(line).await?;
            write_half.flush().await?;
            BufReader::new(read_half).read_until(b'\n', &mut reply).await
        })
        .await
        .context("timed out waiting for the daemon to answer")?
        .context("daemon socket i/o failed")?;

        if reply.is_empty() {
            anyhow::bail!("daemon closed the connection without answering");
        }
        serde_json::from_slice(&reply).context("daemon sent a malformed json-rpc response")
    }
}

pub fn default_socket_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SOCKET_RELATIVE_PATH)
}
