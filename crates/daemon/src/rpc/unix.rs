// JSON-RPC over the daemon's Unix socket, one JSON object per line.

use std::time::Duration;

use anyhow::{Context, Result};
use berth_common::protocol::jsonrpc::{RequestId, Response, RpcError, INVALID_REQUEST};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::rpc::methods::{handle_raw_request, RpcServerState};

/// Longest request line accepted; longer lines close the connection.
pub const MAX_REQUEST_BYTES: usize = 1 << 20;
/// How long open connections get to finish their current request on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve until the listener fails.
pub async fn serve_unix(listener: UnixListener, state: RpcServerState) -> Result<()> {
    let (_never_fired, shutdown) = broadcast::channel(1);
    serve_unix_until_shutdown(listener, state, shutdown).await
}

/// Serve until a shutdown notification arrives, then let open connections
/// answer what they are working on and close them.
pub async fn serve_unix_until_shutdown(
    listener: UnixListener,
    state: RpcServerState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let signal = shutdown.resubscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("failed to accept unix rpc connection")?;
                let state = state.clone();
                let shutdown = signal.resubscribe();
                connections.spawn(async move {
                    if let Err(error) = serve_connection(stream, state, shutdown).await {
                        warn!(error = %format!("{error:#}"), "unix rpc connection failed");
                    }
                });
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(join_error) = finished {
                    if join_error.is_panic() {
                        error!("unix rpc connection panicked");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    info!(open_connections = connections.len(), "rpc server shutting down");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "aborting rpc connections still busy after drain");
    }
    Ok(())
}

/// Answer request lines on one connection until EOF or shutdown. A request
/// already being handled when shutdown arrives still gets its response.
pub async fn serve_connection<IO>(
    stream: IO,
    state: RpcServerState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = Vec::new();
        let read = {
            let mut limited = (&mut reader).take(MAX_REQUEST_BYTES as u64);
            tokio::select! {
                read = limited.read_until(b'\n', &mut line) => {
                    read.context("failed to read json-rpc request")?
                }
                _ = shutdown.recv() => return Ok(()),
            }
        };
        if read == 0 {
            return Ok(());
        }

        let oversized = line.len() >= MAX_REQUEST_BYTES && line.last() != Some(&b'\n');
        let response = if oversized {
            debug!(bytes = line.len(), "rejecting oversized rpc request");
            Response::error(
                RequestId::Null,
                RpcError {
                    code: INVALID_REQUEST,
                    message: format!("request exceeds {MAX_REQUEST_BYTES} bytes"),
                    data: None,
                },
            )
        } else {
            let body = line.trim_ascii();
            if body.is_empty() {
                continue;
            }
            handle_raw_request(body, &state).await
        };

        let mut encoded = serde_json::to_vec(&response).context("failed to encode json-rpc response")?;
        encoded.push(b'\n');
        write_half.write_all(&encoded).await.context("failed to write json-rpc response")?;
        write_half.flush().await.context("failed to flush json-rpc response")?;

        if oversized {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use berth_common::protocol::jsonrpc::{Request, RequestId, Response};
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{UnixListener, UnixStream};

    use super::*;
    use crate::testing::TestHub;

    fn bind(path: &Path) -> Option<UnixListener> {
        match UnixListener::bind(path) {
            Ok(listener) => Some(listener),
            Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
                eprintln!("skipping unix socket test: bind is not permitted in this environment");
                None
            }
            Err(error) => panic!("failed to bind unix socket: {error}"),
        }
    }

    async fn connect(path: &Path) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let (read_half, write_half) = UnixStream::connect(path).await.unwrap().into_split();
        (BufReader::new(read_half), write_half)
    }

    async fn send(write_half: &mut OwnedWriteHalf, method: &str, params: Option<Value>, id: i64) {
        let mut encoded = serde_json::to_vec(&Request::new(method, params, RequestId::Number(id))).unwrap();
        encoded.push(b'\n');
        write_half.write_all(&encoded).await.unwrap();
    }

    async fn receive(reader: &mut BufReader<OwnedReadHalf>) -> Response {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        serde_json::from_slice(&line).unwrap()
    }

    #[tokio::test]
    async fn answers_concurrent_connections_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };
        let t = TestHub::new().unwrap();
        let server = tokio::spawn(serve_unix(listener, RpcServerState::new(t.hub.clone())));

        let mut clients = Vec::new();
        for client in 0_i64..6 {
            let socket_path = socket_path.clone();
            clients.push(tokio::spawn(async move {
                let (mut reader, mut writer) = connect(&socket_path).await;
                send(&mut writer, "rpc.ping", None, client * 10).await;
                send(&mut writer, "task.list", None, client * 10 + 1).await;
                (receive(&mut reader).await, receive(&mut reader).await)
            }));
        }

        for (client, task) in (0_i64..6).zip(clients) {
            let (ping, list) = task.await.unwrap();
            assert_eq!(ping.id, RequestId::Number(client * 10));
            assert_eq!(ping.result, Some(json!({ "ok": true })));
            assert_eq!(list.id, RequestId::Number(client * 10 + 1));
            assert_eq!(list.result, Some(json!({ "tasks": [] })));
        }
        server.abort();
    }

    #[tokio::test]
    async fn oversized_request_is_refused_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };
        let t = TestHub::new().unwrap();
        let server = tokio::spawn(serve_unix(listener, RpcServerState::new(t.hub.clone())));

        let (mut reader, mut writer) = connect(&socket_path).await;
        let flood = vec![b' '; MAX_REQUEST_BYTES];
        writer.write_all(&flood).await.unwrap();

        let response = receive(&mut reader).await;
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);

        let mut rest = Vec::new();
        let closed = matches!(reader.read_until(b'\n', &mut rest).await, Ok(0) | Err(_));
        assert!(closed, "connection should close");
        server.abort();
    }

    #[tokio::test]
    async fn shutdown_request_is_answered_before_the_server_stops() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };
        let t = TestHub::new().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let state = RpcServerState::new(t.hub.clone()).with_shutdown_notifier(shutdown_tx);
        let server = tokio::spawn(serve_unix_until_shutdown(listener, state, shutdown_rx));

        // An idle connection must not hold the server open.
        let (_idle_reader, _idle_writer) = connect(&socket_path).await;

        let (mut reader, mut writer) = connect(&socket_path).await;
        send(&mut writer, "daemon.shutdown", None, 1).await;
        assert_eq!(receive(&mut reader).await.result, Some(json!({ "ok": true })));

        tokio::time::timeout(DRAIN_TIMEOUT, server)
            .await
            .expect("server should stop promptly")
            .unwrap()
            .unwrap();
    }
}
