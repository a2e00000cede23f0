use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use uuid::Uuid;

/// One evaluation request: a serialized program and the pending id it
/// resolves on the caller's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExprRequest {
    pub id: Uuid,
    pub program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExprReply {
    Ok { id: Uuid, value: String },
    Error { id: Uuid, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("worker reported: {0}")]
    Worker(String),
}

/// Sends one request over a fresh connection and waits for the reply line.
/// The whole exchange runs under `deadline`.
pub async fn execute(
    addr: &str,
    request: ExprRequest,
    deadline: Duration,
) -> Result<String, TransportError> {
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let mut frame =
            serde_json::to_string(&request).map_err(|err| TransportError::Protocol(err.to_string()))?;
        frame.push('\n');

        let mut reader = BufReader::new(stream);
        reader.get_mut().write_all(frame.as_bytes()).await?;

        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(TransportError::Protocol(
                "connection closed before reply".to_string(),
            ));
        }

        match serde_json::from_str::<ExprReply>(line.trim_end()) {
            Ok(ExprReply::Ok { value, .. }) => Ok(value),
            Ok(ExprReply::Error { message, .. }) => Err(TransportError::Worker(message)),
            Err(err) => Err(TransportError::Protocol(err.to_string())),
        }
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(deadline)),
    }
}

/// Worker-side program evaluation callback. Runs on a blocking thread; the
/// error string is relayed to the caller verbatim.
pub type EvalHandler = Arc<dyn Fn(String) -> Result<String, String> + Send + Sync>;

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ServerHandle {
    /// The address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) -> Result<(), TransportError> {
        if let Ok(mut guard) = self.shutdown_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
        if let Ok(mut guard) = self.join_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.join().map_err(|_| {
                    TransportError::Protocol("server thread panicked".to_string())
                })?;
            }
        }
        Ok(())
    }
}

/// Starts a worker server on its own tokio runtime and thread. Each accepted
/// connection is a stream of newline-delimited `ExprRequest` frames; every
/// frame is answered with one `ExprReply` line.
pub fn start_server(addr: SocketAddr, handler: EvalHandler) -> Result<ServerHandle, TransportError> {
    let worker_threads = std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    let listener = runtime.block_on(TcpListener::bind(addr))?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let join_handle = thread::spawn(move || {
        let server_future = async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accept = listener.accept() => {
                        let (stream, remote_addr) = match accept {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        tracing::debug!(%remote_addr, "worker connection accepted");
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, handler).await {
                                tracing::debug!(%remote_addr, error = %err, "worker connection closed");
                            }
                        });
                    }
                }
            }
        };

        runtime.block_on(server_future);
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Mutex::new(Some(shutdown_tx)),
        join_handle: Mutex::new(Some(join_handle)),
    })
}

async fn serve_connection(stream: TcpStream, handler: EvalHandler) -> Result<(), TransportError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<ExprRequest>(trimmed) {
            Ok(request) => {
                let id = request.id;
                let handler = handler.clone();
                let program = request.program;
                let result = tokio::task::spawn_blocking(move || handler(program))
                    .await
                    .map_err(|err| err.to_string())
                    .and_then(|result| result);
                match result {
                    Ok(value) => ExprReply::Ok { id, value },
                    Err(message) => ExprReply::Error { id, message },
                }
            }
            Err(err) => ExprReply::Error {
                id: Uuid::nil(),
                message: format!("malformed request: {err}"),
            },
        };

        let mut frame =
            serde_json::to_string(&reply).map_err(|err| TransportError::Protocol(err.to_string()))?;
        frame.push('\n');
        reader.get_mut().write_all(frame.as_bytes()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("client runtime")
    }

    #[test]
    fn round_trip_ok_reply() {
        let handler: EvalHandler = Arc::new(|program| Ok(format!("echo:{program}")));
        let server = start_server("127.0.0.1:0".parse().expect("addr"), handler).expect("server");
        let addr = server.local_addr().to_string();

        let runtime = client_runtime();
        let request = ExprRequest {
            id: Uuid::new_v4(),
            program: "{\n1+2\n}".to_string(),
        };
        let value = runtime
            .block_on(execute(&addr, request, Duration::from_secs(5)))
            .expect("reply");
        assert_eq!(value, "echo:{\n1+2\n}");

        server.stop().expect("stop");
    }

    #[test]
    fn handler_error_surfaces_as_worker_error() {
        let handler: EvalHandler = Arc::new(|_| Err("no parse".to_string()));
        let server = start_server("127.0.0.1:0".parse().expect("addr"), handler).expect("server");
        let addr = server.local_addr().to_string();

        let runtime = client_runtime();
        let request = ExprRequest {
            id: Uuid::new_v4(),
            program: "{\nbogus\n}".to_string(),
        };
        let err = runtime
            .block_on(execute(&addr, request, Duration::from_secs(5)))
            .expect_err("should fail");
        match err {
            TransportError::Worker(message) => assert_eq!(message, "no parse"),
            other => panic!("expected worker error, got {other}"),
        }

        server.stop().expect("stop");
    }

    #[test]
    fn connect_failure_is_reported() {
        let runtime = client_runtime();
        let request = ExprRequest {
            id: Uuid::new_v4(),
            program: "{\n1\n}".to_string(),
        };
        // Port 1 is essentially never listening on loopback.
        let err = runtime
            .block_on(execute("127.0.0.1:1", request, Duration::from_secs(5)))
            .expect_err("should fail");
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout(_)
        ));
    }
}
