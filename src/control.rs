//! Control socket: a small, second Unix-domain socket used
//! by `dockbridge stop`/`dockbridge status` to talk to a running instance.
//! Line-delimited JSON, one request per connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to bind control socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to control socket at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no response from running instance")]
    NoResponse,
    #[error("malformed control message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Status,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status { state: String, shutdown_in_secs: u64 },
    Stopping,
}

/// What the control server asks the caller to report back, decoupling
/// this module from `supervisor`/`activity` types directly.
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync {
    async fn status(&self) -> (String, u64);
    fn request_stop(&self);
}

pub async fn serve(
    path: &Path,
    handler: std::sync::Arc<dyn ControlHandler>,
    cancel: CancellationToken,
) -> Result<(), ControlError> {
    if path.exists() {
        let _ = tokio::fs::remove_file(path).await;
    }
    let listener = UnixListener::bind(path).map_err(|e| ControlError::Bind {
        path: path.display().to_string(),
        source: e,
    })?;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let Ok((stream, _)) = accepted else { continue };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_one(stream, handler).await {
                tracing::debug!(error = %e, "control connection error");
            }
        });
    }

    let _ = tokio::fs::remove_file(path).await;
    Ok(())
}

async fn handle_one(stream: UnixStream, handler: std::sync::Arc<dyn ControlHandler>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let request: Request = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            let body = format!("{{\"error\":\"{e}\"}}\n");
            write_half.write_all(body.as_bytes()).await?;
            return Ok(());
        }
    };

    let response = match request {
        Request::Status => {
            let (state, shutdown_in_secs) = handler.status().await;
            Response::Status { state, shutdown_in_secs }
        }
        Request::Stop => {
            handler.request_stop();
            Response::Stopping
        }
    };

    let body = serde_json::to_string(&response).unwrap_or_default();
    write_half.write_all(body.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

/// Sends one request to a running instance's control socket and waits for
/// its single-line JSON reply.
pub async fn send_request(path: &Path, request: &Request) -> Result<Response, ControlError> {
    let stream = tokio::time::timeout(Duration::from_secs(5), UnixStream::connect(path))
        .await
        .map_err(|_| ControlError::Connect {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| ControlError::Connect {
            path: path.display().to_string(),
            source: e,
        })?;

    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(request).map_err(|e| ControlError::Malformed(e.to_string()))?;
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ControlError::Connect {
            path: path.display().to_string(),
            source: e,
        })?;

    let mut lines = BufReader::new(read_half).lines();
    let response_line = lines
        .next_line()
        .await
        .map_err(|e| ControlError::Connect {
            path: path.display().to_string(),
            source: e,
        })?
        .ok_or(ControlError::NoResponse)?;

    serde_json::from_str(&response_line).map_err(|e| ControlError::Malformed(e.to_string()))
}

pub fn default_ctl_path(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.as_os_str().to_os_string();
    path.push(".ctl");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeHandler {
        stopped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ControlHandler for FakeHandler {
        async fn status(&self) -> (String, u64) {
            ("ready".into(), 120)
        }
        fn request_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn status_round_trip_over_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockbridge.ctl");
        let handler = Arc::new(FakeHandler {
            stopped: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let server_path = path.clone();
        let server_cancel = cancel.clone();
        let server_handler = handler.clone();
        let server = tokio::spawn(async move {
            serve(&server_path, server_handler, server_cancel).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = send_request(&path, &Request::Status).await.unwrap();
        match response {
            Response::Status { state, shutdown_in_secs } => {
                assert_eq!(state, "ready");
                assert_eq!(shutdown_in_secs, 120);
            }
            other => panic!("expected Status, got {other:?}"),
        }

        let response = send_request(&path, &Request::Stop).await.unwrap();
        assert!(matches!(response, Response::Stopping));
        assert!(handler.stopped.load(Ordering::SeqCst));

        cancel.cancel();
        let _ = server.await;
    }
}
