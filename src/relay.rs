//! Local Socket Relay: the Unix-domain accept loop that turns
//! every local Docker CLI connection into a byte-transparent forward
//! through the Supervisor's tunnel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::constants::COPY_BUFFER_SIZE;
use crate::id::connection_id;
use crate::ssh::SshTransport;
use crate::supervisor::Supervisor;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind local socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Relay<T: SshTransport> {
    supervisor: Arc<Supervisor<T>>,
    activity: Arc<ActivityTracker>,
    socket_path: PathBuf,
    ensure_deadline: Duration,
}

impl<T: SshTransport + 'static> Relay<T> {
    pub fn new(
        supervisor: Arc<Supervisor<T>>,
        activity: Arc<ActivityTracker>,
        socket_path: PathBuf,
        ensure_deadline: Duration,
    ) -> Self {
        Self {
            supervisor,
            activity,
            socket_path,
            ensure_deadline,
        }
    }

    /// Binds the socket and serves connections until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        if self.socket_path.exists() {
            let _ = tokio::fs::remove_file(&self.socket_path).await;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| RelayError::Bind {
            path: self.socket_path.display().to_string(),
            source: e,
        })?;

        set_world_accessible(&self.socket_path).await;

        tracing::info!(path = %self.socket_path.display(), "relay listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "relay accept error, continuing");
                    continue;
                }
            };

            let supervisor = self.supervisor.clone();
            let activity = self.activity.clone();
            let deadline = self.ensure_deadline;
            let child_cancel = cancel.clone();
            tokio::spawn(async move {
                serve_connection(stream, supervisor, activity, deadline, child_cancel).await;
            });
        }

        let _ = tokio::fs::remove_file(&self.socket_path).await;
        Ok(())
    }
}

async fn serve_connection<T: SshTransport + 'static>(
    client_stream: UnixStream,
    supervisor: Arc<Supervisor<T>>,
    activity: Arc<ActivityTracker>,
    ensure_deadline: Duration,
    cancel: CancellationToken,
) {
    let id = connection_id();
    activity.record_connection();

    if let Err(e) = supervisor.ensure(ensure_deadline).await {
        tracing::warn!(connection_id = %id, error = %e, "ensure() failed, closing client connection");
        return;
    }

    let Some(remote_addr) = supervisor.local_tunnel_addr().await else {
        tracing::warn!(connection_id = %id, "no tunnel address available after ensure() succeeded");
        return;
    };

    let remote_stream = match TcpStream::connect(remote_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(connection_id = %id, error = %e, "failed to dial local tunnel endpoint");
            return;
        }
    };

    activity.record_command();

    let (mut client_read, mut client_write) = split(client_stream);
    let (mut remote_read, mut remote_write) = remote_stream.into_split();

    let to_remote = tokio::spawn(async move { copy_until_eof(&mut client_read, &mut remote_write).await });
    let to_client = tokio::spawn(async move { copy_until_eof(&mut remote_read, &mut client_write).await });

    tokio::select! {
        _ = cancel.cancelled() => {
            to_remote.abort();
            to_client.abort();
        }
        result = to_remote => {
            log_copy_result(&id, "client->daemon", result);
            to_client.abort();
        }
        result = to_client => {
            log_copy_result(&id, "daemon->client", result);
            to_remote.abort();
        }
    }
}

fn log_copy_result(id: &str, direction: &str, result: Result<std::io::Result<u64>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(bytes)) => tracing::debug!(connection_id = id, direction, bytes, "relay copy finished"),
        Ok(Err(e)) => tracing::debug!(connection_id = id, direction, error = %e, "relay copy errored"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::debug!(connection_id = id, direction, error = %e, "relay copy task panicked"),
    }
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Mode 0666 so any local user can reach the Docker CLI through it, plus a
/// best-effort `chgrp` to `daemon` or `docker`, whichever group exists
/// (silently ignored if neither does or the binary is absent).
#[cfg(unix)]
async fn set_world_accessible(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).await {
        tracing::debug!(error = %e, "failed to set relay socket permissions");
    }

    let path = path.to_path_buf();
    tokio::spawn(async move {
        for group in ["daemon", "docker"] {
            match tokio::process::Command::new("chgrp").arg(group).arg(&path).output().await {
                Ok(out) if out.status.success() => {
                    tracing::debug!(group, "set relay socket group");
                    return;
                }
                _ => continue,
            }
        }
        tracing::debug!("neither daemon nor docker group available for relay socket");
    });
}

#[cfg(not(unix))]
async fn set_world_accessible(_path: &Path) {}
