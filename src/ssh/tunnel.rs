//! Tunnel Handle: a local TCP listener that forwards every accepted
//! stream, byte-transparently, through an SSH session to a fixed remote
//! TCP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::COPY_BUFFER_SIZE;

use super::transport::SshError;

/// Opens a forwarded stream through the owning session for one accepted
/// client connection. The session is the sole owner of the underlying
/// transport; the Tunnel only ever sees this narrow dialing contract.
#[async_trait::async_trait]
pub trait ChannelDialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self, remote_addr: SocketAddr) -> Result<Self::Stream, SshError>;
}

/// A live local TCP listener forwarding to one fixed remote address.
pub struct TunnelHandle {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    active_pairs: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TunnelHandle {
    pub async fn create<D>(
        dialer: Arc<D>,
        local_bind: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Self, SshError>
    where
        D: ChannelDialer + 'static,
    {
        let listener = TcpListener::bind(local_bind)
            .await
            .map_err(|e| SshError::TunnelSetup(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SshError::TunnelSetup(e.to_string()))?;

        let cancel = CancellationToken::new();
        let active_pairs: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_cancel = cancel.clone();
        let accept_pairs = active_pairs.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, dialer, remote_addr, accept_cancel, accept_pairs).await;
        });

        Ok(Self {
            local_addr,
            remote_addr,
            cancel,
            accept_task: Some(accept_task),
            active_pairs,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Stops the accept loop, closes the listener, and best-effort closes
    /// all in-flight forwarded streams.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        let mut pairs = self.active_pairs.lock().await;
        for pair in pairs.drain(..) {
            pair.abort();
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop<D>(
    listener: TcpListener,
    dialer: Arc<D>,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
    active_pairs: Arc<Mutex<Vec<JoinHandle<()>>>>,
) where
    D: ChannelDialer + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let client_stream = match accepted {
            Ok((stream, _peer)) => stream,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::warn!(error = %e, "tunnel accept error, continuing");
                continue;
            }
        };

        let dialer = dialer.clone();
        let pairs = active_pairs.clone();
        let pair_cancel = cancel.clone();

        // Dialing and forwarding happen off the accept loop so a slow or
        // stuck dial never stalls subsequent accepts.
        let task = tokio::spawn(async move {
            forward_one(client_stream, dialer, remote_addr, pair_cancel).await;
        });
        pairs.lock().await.push(task);
    }
}

async fn forward_one<D>(
    client_stream: TcpStream,
    dialer: Arc<D>,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
) where
    D: ChannelDialer + 'static,
{
    let remote_stream = match dialer.dial(remote_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            // Dial failure closes only the client side.
            tracing::debug!(error = %e, "tunnel dial failed, closing client stream");
            drop(client_stream);
            return;
        }
    };

    let (mut client_read, mut client_write) = client_stream.into_split();
    let (mut remote_read, mut remote_write) = split(remote_stream);

    let to_remote = tokio::spawn(async move { copy_until_eof(&mut client_read, &mut remote_write).await });
    let to_client = tokio::spawn(async move { copy_until_eof(&mut remote_read, &mut client_write).await });

    // The pair is finished when EITHER direction returns EOF or error;
    // the other copy is aborted rather than awaited.
    tokio::select! {
        _ = cancel.cancelled() => {
            to_remote.abort();
            to_client.abort();
        }
        result = to_remote => {
            log_copy_result("client->remote", result);
            to_client.abort();
        }
        result = to_client => {
            log_copy_result("remote->client", result);
            to_remote.abort();
        }
    }
}

fn log_copy_result(direction: &str, result: Result<std::io::Result<u64>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(bytes)) => tracing::debug!(direction, bytes, "tunnel copy finished"),
        Ok(Err(e)) => tracing::debug!(direction, error = %e, "tunnel copy errored"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::debug!(direction, error = %e, "tunnel copy task panicked"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Dials straight past the channel-open step into a plain `TcpStream`
    /// connect, standing in for the real `RusshDialer` so this test never
    /// needs an actual SSH session.
    struct TcpDialer;

    #[async_trait::async_trait]
    impl ChannelDialer for TcpDialer {
        type Stream = TcpStream;

        async fn dial(&self, remote_addr: SocketAddr) -> Result<Self::Stream, SshError> {
            TcpStream::connect(remote_addr)
                .await
                .map_err(|e| SshError::TunnelSetup(e.to_string()))
        }
    }

    /// Accepts one connection, echoes back everything it reads, and
    /// reports the bytes it received on a channel once the client closes
    /// its write half.
    async fn spawn_echo_server() -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.split();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = read_half.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                write_half.write_all(&buf[..n]).await.unwrap();
            }
            write_half.shutdown().await.ok();
            let _ = tx.send(received);
        });

        (addr, rx)
    }

    /// Writes `payload` to `stream` split into randomly sized chunks,
    /// instead of one contiguous call, so the tunnel is exercised across
    /// arbitrary chunk boundaries.
    async fn write_in_random_chunks(stream: &mut (impl AsyncWrite + Unpin), payload: &[u8]) {
        let mut rng = rand::rng();
        let mut offset = 0;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let chunk_len = rng.random_range(1..=remaining.min(257));
            stream.write_all(&payload[offset..offset + chunk_len]).await.unwrap();
            offset += chunk_len;
        }
    }

    #[tokio::test]
    async fn copies_bytes_both_directions_independent_of_chunking() {
        let (remote_addr, received_on_remote) = spawn_echo_server().await;

        let dialer = Arc::new(TcpDialer);
        let mut tunnel = TunnelHandle::create(dialer, "127.0.0.1:0".parse().unwrap(), remote_addr)
            .await
            .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();

        let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let (mut client_read, mut client_write) = client.split();

        let writer = write_in_random_chunks(&mut client_write, &payload);
        let reader = async {
            let mut echoed = Vec::new();
            client_read.read_to_end(&mut echoed).await.unwrap();
            echoed
        };

        // Close the write half only after all bytes are flushed, so the
        // server sees EOF and the echoed reply can itself run to EOF.
        writer.await;
        client_write.shutdown().await.unwrap();
        let echoed = reader.await;

        assert_eq!(echoed, payload, "bytes read back through the tunnel must match exactly");

        let remote_received = received_on_remote.await.unwrap();
        assert_eq!(remote_received, payload, "bytes observed on the remote side must match exactly");

        tunnel.close().await;
    }
}
