use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::tunnel::TunnelHandle;

#[derive(Debug, Error)]
pub enum SshError {
    /// Permanent: the private key could not be read or parsed.
    #[error("failed to read SSH key at {path}: {source}")]
    KeyRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Permanent.
    #[error("SSH authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    /// Permanent: the configured host key fingerprint did not match.
    #[error("host key fingerprint mismatch for {host}: expected {expected}, got {actual}")]
    FingerprintMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// Transient: retryable by the caller.
    #[error("SSH connect to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    /// Transient.
    #[error("SSH connect to {host}:{port} failed: {message}")]
    ConnectFailed {
        host: String,
        port: u16,
        message: String,
    },

    #[error("SSH command failed: {0}")]
    CommandFailed(String),

    #[error("SSH command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("failed to set up tunnel: {0}")]
    TunnelSetup(String),

    #[error("session is not connected")]
    NotConnected,
}

impl SshError {
    /// Only connect-level network failures are retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SshError::ConnectTimeout { .. } | SshError::ConnectFailed { .. }
        )
    }
}

/// Host-key verification policy, selected from `Config` and handed down
/// to every SSH connect call the core makes (the Supervisor's session,
/// and the Readiness Prober's throwaway probe sessions alike).
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    /// Accept whatever key is presented on first connection.
    TrustOnFirstUse,
    /// Reject unless the presented key's fingerprint matches exactly.
    Pinned { fingerprint: String },
}

/// Contract consumed by the core. The one concrete implementation,
/// [`super::russh_transport::RusshTransport`], is built on the `russh`
/// crate so the Tunnel Handle can own real per-connection channels.
#[async_trait]
pub trait SshTransport: Send + Sync + Sized {
    async fn connect(
        host: &str,
        port: u16,
        user: &str,
        key_path: &Path,
        timeout: Duration,
        policy: HostKeyPolicy,
    ) -> Result<Self, SshError>;

    fn is_connected(&self) -> bool;

    async fn execute_command(&self, cmd: &str, deadline: Duration) -> Result<Vec<u8>, SshError>;

    async fn create_tunnel(
        &self,
        local_bind: SocketAddr,
        remote_addr: SocketAddr,
        deadline: Duration,
    ) -> Result<TunnelHandle, SshError>;

    async fn close(&self);
}
