//! [`SshTransport`] adapter built on `russh`, chosen over a process-backed
//! `ssh` wrapper because it exposes a channel-level API: opening a direct
//! TCP/IP channel per forwarded connection without delegating the accept
//! loop to an external process.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::Mutex;

use super::tunnel::{ChannelDialer, TunnelHandle};
use super::transport::{HostKeyPolicy, SshError, SshTransport};

/// Filled in by `ClientHandler::check_server_key` when a `Pinned` policy
/// rejects the presented key, so the caller can report the precise
/// `SshError::FingerprintMismatch` instead of a generic connect failure.
type MismatchSlot = Arc<std::sync::Mutex<Option<(String, String)>>>;

struct ClientHandler {
    host: String,
    policy: HostKeyPolicy,
    mismatch: MismatchSlot,
}

#[async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::TrustOnFirstUse => Ok(true),
            HostKeyPolicy::Pinned { fingerprint } => {
                let actual = server_public_key.fingerprint();
                if &actual == fingerprint {
                    Ok(true)
                } else {
                    tracing::error!(
                        host = %self.host,
                        expected = %fingerprint,
                        actual = %actual,
                        "host key fingerprint mismatch"
                    );
                    *self.mismatch.lock().unwrap() = Some((fingerprint.clone(), actual));
                    Ok(false)
                }
            }
        }
    }
}

pub struct RusshTransport {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    host: String,
    port: u16,
    connected: Arc<AtomicBool>,
}

impl RusshTransport {
    pub async fn connect_with_policy(
        host: &str,
        port: u16,
        user: &str,
        key_path: &Path,
        timeout: Duration,
        policy: HostKeyPolicy,
    ) -> Result<Self, SshError> {
        let key_pair = russh_keys::load_secret_key(key_path, None).map_err(|e| SshError::KeyRead {
            path: key_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;

        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(crate::constants::DEFAULT_SSH_KEEP_ALIVE_SECS)),
            ..Default::default()
        });
        let mismatch: MismatchSlot = Arc::new(std::sync::Mutex::new(None));
        let handler = ClientHandler {
            host: host.to_string(),
            policy,
            mismatch: mismatch.clone(),
        };

        let connect_fut = russh::client::connect(config, (host, port), handler);
        let mut handle = match tokio::time::timeout(timeout, connect_fut).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                if let Some((expected, actual)) = mismatch.lock().unwrap().take() {
                    return Err(SshError::FingerprintMismatch {
                        host: host.to_string(),
                        expected,
                        actual,
                    });
                }
                return Err(SshError::ConnectFailed {
                    host: host.to_string(),
                    port,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SshError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                })
            }
        };

        let authenticated = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| SshError::ConnectFailed {
                host: host.to_string(),
                port,
                message: e.to_string(),
            })?;

        if !authenticated {
            return Err(SshError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            });
        }

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            host: host.to_string(),
            port,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn connect(
        host: &str,
        port: u16,
        user: &str,
        key_path: &Path,
        timeout: Duration,
        policy: HostKeyPolicy,
    ) -> Result<Self, SshError> {
        Self::connect_with_policy(host, port, user, key_path, timeout, policy).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute_command(&self, cmd: &str, deadline: Duration) -> Result<Vec<u8>, SshError> {
        let run = async {
            let mut channel = {
                let handle = self.handle.lock().await;
                handle
                    .channel_open_session()
                    .await
                    .map_err(|e| SshError::CommandFailed(e.to_string()))?
            };

            channel
                .exec(true, cmd)
                .await
                .map_err(|e| SshError::CommandFailed(e.to_string()))?;

            let mut output = Vec::new();
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, .. }) => output.extend_from_slice(&data),
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::ExitStatus { .. }) => break,
                    Some(_) => continue,
                    None => break,
                }
            }
            Ok(output)
        };

        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(SshError::CommandTimeout(deadline))
            }
        }
    }

    async fn create_tunnel(
        &self,
        local_bind: SocketAddr,
        remote_addr: SocketAddr,
        deadline: Duration,
    ) -> Result<TunnelHandle, SshError> {
        let dialer = Arc::new(RusshDialer {
            handle: self.handle.clone(),
        });
        tokio::time::timeout(deadline, TunnelHandle::create(dialer, local_bind, remote_addr))
            .await
            .map_err(|_| SshError::TunnelSetup("timed out creating tunnel".into()))?
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "bridge shutdown", "en")
            .await;
    }
}

struct RusshDialer {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
}

#[async_trait]
impl ChannelDialer for RusshDialer {
    type Stream = russh::ChannelStream<Msg>;

    async fn dial(&self, remote_addr: SocketAddr) -> Result<Self::Stream, SshError> {
        let channel: Channel<Msg> = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(
                    remote_addr.ip().to_string(),
                    remote_addr.port() as u32,
                    "127.0.0.1",
                    0,
                )
                .await
                .map_err(|e| SshError::TunnelSetup(e.to_string()))?
        };
        Ok(channel.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_policy_carries_fingerprint() {
        let policy = HostKeyPolicy::Pinned {
            fingerprint: "SHA256:abc".into(),
        };
        match policy {
            HostKeyPolicy::Pinned { fingerprint } => assert_eq!(fingerprint, "SHA256:abc"),
            _ => panic!("expected pinned policy"),
        }
    }
}
