//! Connection Supervisor: the single-writer state machine that turns
//! "the Relay needs a working tunnel" into either a ready tunnel or a
//! clearly propagated error.
//!
//! Concurrency note: whichever `ensure()` call transitions the state out of
//! `Idle`/`Failed` becomes the sole *driver* of the resulting provisioning
//! attempt, which runs on its own detached task. Every other concurrent
//! caller (including the driver's own caller, once its deadline elapses)
//! only ever waits on a `Notify` for that attempt to finish — nobody but
//! the driver touches the Registry/Provisioner/SSH transport, so at most
//! one provisioning attempt is ever in flight. A caller that times out
//! stops waiting but never cancels the driver's task: per the
//! specification, a cancelled caller frees its own resources while
//! background provisioning, once started, always runs to completion.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::cloud::CloudApi;
use crate::constants::{
    DAEMON_PING_RETRY_GAP_SECS, DAEMON_PING_TIMEOUT_SECS, DAEMON_PING_VERIFY_ATTEMPTS,
    REMOTE_DOCKER_PORT, SSH_CONNECT_ATTEMPTS, SSH_CONNECT_BACKOFF_STEP_SECS,
    SSH_CONNECT_TIMEOUT_SECS, SUPERVISOR_BACKOFF_BASE_SECS, SUPERVISOR_BACKOFF_CAP_SECS,
};
use crate::model::{CancelToken, ConnectionState, HostDescriptor};
use crate::provisioner::{ProvisionError, Provisioner};
use crate::registry::{Registry, RegistryError};
use crate::ssh::{HostKeyPolicy, SshError, SshTransport, TunnelHandle};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("ensure() deadline exceeded")]
    DeadlineExceeded,
    /// A prior attempt failed and the backoff window has not yet elapsed;
    /// carries the prior attempt's error without retrying.
    #[error("connection failed previously and is backing off: {0}")]
    Backoff(String),
}

/// Static SSH connection parameters.
pub struct SshEndpoint {
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub local_tunnel_bind: SocketAddr,
    pub host_key_policy: HostKeyPolicy,
}

/// `min(cap, base * 2^retry_count)`, with no randomization — the
/// deterministic envelope `backoff_for` jitters around.
fn backoff_base(retry_count: u32) -> Duration {
    let exp = retry_count.min(6);
    let secs = SUPERVISOR_BACKOFF_BASE_SECS.saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(SUPERVISOR_BACKOFF_CAP_SECS))
}

/// Exponential backoff with base 1s, cap 60s, and ±20% jitter, applied
/// before retrying `ensure()` after a prior failure so that many
/// supervisors failing in lockstep don't all retry on the same tick.
fn backoff_for(retry_count: u32) -> Duration {
    let base = backoff_base(retry_count);
    let factor = rand::rng().random_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

struct Inner<T: SshTransport> {
    state: ConnectionState,
    session: Option<T>,
    tunnel: Option<TunnelHandle>,
    host: Option<HostDescriptor>,
    /// When the state last became `Failed`, used to honor the computed
    /// backoff window rather than re-sleeping it on every call.
    failed_at: Option<Instant>,
    /// The jittered backoff window computed once at the moment of the
    /// `Failed` transition, so repeated `ensure()` calls against the same
    /// failure all honor the same window instead of re-rolling it.
    backoff_duration: Option<Duration>,
}

impl<T: SshTransport> Inner<T> {
    fn teardown(&mut self) {
        self.session = None;
        self.tunnel = None;
        self.host = None;
    }
}

pub struct Supervisor<T: SshTransport> {
    registry: Registry,
    provisioner: Provisioner,
    ssh: SshEndpoint,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: SshTransport + 'static> Supervisor<T> {
    pub fn new(cloud: Arc<dyn CloudApi>, provisioner: Provisioner, ssh: SshEndpoint) -> Self {
        Self {
            registry: Registry::new(cloud),
            provisioner,
            ssh,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                session: None,
                tunnel: None,
                host: None,
                failed_at: None,
                backoff_duration: None,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn local_tunnel_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.tunnel.as_ref().map(TunnelHandle::local_addr)
    }

    /// Ensures a ready, healthy tunnel exists within `deadline`,
    /// provisioning and (re)connecting as needed. `deadline` bounds only
    /// this call; it never aborts a provisioning attempt already under way.
    pub async fn ensure(self: &Arc<Self>, deadline: Duration) -> Result<(), SupervisorError> {
        match tokio::time::timeout(deadline, self.ensure_loop()).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::DeadlineExceeded),
        }
    }

    async fn ensure_loop(self: &Arc<Self>) -> Result<(), SupervisorError> {
        loop {
            enum Step {
                Done(Result<(), SupervisorError>),
                Wait,
            }

            let step = {
                let mut inner = self.inner.lock().await;
                match &inner.state {
                    ConnectionState::Ready => {
                        drop(inner);
                        if self.health_check().await.is_ok() {
                            Step::Done(Ok(()))
                        } else {
                            let mut inner = self.inner.lock().await;
                            if matches!(inner.state, ConnectionState::Ready) {
                                inner.teardown();
                                inner.state = ConnectionState::Provisioning;
                                drop(inner);
                                self.spawn_driver();
                            }
                            Step::Wait
                        }
                    }
                    ConnectionState::Idle => {
                        inner.state = ConnectionState::Provisioning;
                        drop(inner);
                        self.spawn_driver();
                        Step::Wait
                    }
                    ConnectionState::Provisioning => Step::Wait,
                    ConnectionState::Failed { last_error, retry_count } => {
                        let backoff = inner.backoff_duration.unwrap_or_else(|| backoff_for(*retry_count));
                        let elapsed = inner.failed_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                        if elapsed >= backoff {
                            inner.state = ConnectionState::Provisioning;
                            drop(inner);
                            self.spawn_driver();
                            Step::Wait
                        } else {
                            Step::Done(Err(SupervisorError::Backoff(last_error.clone())))
                        }
                    }
                }
            };

            match step {
                Step::Done(result) => return result,
                Step::Wait => self.notify.notified().await,
            }
        }
    }

    /// Spawns the actual provisioning sequence on its own task so it keeps
    /// running even if the caller that triggered it stops waiting.
    fn spawn_driver(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.drive_provisioning().await;
            this.notify.notify_waiters();
        });
    }

    async fn drive_provisioning(&self) {
        let ct = CancelToken::new();
        match self.run_provisioning_sequence(ct).await {
            Ok((host, session, tunnel)) => {
                let mut inner = self.inner.lock().await;
                inner.host = Some(host);
                inner.session = Some(session);
                inner.tunnel = Some(tunnel);
                inner.state = ConnectionState::Ready;
                inner.failed_at = None;
                inner.backoff_duration = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "provisioning attempt failed");
                let mut inner = self.inner.lock().await;
                let retry_count = match &inner.state {
                    ConnectionState::Failed { retry_count, .. } => retry_count + 1,
                    _ => 0,
                };
                inner.teardown();
                inner.state = ConnectionState::Failed { last_error: e.to_string(), retry_count };
                inner.failed_at = Some(Instant::now());
                inner.backoff_duration = Some(backoff_for(retry_count));
            }
        }
    }

    /// Host → SSH connect → tunnel → readiness verification. On an SSH
    /// connect failure exhausting all attempts, the host is scrapped and a
    /// fresh one is provisioned, with the whole sequence retried exactly
    /// once more.
    async fn run_provisioning_sequence(
        &self,
        ct: CancelToken,
    ) -> Result<(HostDescriptor, T, TunnelHandle), SupervisorError> {
        let host = self.obtain_host(ct.clone()).await?;

        match self.establish(&host).await {
            Ok((session, tunnel)) => Ok((host, session, tunnel)),
            Err(first_err) => {
                tracing::warn!(
                    host_id = %host.id,
                    error = %first_err,
                    "SSH connect exhausted retries, provisioning a fresh host"
                );
                self.registry.cleanup_async(vec![host]);

                let fresh_host = self.provisioner.provision(ct).await?;
                let (session, tunnel) = self.establish(&fresh_host).await?;
                Ok((fresh_host, session, tunnel))
            }
        }
    }

    async fn establish(&self, host: &HostDescriptor) -> Result<(T, TunnelHandle), SupervisorError> {
        let session = self.connect_with_retry(host).await?;
        let tunnel = self.create_tunnel(&session, host).await?;
        self.verify_ready(&session).await?;
        Ok((session, tunnel))
    }

    async fn obtain_host(&self, ct: CancelToken) -> Result<HostDescriptor, SupervisorError> {
        if let Some(host) = self.registry.reconcile(ct.clone()).await? {
            return Ok(host);
        }

        match self.provisioner.provision(ct.clone()).await {
            Ok(host) => Ok(host),
            Err(first_err) => {
                tracing::warn!(error = %first_err, "provisioning failed, retrying once");
                Ok(self.provisioner.provision(ct).await?)
            }
        }
    }

    async fn connect_with_retry(&self, host: &HostDescriptor) -> Result<T, SupervisorError> {
        let mut last_err = None;
        for attempt in 0..SSH_CONNECT_ATTEMPTS {
            match T::connect(
                &host.ipv4,
                self.ssh.port,
                &self.ssh.user,
                &self.ssh.key_path,
                Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
                self.ssh.host_key_policy.clone(),
            )
            .await
            {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient() && attempt + 1 < SSH_CONNECT_ATTEMPTS => {
                    let backoff = Duration::from_secs(SSH_CONNECT_BACKOFF_STEP_SECS * (attempt as u64 + 1));
                    tracing::warn!(attempt, error = %e, ?backoff, "SSH connect failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.expect("loop runs at least once and only exits early on success").into())
    }

    async fn create_tunnel(&self, session: &T, host: &HostDescriptor) -> Result<TunnelHandle, SupervisorError> {
        let remote_ip = host
            .ipv4
            .parse()
            .map_err(|_| SupervisorError::HealthCheck("host has no valid IPv4 address".into()))?;
        let remote_addr = SocketAddr::new(remote_ip, REMOTE_DOCKER_PORT);

        Ok(session
            .create_tunnel(
                self.ssh.local_tunnel_bind,
                remote_addr,
                Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
            )
            .await?)
    }

    /// Up to 10 pings, 10s per-ping timeout, 3s gap, through the freshly
    /// created tunnel/session, run once right after provisioning (distinct
    /// from the cheap single-ping `health_check` used to validate an
    /// already-`Ready` connection).
    async fn verify_ready(&self, session: &T) -> Result<(), SupervisorError> {
        let check = format!("curl -sf -o /dev/null http://127.0.0.1:{REMOTE_DOCKER_PORT}/_ping");
        let mut last_err = None;
        for attempt in 0..DAEMON_PING_VERIFY_ATTEMPTS {
            match session
                .execute_command(&check, Duration::from_secs(DAEMON_PING_TIMEOUT_SECS))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "daemon ping not ready yet, retrying");
                    last_err = Some(e);
                    if attempt + 1 < DAEMON_PING_VERIFY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(DAEMON_PING_RETRY_GAP_SECS)).await;
                    }
                }
            }
        }
        Err(SupervisorError::HealthCheck(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "daemon never responded".into()),
        ))
    }

    /// Session connected, tunnel present, and a daemon ping round-trips
    /// within the timeout — the fast path for an already-`Ready` state.
    async fn health_check(&self) -> Result<(), String> {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref().ok_or("no active SSH session")?;
        if !session.is_connected() {
            return Err("SSH session reports disconnected".into());
        }
        if inner.tunnel.is_none() {
            return Err("no active tunnel".into());
        }
        let check = format!("curl -sf -o /dev/null http://127.0.0.1:{REMOTE_DOCKER_PORT}/_ping");
        session
            .execute_command(&check, Duration::from_secs(DAEMON_PING_TIMEOUT_SECS))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::{Provisioner, ProvisionerConfig};
    use crate::testutil::{FakeCloudApi, FakeSshTransport};

    fn test_supervisor(cloud: Arc<FakeCloudApi>) -> Arc<Supervisor<FakeSshTransport>> {
        let key_path = std::env::temp_dir().join(format!(
            "dockbridge-supervisor-test-{}-{}",
            std::process::id(),
            backoff_base(0).as_nanos()
        ));
        let provisioner = Provisioner::new(
            cloud.clone(),
            ProvisionerConfig {
                server_type: "cpx21".into(),
                location: "fsn1".into(),
                volume_size_gib: 10,
                preferred_images: Vec::new(),
                ssh_key_path: key_path,
                ssh_user: "root".into(),
                ssh_port: 22,
                host_key_policy: HostKeyPolicy::TrustOnFirstUse,
            },
        );
        Arc::new(Supervisor::new(
            cloud,
            provisioner,
            SshEndpoint {
                port: 22,
                user: "root".into(),
                key_path: PathBuf::from("/dev/null"),
                local_tunnel_bind: "127.0.0.1:0".parse().unwrap(),
                host_key_policy: HostKeyPolicy::TrustOnFirstUse,
            },
        ))
    }

    /// When the registry already finds a running host, `ensure()` must
    /// reuse it instead of provisioning a new one.
    #[tokio::test]
    async fn ensure_reuses_existing_running_host_without_provisioning() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.seed_running_host("dockbridge-existing");
        let supervisor = test_supervisor(cloud.clone());

        supervisor.ensure(Duration::from_secs(5)).await.unwrap();

        assert_eq!(cloud.provision_calls(), 0);
        assert!(matches!(supervisor.state().await, ConnectionState::Ready));
        assert!(supervisor.local_tunnel_addr().await.is_some());
    }

    /// A second `ensure()` call against an already-ready supervisor must
    /// short-circuit on the health check rather than re-provisioning.
    #[tokio::test]
    async fn ensure_is_idempotent_once_ready() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.seed_running_host("dockbridge-existing");
        let supervisor = test_supervisor(cloud.clone());

        supervisor.ensure(Duration::from_secs(5)).await.unwrap();
        supervisor.ensure(Duration::from_secs(5)).await.unwrap();

        assert_eq!(cloud.provision_calls(), 0);
    }

    /// Ten concurrent callers against an `Idle` supervisor must trigger
    /// exactly one `provision_host` call, and all ten must eventually
    /// observe `Ready`.
    #[tokio::test]
    async fn concurrent_ensure_calls_provision_exactly_once() {
        let cloud = Arc::new(FakeCloudApi::new());
        let supervisor = test_supervisor(cloud.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let supervisor = supervisor.clone();
            handles.push(tokio::spawn(async move {
                supervisor.ensure(Duration::from_secs(5)).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(cloud.provision_calls(), 1);
        assert!(matches!(supervisor.state().await, ConnectionState::Ready));
    }

    #[test]
    fn backoff_base_is_non_decreasing_until_cap() {
        let mut prev = Duration::ZERO;
        for n in 0..12 {
            let current = backoff_base(n);
            assert!(current >= prev, "backoff decreased at retry {n}");
            prev = current;
        }
        assert_eq!(prev, Duration::from_secs(SUPERVISOR_BACKOFF_CAP_SECS));
    }

    #[test]
    fn backoff_for_applies_up_to_20_percent_jitter() {
        for n in 0..8 {
            let base = backoff_base(n).as_secs_f64();
            for _ in 0..50 {
                let jittered = backoff_for(n).as_secs_f64();
                assert!(
                    jittered >= base * 0.8 - f64::EPSILON && jittered <= base * 1.2 + f64::EPSILON,
                    "jittered backoff {jittered} out of ±20% range around base {base}"
                );
            }
        }
    }

    /// After a provisioning failure, a second `ensure()` call made before
    /// the backoff window elapses must report the prior error without
    /// attempting again (no additional `provision_host` call).
    #[tokio::test]
    async fn ensure_after_failure_is_denied_until_backoff_elapses() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.set_fail_provision(true);
        let supervisor = test_supervisor(cloud.clone());

        let first = supervisor.ensure(Duration::from_secs(5)).await;
        assert!(first.is_err());
        let calls_after_first = cloud.provision_calls();
        assert!(calls_after_first >= 1);

        let second = supervisor.ensure(Duration::from_secs(5)).await;
        assert!(matches!(second, Err(SupervisorError::Backoff(_))));
        assert_eq!(cloud.provision_calls(), calls_after_first);
    }

    #[test]
    fn backoff_base_starts_at_base() {
        assert_eq!(backoff_base(0), Duration::from_secs(SUPERVISOR_BACKOFF_BASE_SECS));
    }

    /// A caller whose own deadline elapses mid-provisioning must not tear
    /// down the in-flight attempt: a later call still observes `Ready`
    /// once the background driver finishes.
    #[tokio::test]
    async fn timed_out_caller_does_not_abort_background_provisioning() {
        let cloud = Arc::new(FakeCloudApi::new());
        let supervisor = test_supervisor(cloud.clone());

        let result = supervisor.ensure(Duration::from_nanos(1)).await;
        assert!(matches!(result, Err(SupervisorError::DeadlineExceeded)));

        // Give the detached driver task a chance to run to completion.
        for _ in 0..50 {
            if matches!(supervisor.state().await, ConnectionState::Ready) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(supervisor.state().await, ConnectionState::Ready));
        assert_eq!(cloud.provision_calls(), 1);
    }
}
