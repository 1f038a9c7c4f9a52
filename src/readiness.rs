//! Readiness Prober: polls a freshly provisioned host over SSH
//! until the remote Docker daemon answers on both its local CLI and its
//! TCP listener, or a deadline elapses.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::constants::{
    DAEMON_PING_TIMEOUT_SECS, READINESS_POLL_PERIOD_SECS, READINESS_STEP_TIMEOUT_SECS,
    READINESS_TOTAL_TIMEOUT_SECS, REMOTE_DOCKER_PORT,
};
use crate::ssh::{HostKeyPolicy, RusshTransport, SshTransport};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("readiness probe deadline elapsed after {0:?}")]
    DeadlineElapsed(Duration),
}

const READY_MARKER: &str = "DOCKBRIDGE_READY";

fn compound_check_command() -> String {
    format!(
        "(systemctl is-active --quiet docker && curl -sf -o /dev/null http://127.0.0.1:{REMOTE_DOCKER_PORT}/_ping) \
         && echo {READY_MARKER} || echo DOCKBRIDGE_NOT_READY"
    )
}

pub struct ReadinessProber {
    pub total_deadline: Duration,
    pub poll_period: Duration,
    pub step_timeout: Duration,
    /// The same host-key policy the Supervisor's long-lived session uses,
    /// so a configured fingerprint is honoured on these throwaway probe
    /// sessions too.
    pub host_key_policy: HostKeyPolicy,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self {
            total_deadline: Duration::from_secs(READINESS_TOTAL_TIMEOUT_SECS),
            poll_period: Duration::from_secs(READINESS_POLL_PERIOD_SECS),
            step_timeout: Duration::from_secs(READINESS_STEP_TIMEOUT_SECS),
            host_key_policy: HostKeyPolicy::TrustOnFirstUse,
        }
    }
}

impl ReadinessProber {
    /// Polls `host:port` until both checks succeed in one tick, or
    /// `self.total_deadline` elapses.
    pub async fn wait_ready(
        &self,
        host: &str,
        port: u16,
        user: &str,
        key_path: &Path,
    ) -> Result<bool, ProbeError> {
        let start = Instant::now();
        let mut tick: u64 = 0;

        loop {
            if start.elapsed() >= self.total_deadline {
                return Ok(false);
            }

            tick += 1;
            if tick % 2 == 0 {
                tracing::info!(elapsed = ?start.elapsed(), host, "still waiting for remote Docker daemon");
            }

            if self.probe_once(host, port, user, key_path).await {
                return Ok(true);
            }

            let remaining = self.total_deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_period.min(remaining)).await;
        }
    }

    async fn probe_once(&self, host: &str, port: u16, user: &str, key_path: &Path) -> bool {
        let attempt = async {
            let transport = RusshTransport::connect_with_policy(
                host,
                port,
                user,
                key_path,
                self.step_timeout,
                self.host_key_policy.clone(),
            )
            .await
            .ok()?;

            let output = transport
                .execute_command(&compound_check_command(), Duration::from_secs(DAEMON_PING_TIMEOUT_SECS))
                .await
                .ok()?;
            transport.close().await;

            Some(String::from_utf8_lossy(&output).contains(READY_MARKER))
        };

        tokio::time::timeout(self.step_timeout, attempt)
            .await
            .ok()
            .flatten()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_command_checks_both_daemon_and_tcp_listener() {
        let cmd = compound_check_command();
        assert!(cmd.contains("systemctl is-active"));
        assert!(cmd.contains("curl"));
        assert!(cmd.contains(&REMOTE_DOCKER_PORT.to_string()));
        assert!(cmd.contains(READY_MARKER));
    }
}
