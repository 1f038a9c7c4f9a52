//! Provisioner: turns "no running host" into one healthy,
//! reachable remote host, or a clearly categorised failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cloud::{CloudApi, CloudError};
use crate::cloud_init::{self, CloudInitParams};
use crate::constants::{DEFAULT_KEEP_ALIVE_PORT, PROVISIONING_TOTAL_TIMEOUT_SECS, REMOTE_DOCKER_PORT};
use crate::keypair::{self, KeyPairError};
use crate::model::{CancelToken, HostDescriptor, ProvisionSpec};
use crate::readiness::ReadinessProber;
use crate::ssh::HostKeyPolicy;

#[derive(Debug, Error)]
#[allow(clippy::large_enum_variant)]
pub enum ProvisionError {
    #[error("failed to prepare SSH key pair: {0}")]
    KeyPair(#[from] KeyPairError),

    #[error("failed to render cloud-init payload: {0}")]
    CloudInit(#[from] crate::cloud_init::CloudInitError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The host was created but never became ready within the deadline.
    /// Carries the partial host's id so the caller can schedule cleanup.
    #[error("host {host_id} did not become ready within the deadline")]
    ReadinessTimeout { host_id: String },

    #[error("provisioning cancelled")]
    Cancelled,
}

/// Fallback image used when `preferred_images` is empty.
const DEFAULT_IMAGE: &str = "docker-ce";

pub struct ProvisionerConfig {
    pub server_type: String,
    pub location: String,
    pub volume_size_gib: u32,
    /// Candidate OS/application images, tried in order; the cloud API
    /// adapter is not asked to pick one itself, the Provisioner commits
    /// to the first preference (or [`DEFAULT_IMAGE`]) up front.
    pub preferred_images: Vec<String>,
    pub ssh_key_path: PathBuf,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Host-key policy applied to the Readiness Prober's throwaway probe
    /// sessions — the same one the Supervisor uses for its long-lived
    /// session, so a configured fingerprint is never silently ignored.
    pub host_key_policy: HostKeyPolicy,
}

pub struct Provisioner {
    cloud: Arc<dyn CloudApi>,
    config: ProvisionerConfig,
    prober: ReadinessProber,
}

impl Provisioner {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ProvisionerConfig) -> Self {
        let prober = ReadinessProber {
            host_key_policy: config.host_key_policy.clone(),
            ..ReadinessProber::default()
        };
        Self { cloud, config, prober }
    }

    /// Runs the full provisioning algorithm: key pair, credential, volume,
    /// cloud-init render, host creation, readiness wait.
    ///
    /// On readiness failure, the half-provisioned host is scheduled for
    /// background destruction before the error is returned — the caller
    /// never has to remember to clean it up.
    pub async fn provision(&self, ct: CancelToken) -> Result<HostDescriptor, ProvisionError> {
        if ct.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let public_key = keypair::read_or_generate(&self.config.ssh_key_path).await?;

        let credential = self
            .cloud
            .register_or_find_credential(&public_key, ct.clone())
            .await?;

        let volume = self
            .cloud
            .find_or_create_data_volume(&self.config.location, self.config.volume_size_gib, ct.clone())
            .await?;

        let user_data = cloud_init::render(&CloudInitParams {
            public_key: &public_key,
            data_volume_mount_point: "/var/lib/docker",
            docker_tcp_port: REMOTE_DOCKER_PORT,
            keep_alive_port: DEFAULT_KEEP_ALIVE_PORT,
        })?;

        let image = self
            .config
            .preferred_images
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let spec = ProvisionSpec {
            name: crate::id::host_name(),
            server_type: self.config.server_type.clone(),
            location: self.config.location.clone(),
            image,
            user_data,
            credential_id: credential.id,
            volume_id: Some(volume.id),
        };

        let host = self.cloud.provision_host(spec, ct.clone()).await?;

        let ready = tokio::select! {
            _ = ct.cancelled() => return Err(ProvisionError::Cancelled),
            ready = self.wait_ready(&host) => ready,
        };

        if ready {
            return Ok(host);
        }

        self.schedule_cleanup(host.id.clone());
        Err(ProvisionError::ReadinessTimeout { host_id: host.id })
    }

    async fn wait_ready(&self, host: &HostDescriptor) -> bool {
        self.prober
            .wait_ready(
                &host.ipv4,
                self.config.ssh_port,
                &self.config.ssh_user,
                &self.config.ssh_key_path,
            )
            .await
            .unwrap_or(false)
    }

    fn schedule_cleanup(&self, host_id: String) {
        let cloud = self.cloud.clone();
        tokio::spawn(async move {
            let ct = CancelToken::new();
            if let Err(e) = cloud.destroy_host(&host_id, ct).await {
                tracing::warn!(host_id, error = %e, "failed to clean up half-provisioned host");
            }
        });
    }
}

pub fn default_deadline() -> Duration {
    Duration::from_secs(PROVISIONING_TOTAL_TIMEOUT_SECS)
}

pub fn default_key_path() -> PathBuf {
    Path::new(crate::constants::DEFAULT_SSH_KEY_PATH).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeCloudApi;

    fn config() -> ProvisionerConfig {
        ProvisionerConfig {
            server_type: "cpx21".into(),
            location: "fsn1".into(),
            volume_size_gib: 10,
            preferred_images: Vec::new(),
            ssh_key_path: std::env::temp_dir().join("dockbridge-test-key"),
            ssh_user: "root".into(),
            ssh_port: 22,
            host_key_policy: HostKeyPolicy::TrustOnFirstUse,
        }
    }

    #[tokio::test]
    async fn readiness_timeout_schedules_cleanup_and_reports_host_id() {
        let _ = tokio::fs::remove_file(config().ssh_key_path).await;
        let fake = Arc::new(FakeCloudApi::new());
        let provisioner = Provisioner {
            cloud: fake.clone(),
            config: config(),
            prober: ReadinessProber {
                total_deadline: Duration::from_millis(1),
                poll_period: Duration::from_millis(1),
                step_timeout: Duration::from_millis(1),
                host_key_policy: HostKeyPolicy::TrustOnFirstUse,
            },
        };

        let result = provisioner.provision(CancelToken::new()).await;
        match result {
            Err(ProvisionError::ReadinessTimeout { host_id }) => {
                assert!(!host_id.is_empty());
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }

        tokio::task::yield_now().await;
        assert_eq!(fake.destroy_calls(), 1);
        let _ = tokio::fs::remove_file(config().ssh_key_path).await;
        let _ = tokio::fs::remove_file(config().ssh_key_path.with_extension("pub")).await;
    }
}
