//! The `Bridge` root object: one instance per process, built explicitly
//! from `Config`, owning every long-running task and torn down together
//! on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::cloud::hetzner::HetznerApi;
use crate::cloud::CloudApi;
use crate::config::Config;
use crate::control::{self, ControlHandler};
use crate::error::Error;
use crate::lifecycle::LifecycleManager;
use crate::provisioner::{Provisioner, ProvisionerConfig};
use crate::relay::Relay;
use crate::ssh::RusshTransport;
use crate::supervisor::{Supervisor, SshEndpoint};

pub struct Bridge {
    config: Config,
    supervisor: Arc<Supervisor<RusshTransport>>,
    activity: Arc<ActivityTracker>,
    lifecycle: Arc<LifecycleManager>,
    relay: Relay<RusshTransport>,
}

impl Bridge {
    pub fn new(config: Config) -> Result<Self, Error> {
        let cloud: Arc<dyn CloudApi> = Arc::new(HetznerApi::new(config.api_token.clone()));
        let host_key_policy = config.host_key_policy();

        let provisioner = Provisioner::new(
            cloud.clone(),
            ProvisionerConfig {
                server_type: config.server_type.clone(),
                location: config.location.clone(),
                volume_size_gib: config.volume_size_gib,
                preferred_images: config.preferred_images.clone(),
                ssh_key_path: config.ssh_key_path.clone(),
                ssh_user: config.ssh_user.clone(),
                ssh_port: config.ssh_port,
                host_key_policy: host_key_policy.clone(),
            },
        );

        let supervisor = Arc::new(Supervisor::new(
            cloud.clone(),
            provisioner,
            SshEndpoint {
                port: config.ssh_port,
                user: config.ssh_user.clone(),
                key_path: config.ssh_key_path.clone(),
                local_tunnel_bind: config.local_tunnel_bind(),
                host_key_policy,
            },
        ));

        let activity = Arc::new(ActivityTracker::new(
            Duration::from_secs(config.idle_timeout_secs),
            Duration::from_secs(config.connection_timeout_secs),
        ));
        activity.register_callback(Box::new(|| tracing::trace!("activity observed")));

        let lifecycle = Arc::new(LifecycleManager::new(
            cloud.clone(),
            activity.clone(),
            config.grace_period_secs,
        ));

        let relay = Relay::new(
            supervisor.clone(),
            activity.clone(),
            config.socket_path.clone(),
            crate::provisioner::default_deadline(),
        );

        Ok(Self {
            config,
            supervisor,
            activity,
            lifecycle,
            relay,
        })
    }

    /// Runs the Relay, Lifecycle Manager, and control socket until a
    /// signal arrives or a `stop` request is received on the control
    /// socket.
    pub async fn run(self) -> Result<(), Error> {
        let cancel = CancellationToken::new();

        let control_handler: Arc<dyn ControlHandler> = Arc::new(BridgeControlHandler {
            supervisor: self.supervisor.clone(),
            activity: self.activity.clone(),
            cancel: cancel.clone(),
        });

        let ctl_path = self.config.control_socket_path();
        let control_cancel = cancel.clone();
        let control_task = tokio::spawn(async move {
            if let Err(e) = control::serve(&ctl_path, control_handler, control_cancel).await {
                tracing::error!(error = %e, "control socket server failed");
            }
        });

        let lifecycle = self.lifecycle.clone();
        let lifecycle_cancel = cancel.clone();
        let lifecycle_task = tokio::spawn(async move {
            lifecycle.run(lifecycle_cancel).await;
        });

        let relay_cancel = cancel.clone();
        let relay_task = tokio::spawn(async move {
            if let Err(e) = self.relay.serve(relay_cancel).await {
                tracing::error!(error = %e, "relay failed");
            }
        });

        wait_for_shutdown_signal(cancel.clone()).await;
        cancel.cancel();

        let _ = tokio::join!(control_task, lifecycle_task, relay_task);
        Ok(())
    }
}

struct BridgeControlHandler {
    supervisor: Arc<Supervisor<RusshTransport>>,
    activity: Arc<ActivityTracker>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl ControlHandler for BridgeControlHandler {
    async fn status(&self) -> (String, u64) {
        let state = self.supervisor.state().await;
        let (remaining, _) = self.activity.time_until_shutdown();
        (state.label().to_string(), remaining.as_secs())
    }

    fn request_stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c, shutting down"),
    }
}
