//! In-memory fakes for the two external contracts (`CloudApi`,
//! `SshTransport`), used across the test modules in this crate so the
//! state machines in `supervisor`, `registry`, `provisioner` and
//! `lifecycle` can be exercised without real network or process I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::cloud::{CloudApi, CloudError};
use crate::model::{
    CancelToken, CredentialRecord, HostDescriptor, HostStatus, ProvisionSpec, VolumeDescriptor,
    VolumeStatus,
};
use crate::ssh::{ChannelDialer, HostKeyPolicy, SshError, SshTransport, TunnelHandle};

#[derive(Default)]
struct FakeCloudState {
    hosts: HashMap<String, HostDescriptor>,
    next_id: u64,
}

pub struct FakeCloudApi {
    state: Mutex<FakeCloudState>,
    destroy_calls: AtomicU32,
    provision_calls: AtomicU32,
    fail_provision: AtomicBool,
}

impl FakeCloudApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeCloudState::default()),
            destroy_calls: AtomicU32::new(0),
            provision_calls: AtomicU32::new(0),
            fail_provision: AtomicBool::new(false),
        }
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// After this is set, every subsequent `provision_host` call fails
    /// until it is cleared again.
    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    /// Seeds a running host directly, bypassing `provision_host`, for
    /// tests that start from "a host already exists".
    pub fn seed_running_host(&self, name: &str) -> HostDescriptor {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let host = HostDescriptor {
            id: state.next_id.to_string(),
            name: name.to_string(),
            status: HostStatus::Running,
            ipv4: "127.0.0.1".into(),
            volume_id: Some("1".into()),
            created_at: SystemTime::now(),
        };
        state.hosts.insert(host.id.clone(), host.clone());
        host
    }
}

#[async_trait]
impl CloudApi for FakeCloudApi {
    async fn list_hosts(&self, _ct: CancelToken) -> Result<Vec<HostDescriptor>, CloudError> {
        Ok(self.state.lock().unwrap().hosts.values().cloned().collect())
    }

    async fn get_host(&self, id: &str, _ct: CancelToken) -> Result<HostDescriptor, CloudError> {
        self.state
            .lock()
            .unwrap()
            .hosts
            .get(id)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn provision_host(
        &self,
        spec: ProvisionSpec,
        _ct: CancelToken,
    ) -> Result<HostDescriptor, CloudError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(CloudError::Http("provisioning disabled in fake".into()));
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let host = HostDescriptor {
            id: state.next_id.to_string(),
            name: spec.name,
            status: HostStatus::Running,
            ipv4: "127.0.0.1".into(),
            volume_id: spec.volume_id,
            created_at: SystemTime::now(),
        };
        state.hosts.insert(host.id.clone(), host.clone());
        Ok(host)
    }

    async fn destroy_host(&self, id: &str, _ct: CancelToken) -> Result<(), CloudError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().hosts.remove(id);
        Ok(())
    }

    async fn find_or_create_data_volume(
        &self,
        location: &str,
        size_gib: u32,
        _ct: CancelToken,
    ) -> Result<VolumeDescriptor, CloudError> {
        Ok(VolumeDescriptor {
            id: "1".into(),
            name: format!("{}-{}", crate::constants::DATA_VOLUME_SUBSTR, location),
            size_gib,
            location: location.to_string(),
            status: VolumeStatus::Available,
        })
    }

    async fn register_or_find_credential(
        &self,
        public_key: &str,
        _ct: CancelToken,
    ) -> Result<CredentialRecord, CloudError> {
        Ok(CredentialRecord {
            id: "1".into(),
            fingerprint: "SHA256:fake".into(),
            normalised_key: public_key.to_string(),
        })
    }
}

struct NullDialer;

#[async_trait]
impl ChannelDialer for NullDialer {
    type Stream = tokio::net::TcpStream;

    async fn dial(&self, _remote_addr: SocketAddr) -> Result<Self::Stream, SshError> {
        Err(SshError::TunnelSetup("fake dialer never actually connects".into()))
    }
}

/// Always-succeeds SSH session fake: connects instantly, answers every
/// `execute_command` with a fixed payload, and creates a real local
/// listener for `create_tunnel` (backed by a dialer nothing ever uses).
pub struct FakeSshTransport {
    connected: AtomicBool,
    pub command_calls: AtomicU32,
}

impl FakeSshTransport {
    pub fn command_call_count(&self) -> u32 {
        self.command_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshTransport for FakeSshTransport {
    async fn connect(
        _host: &str,
        _port: u16,
        _user: &str,
        _key_path: &Path,
        _timeout: Duration,
        _policy: HostKeyPolicy,
    ) -> Result<Self, SshError> {
        Ok(Self {
            connected: AtomicBool::new(true),
            command_calls: AtomicU32::new(0),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute_command(&self, _cmd: &str, _deadline: Duration) -> Result<Vec<u8>, SshError> {
        self.command_calls.fetch_add(1, Ordering::SeqCst);
        Ok(b"pong".to_vec())
    }

    async fn create_tunnel(
        &self,
        local_bind: SocketAddr,
        remote_addr: SocketAddr,
        _deadline: Duration,
    ) -> Result<TunnelHandle, SshError> {
        TunnelHandle::create(Arc::new(NullDialer), local_bind, remote_addr).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
