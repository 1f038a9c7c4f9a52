//! Shared data model: the immutable snapshots exchanged between
//! the Registry, Provisioner, Supervisor and Lifecycle Manager, plus the
//! closed sum types that drive the Supervisor and Activity Tracker state
//! machines.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub use tokio_util::sync::CancellationToken as CancelToken;

/// Lifecycle status of a remote host as reported by the cloud API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Running,
    Initializing,
    Off,
    Deleting,
    Unknown,
}

impl HostStatus {
    pub fn is_running(self) -> bool {
        matches!(self, HostStatus::Running)
    }
}

/// Immutable snapshot of a remote machine as returned by the cloud API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub id: String,
    pub name: String,
    pub status: HostStatus,
    pub ipv4: String,
    pub volume_id: Option<String>,
    pub created_at: SystemTime,
}

/// Status of a data volume as reported by the cloud API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Available,
    Attached,
    Creating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub id: String,
    pub name: String,
    pub size_gib: u32,
    pub location: String,
    pub status: VolumeStatus,
}

/// Public-key credential as registered with the cloud provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub fingerprint: String,
    /// Normalised `type + payload` of the public key, comment stripped.
    /// Used to match an existing record instead of creating a duplicate.
    pub normalised_key: String,
}

/// Parameters for a new host, as consumed by `CloudApi::provision_host`.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub user_data: String,
    pub credential_id: String,
    pub volume_id: Option<String>,
}

/// The Supervisor's single state machine. Exactly one instance exists
/// per Supervisor.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Idle,
    Provisioning,
    Ready,
    Failed { last_error: String, retry_count: u32 },
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Idle
    }
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Provisioning => "provisioning",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

/// The reason `Activity Tracker::time_until_shutdown` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    ConnectionTimeout,
    ApproachingIdleTimeout,
    ApproachingConnectionTimeout,
}

impl ShutdownReason {
    pub fn is_due(self) -> bool {
        matches!(
            self,
            ShutdownReason::IdleTimeout | ShutdownReason::ConnectionTimeout
        )
    }
}
