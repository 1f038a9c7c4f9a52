use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CancelToken, CredentialRecord, HostDescriptor, ProvisionSpec, VolumeDescriptor};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud API request failed: {0}")]
    Http(String),

    /// A "not found" response. This is a valid successful outcome for
    /// `destroy_host`, so it is modelled as its own variant rather than
    /// folded into `Http`.
    #[error("not found")]
    NotFound,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to decode cloud API response: {0}")]
    Decode(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CloudError {
    /// Substring match for "not found"/"server not found"/"not_found".
    pub fn is_not_found_message(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("not found") || lower.contains("not_found")
    }
}

/// Operations the core invokes on the cloud provider, each cancellable.
/// The absence of a `delete_volume` method is deliberate: the core must
/// never be able to destroy a data volume.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_hosts(&self, ct: CancelToken) -> Result<Vec<HostDescriptor>, CloudError>;

    async fn get_host(&self, id: &str, ct: CancelToken) -> Result<HostDescriptor, CloudError>;

    /// Blocks until the create-host action completes.
    async fn provision_host(
        &self,
        spec: ProvisionSpec,
        ct: CancelToken,
    ) -> Result<HostDescriptor, CloudError>;

    /// Idempotent: a "not found" response is a successful outcome.
    async fn destroy_host(&self, id: &str, ct: CancelToken) -> Result<(), CloudError>;

    async fn find_or_create_data_volume(
        &self,
        location: &str,
        size_gib: u32,
        ct: CancelToken,
    ) -> Result<VolumeDescriptor, CloudError>;

    async fn register_or_find_credential(
        &self,
        public_key: &str,
        ct: CancelToken,
    ) -> Result<CredentialRecord, CloudError>;
}
