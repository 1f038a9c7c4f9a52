//! Remote Host Registry: enumerates existing prefixed hosts,
//! classifies them running/stale, selects one, and triggers asynchronous
//! cleanup of the rest.

use std::sync::Arc;

use thiserror::Error;

use crate::cloud::{CloudApi, CloudError};
use crate::constants::HOST_NAME_PREFIX;
use crate::model::{CancelToken, HostDescriptor};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

pub struct Registry {
    cloud: Arc<dyn CloudApi>,
}

impl Registry {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self { cloud }
    }

    /// All hosts whose name starts with the fixed prefix.
    pub async fn list_candidates(&self, ct: CancelToken) -> Result<Vec<HostDescriptor>, RegistryError> {
        let hosts = self.cloud.list_hosts(ct).await?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.name.starts_with(HOST_NAME_PREFIX))
            .collect())
    }

    /// Partitions candidates into running / stale.
    pub fn classify(candidates: Vec<HostDescriptor>) -> (Vec<HostDescriptor>, Vec<HostDescriptor>) {
        candidates.into_iter().partition(|h| h.status.is_running())
    }

    /// Deterministic selection: the most recently created running host.
    pub fn select(running: &[HostDescriptor]) -> Option<&HostDescriptor> {
        running.iter().max_by_key(|h| h.created_at)
    }

    /// Enqueues destroys on a background task that never blocks the
    /// caller. Cleanup errors are logged, not surfaced.
    pub fn cleanup_async(&self, stale: Vec<HostDescriptor>) {
        if stale.is_empty() {
            return;
        }
        let cloud = self.cloud.clone();
        tokio::spawn(async move {
            for host in stale {
                let ct = CancelToken::new();
                if let Err(e) = cloud.destroy_host(&host.id, ct).await {
                    tracing::warn!(host_id = %host.id, error = %e, "background host cleanup failed");
                }
            }
        });
    }

    /// Lists, classifies, selects, and enqueues cleanup of everything not
    /// selected, in one round.
    pub async fn reconcile(&self, ct: CancelToken) -> Result<Option<HostDescriptor>, RegistryError> {
        let candidates = self.list_candidates(ct).await?;
        let (running, stale) = Self::classify(candidates);

        let selected = Self::select(&running).cloned();

        let mut to_destroy = stale;
        to_destroy.extend(
            running
                .into_iter()
                .filter(|h| Some(h.id.as_str()) != selected.as_ref().map(|s| s.id.as_str())),
        );
        self.cleanup_async(to_destroy);

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::model::HostStatus;

    fn host(name: &str, status: HostStatus, age_secs: u64) -> HostDescriptor {
        HostDescriptor {
            id: name.to_string(),
            name: name.to_string(),
            status,
            ipv4: "127.0.0.1".into(),
            volume_id: None,
            created_at: SystemTime::now() - Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn classify_splits_running_from_stale() {
        let hosts = vec![
            host("dockbridge-1", HostStatus::Running, 10),
            host("dockbridge-2", HostStatus::Off, 20),
            host("dockbridge-3", HostStatus::Unknown, 30),
        ];
        let (running, stale) = Registry::classify(hosts);
        assert_eq!(running.len(), 1);
        assert_eq!(stale.len(), 2);
        assert_eq!(running[0].name, "dockbridge-1");
    }

    #[test]
    fn select_picks_newest_running() {
        let running = vec![
            host("dockbridge-old", HostStatus::Running, 100),
            host("dockbridge-new", HostStatus::Running, 1),
        ];
        let selected = Registry::select(&running).unwrap();
        assert_eq!(selected.name, "dockbridge-new");
    }

    #[test]
    fn select_on_empty_running_is_none() {
        assert!(Registry::select(&[]).is_none());
    }
}
