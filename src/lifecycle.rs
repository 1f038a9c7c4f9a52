//! Lifecycle Manager: polls the Activity Tracker and destroys
//! the remote host after a debounced grace period once activity is due to
//! time out, without ever running two destroys concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::cloud::{CloudApi, CloudError};
use crate::constants::{LIFECYCLE_HOST_CACHE_TTL_SECS, LIFECYCLE_TICK_SECS};
use crate::model::CancelToken;
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

pub struct LifecycleManager {
    registry: Registry,
    cloud: Arc<dyn CloudApi>,
    activity: Arc<ActivityTracker>,
    grace_period_secs: u64,
    destroying: AtomicBool,
    cached_running: Mutex<Option<(Instant, bool)>>,
}

impl LifecycleManager {
    pub fn new(cloud: Arc<dyn CloudApi>, activity: Arc<ActivityTracker>, grace_period_secs: u64) -> Self {
        Self {
            registry: Registry::new(cloud.clone()),
            cloud,
            activity,
            grace_period_secs,
            destroying: AtomicBool::new(false),
            cached_running: Mutex::new(None),
        }
    }

    /// Runs the 5-second poll loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(LIFECYCLE_TICK_SECS));
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    grace_deadline = self.tick(grace_deadline).await;
                }
            }
        }
    }

    async fn tick(&self, grace_deadline: Option<Instant>) -> Option<Instant> {
        if !self.any_host_running().await {
            return None;
        }

        let (_, reason) = self.activity.time_until_shutdown();
        if !reason.is_due() {
            if grace_deadline.is_some() {
                tracing::info!("new activity observed, disarming shutdown grace period");
            }
            return None;
        }

        match grace_deadline {
            None => {
                let deadline = Instant::now() + Duration::from_secs(self.grace_period_secs);
                tracing::info!(?reason, "activity timeout reached, arming shutdown grace period");
                Some(deadline)
            }
            Some(deadline) if Instant::now() >= deadline => {
                self.destroy_if_running().await;
                None
            }
            same => same,
        }
    }

    /// Cheap, TTL-cached gate so the 5-second ticker doesn't hit the cloud
    /// API at all while nothing is running.
    async fn any_host_running(&self) -> bool {
        let mut cache = self.cached_running.lock().await;
        if let Some((checked_at, running)) = *cache {
            if checked_at.elapsed() < Duration::from_secs(LIFECYCLE_HOST_CACHE_TTL_SECS) {
                return running;
            }
        }

        let running = match self.registry.list_candidates(CancelToken::new()).await {
            Ok(candidates) => !Registry::classify(candidates).0.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list hosts while checking lifecycle state");
                false
            }
        };
        *cache = Some((Instant::now(), running));
        running
    }

    /// Destroys the currently selected host. A "not found" response is
    /// treated as success. Only one destroy runs at a time; a concurrent
    /// call is a silent no-op.
    async fn destroy_if_running(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }

        let result = self.registry.list_candidates(CancelToken::new()).await;
        match result {
            Ok(candidates) => {
                let (running, _) = Registry::classify(candidates);
                if let Some(host) = Registry::select(&running) {
                    tracing::info!(host_id = %host.id, "activity timeout elapsed, destroying host");
                    if let Err(e) = self.cloud.destroy_host(&host.id, CancelToken::new()).await {
                        tracing::warn!(host_id = %host.id, error = %e, "destroy failed, will retry on next due tick");
                    }
                } else {
                    tracing::debug!("shutdown due but no running host found");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to list hosts before destroy"),
        }

        *self.cached_running.lock().await = None;
        self.destroying.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeCloudApi;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn tick_is_a_no_op_when_nothing_is_running() {
        let cloud = Arc::new(FakeCloudApi::new());
        let activity = Arc::new(ActivityTracker::new(StdDuration::ZERO, StdDuration::from_secs(1800)));
        let manager = LifecycleManager::new(cloud.clone(), activity, 30);

        let next = manager.tick(None).await;
        assert!(next.is_none());
        assert_eq!(cloud.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn due_activity_arms_then_destroys_after_grace_elapses() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.seed_running_host("dockbridge-idle");
        let activity = Arc::new(ActivityTracker::new(StdDuration::ZERO, StdDuration::from_secs(1800)));
        let manager = LifecycleManager::new(cloud.clone(), activity, 30);

        let armed = manager.tick(None).await;
        assert!(armed.is_some());
        assert_eq!(cloud.destroy_calls(), 0);

        let past_deadline = Instant::now() - Duration::from_secs(1);
        let after = manager.tick(Some(past_deadline)).await;
        assert!(after.is_none());
        assert_eq!(cloud.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn configured_grace_period_controls_arming_deadline() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.seed_running_host("dockbridge-idle");
        let activity = Arc::new(ActivityTracker::new(StdDuration::ZERO, StdDuration::from_secs(1800)));
        let manager = LifecycleManager::new(cloud.clone(), activity, 5);

        let before = Instant::now();
        let armed = manager.tick(None).await.expect("activity is due, should arm");
        assert!(armed >= before + Duration::from_secs(5));
        assert!(armed < before + Duration::from_secs(6));
    }

    #[tokio::test]
    async fn fresh_activity_disarms_pending_grace_period() {
        let cloud = Arc::new(FakeCloudApi::new());
        cloud.seed_running_host("dockbridge-active");
        let activity = Arc::new(ActivityTracker::new(StdDuration::from_secs(300), StdDuration::from_secs(1800)));
        let manager = LifecycleManager::new(cloud.clone(), activity.clone(), 30);

        let armed_if_due = manager.tick(Some(Instant::now())).await;
        assert!(armed_if_due.is_none());
        assert_eq!(cloud.destroy_calls(), 0);
    }
}
