//! Activity Tracker: records the last command and last client connection,
//! and answers "how long until we should shut down, and why".

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::ShutdownReason;

struct ActivityWindow {
    last_command: Instant,
    last_connection: Instant,
}

/// A registered observer, invoked on every `record_*` call. Fire-and-forget:
/// failures are caught and logged, never propagated to the caller.
pub type ActivityCallback = Box<dyn Fn() + Send + Sync>;

/// Guarded by a plain `std::sync::Mutex`: the critical section only ever
/// stamps an `Instant` (and invokes cheap, non-blocking callbacks), never
/// awaits, so there is no reason to pay for an async mutex on the Relay's
/// hot path.
pub struct ActivityTracker {
    window: Mutex<ActivityWindow>,
    callbacks: Mutex<Vec<ActivityCallback>>,
    idle_timeout: Duration,
    connection_timeout: Duration,
}

impl ActivityTracker {
    pub fn new(idle_timeout: Duration, connection_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            window: Mutex::new(ActivityWindow {
                last_command: now,
                last_connection: now,
            }),
            callbacks: Mutex::new(Vec::new()),
            idle_timeout,
            connection_timeout,
        }
    }

    /// Registers an observer invoked on every subsequent `record_command`
    /// or `record_connection` call. Must not block: it runs inline inside
    /// the tracker's mutex-guarded critical section.
    pub fn register_callback(&self, callback: ActivityCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Fire-and-forget: never blocks the caller on the Relay's hot path.
    pub fn record_command(&self) {
        self.window.lock().unwrap().last_command = Instant::now();
        self.fire_callbacks();
    }

    pub fn record_connection(&self) {
        self.window.lock().unwrap().last_connection = Instant::now();
        self.fire_callbacks();
    }

    fn fire_callbacks(&self) {
        let callbacks = self.callbacks.lock().unwrap();
        for (index, callback) in callbacks.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback()));
            if let Err(e) = result {
                tracing::warn!(index, ?e, "activity callback panicked");
            }
        }
    }

    /// Returns the duration remaining before a shutdown reason fires, and
    /// which reason it will be. A zero duration means the reason is due
    /// now.
    pub fn time_until_shutdown(&self) -> (Duration, ShutdownReason) {
        let window = self.window.lock().unwrap();
        let idle_elapsed = window.last_command.elapsed();
        let connection_elapsed = window.last_connection.elapsed();

        let idle_remaining = self.idle_timeout.saturating_sub(idle_elapsed);
        let connection_remaining = self.connection_timeout.saturating_sub(connection_elapsed);

        if idle_remaining <= connection_remaining {
            let reason = if idle_remaining.is_zero() {
                ShutdownReason::IdleTimeout
            } else {
                ShutdownReason::ApproachingIdleTimeout
            };
            (idle_remaining, reason)
        } else {
            let reason = if connection_remaining.is_zero() {
                ShutdownReason::ConnectionTimeout
            } else {
                ShutdownReason::ApproachingConnectionTimeout
            };
            (connection_remaining, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fresh_tracker_reports_full_timeouts_remaining() {
        let tracker = ActivityTracker::new(Duration::from_secs(300), Duration::from_secs(1800));
        let (remaining, reason) = tracker.time_until_shutdown();
        assert!(remaining <= Duration::from_secs(300));
        assert_eq!(reason, ShutdownReason::ApproachingIdleTimeout);
    }

    #[test]
    fn zero_idle_timeout_is_immediately_due() {
        let tracker = ActivityTracker::new(Duration::ZERO, Duration::from_secs(1800));
        let (remaining, reason) = tracker.time_until_shutdown();
        assert_eq!(remaining, Duration::ZERO);
        assert_eq!(reason, ShutdownReason::IdleTimeout);
        assert!(reason.is_due());
    }

    #[tokio::test]
    async fn recording_command_resets_idle_window() {
        let tracker = ActivityTracker::new(Duration::from_millis(50), Duration::from_secs(1800));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tracker.record_command();
        let (remaining, _) = tracker.time_until_shutdown();
        assert!(remaining > Duration::ZERO);
    }

    #[test]
    fn callbacks_fire_on_every_record_event() {
        let tracker = ActivityTracker::new(Duration::from_secs(300), Duration::from_secs(1800));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_handle = calls.clone();
        tracker.register_callback(Box::new(move || {
            calls_handle.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.record_command();
        tracker.record_connection();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_callback_does_not_stop_others_or_the_caller() {
        let tracker = ActivityTracker::new(Duration::from_secs(300), Duration::from_secs(1800));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_handle = calls.clone();

        tracker.register_callback(Box::new(|| panic!("boom")));
        tracker.register_callback(Box::new(move || {
            calls_handle.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.record_command();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
