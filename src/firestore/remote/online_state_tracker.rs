use std::sync::Arc;
use std::time::Duration;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::persistent_stream::RemoteScheduler;
use crate::util::async_queue::{DelayedOperation, TimerId};

/// Derives the client's [`OnlineState`] from watch stream health.
///
/// Starting the watch stream moves the state to `Unknown` and arms a timer;
/// if the timer fires or too many consecutive attempts fail before the first
/// message, the client is `Offline`. The first message makes it `Online`.
/// Every method returns the new state when it changed.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    max_watch_stream_failures: u32,
    timeout: Duration,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl OnlineStateTracker {
    pub fn new(scheduler: Arc<dyn RemoteScheduler>, timeout: Duration, max_watch_stream_failures: u32) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            max_watch_stream_failures: max_watch_stream_failures.max(1),
            timeout,
            timer: None,
            should_warn_offline: true,
            scheduler,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.update(OnlineState::Unknown);
        if self.timer.is_none() {
            self.timer = Some(self.scheduler.schedule_timer(TimerId::OnlineStateTimeout, self.timeout));
        }
        changed
    }

    pub fn on_timeout(&mut self) -> Option<OnlineState> {
        if self.timer.take().is_none() || self.state != OnlineState::Unknown {
            return None;
        }
        self.warn_offline(&format!(
            "Backend didn't respond within {} seconds.",
            self.timeout.as_secs()
        ));
        self.update(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // Drop back so views stay consistent while reconnecting. Offline
            // is only reported after the reconnect attempts fail too.
            return self.update(OnlineState::Unknown);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures < self.max_watch_stream_failures {
            return None;
        }
        self.clear_timer();
        self.warn_offline(&format!(
            "Connection failed {} times. Most recent error: {error}",
            self.max_watch_stream_failures
        ));
        self.update(OnlineState::Offline)
    }

    /// Sets the state explicitly, e.g. when the first watch message arrives
    /// or the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.update(state)
    }

    fn update(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn warn_offline(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details}\nThe client will operate in offline mode until it is able to successfully connect to the backend."
        );
        if self.should_warn_offline {
            log::warn!("{message}");
            self.should_warn_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::test_support::ManualScheduler;

    fn tracker(scheduler: &ManualScheduler) -> OnlineStateTracker {
        OnlineStateTracker::new(Arc::new(scheduler.clone()), Duration::from_secs(10), 1)
    }

    #[test]
    fn timeout_reports_offline() {
        let scheduler = ManualScheduler::new();
        let mut tracker = tracker(&scheduler);

        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert_eq!(
            scheduler.pending_delay(TimerId::OnlineStateTimeout),
            Some(Duration::from_secs(10))
        );
        assert!(scheduler.fire(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.on_timeout(), Some(OnlineState::Offline));
        assert_eq!(tracker.on_timeout(), None);
    }

    #[test]
    fn first_failure_reports_offline() {
        let scheduler = ManualScheduler::new();
        let mut tracker = tracker(&scheduler);
        tracker.handle_watch_stream_start();

        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("down")),
            Some(OnlineState::Offline)
        );
        assert!(!scheduler.has_timer(TimerId::OnlineStateTimeout));

        // Restarting after a failure keeps the offline state.
        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[test]
    fn failure_while_online_goes_unknown() {
        let scheduler = ManualScheduler::new();
        let mut tracker = tracker(&scheduler);
        tracker.handle_watch_stream_start();

        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert!(!scheduler.has_timer(TimerId::OnlineStateTimeout));
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("blip")),
            Some(OnlineState::Unknown)
        );
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("still down")),
            Some(OnlineState::Offline)
        );
    }

    #[test]
    fn tolerates_configured_failures() {
        let scheduler = ManualScheduler::new();
        let mut tracker = OnlineStateTracker::new(Arc::new(scheduler.clone()), Duration::from_secs(10), 3);
        tracker.handle_watch_stream_start();

        assert_eq!(tracker.handle_watch_stream_failure(&unavailable("1")), None);
        assert_eq!(tracker.handle_watch_stream_failure(&unavailable("2")), None);
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("3")),
            Some(OnlineState::Offline)
        );
    }
}
