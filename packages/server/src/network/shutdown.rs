//! Graceful shutdown with a health state machine and in-flight tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Serving state: `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Component loading; not yet accepting traffic.
    Starting,
    Ready,
    /// Shutdown requested; in-flight calls are finishing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared between both listeners so one signal drains HTTP and RPC together.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<HealthState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Receiver flipped to `true` once shutdown is triggered.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // An error means the sender is gone, which only happens on drop.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Moves to `Draining` and wakes every listener.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        self.signal.send_replace(true);
    }

    /// Counts one in-flight call until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no call is in flight, up to `timeout`. Returns `true` and
    /// moves to `Stopped` when drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let ctrl = ShutdownController::new();
        assert_eq!(ctrl.health_state(), HealthState::Starting);
        assert!(!ctrl.is_ready());
        ctrl.set_ready();
        assert!(ctrl.is_ready());
        ctrl.trigger_shutdown();
        assert_eq!(ctrl.health_state(), HealthState::Draining);
        assert_eq!(ctrl.health_state().as_str(), "draining");
    }

    #[test]
    fn guards_track_in_flight() {
        let ctrl = ShutdownController::new();
        let a = ctrl.in_flight_guard();
        let b = ctrl.in_flight_guard();
        assert_eq!(ctrl.in_flight_count(), 2);
        drop(a);
        assert_eq!(ctrl.in_flight_count(), 1);
        drop(b);
        assert_eq!(ctrl.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let ctrl = Arc::new(ShutdownController::new());
        let guard = ctrl.in_flight_guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(ctrl.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(ctrl.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn drain_times_out() {
        let ctrl = ShutdownController::new();
        let _guard = ctrl.in_flight_guard();
        assert!(!ctrl.wait_for_drain(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn triggered_resolves_after_signal() {
        let ctrl = Arc::new(ShutdownController::new());
        let waiter = tokio::spawn({
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.triggered().await }
        });
        ctrl.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
