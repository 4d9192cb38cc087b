//! Analytics poller. Keeps the session summary current.
//!
//! Fetch failures never reach the user: they are logged and the last good
//! snapshot stays on display.

use crate::client::{DetectionBackend, TransportError};
use emolens_core::SessionStateStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Requests an out-of-band analytics fetch. Cheap to clone.
#[derive(Clone)]
pub struct AnalyticsHandle {
    wake: Arc<Notify>,
}

impl AnalyticsHandle {
    /// Fetch as soon as possible without waiting for the next tick.
    /// Requests made while a fetch is running coalesce into one.
    pub fn refresh_now(&self) {
        self.wake.notify_one();
    }
}

struct Shared {
    backend: Arc<dyn DetectionBackend>,
    store: SessionStateStore,
}

impl Shared {
    async fn fetch(&self) -> bool {
        let epoch = self.store.analytics_epoch();
        match self.backend.fetch_analytics().await {
            Ok(snapshot) => {
                let total_predictions = snapshot.session_stats.total_predictions;
                let dominant = snapshot.dominant_emotion.clone();
                if !self.store.apply_analytics(epoch, snapshot) {
                    tracing::debug!("discarding analytics fetched before session reset");
                    return false;
                }
                tracing::debug!(total_predictions, ?dominant, "analytics updated");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "analytics fetch failed; keeping previous snapshot");
                false
            }
        }
    }
}

pub struct AnalyticsPoller {
    shared: Arc<Shared>,
    period: Duration,
    handle: AnalyticsHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyticsPoller {
    pub fn new(backend: Arc<dyn DetectionBackend>, store: SessionStateStore, period: Duration) -> Self {
        Self {
            shared: Arc::new(Shared { backend, store }),
            period,
            handle: AnalyticsHandle {
                wake: Arc::new(Notify::new()),
            },
            task: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> AnalyticsHandle {
        self.handle.clone()
    }

    /// Start polling: one fetch right away, then one per period and one per
    /// refresh request. Must be called inside a tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let wake = Arc::clone(&self.handle.wake);
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                shared.fetch().await;
            }
        }));
        tracing::debug!(period_ms = period.as_millis() as u64, "analytics polling started");
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("analytics polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Fetch once, now. Returns whether a new snapshot was applied.
    pub async fn fetch_once(&self) -> bool {
        self.shared.fetch().await
    }

    /// Clear the server-side session, drop the local detection result and
    /// snapshot, and refetch.
    ///
    /// If the server refuses the reset, local state is left as it was so
    /// the display keeps matching the server.
    pub async fn reset_session(&self) -> Result<(), TransportError> {
        if let Err(e) = self.shared.backend.reset_session().await {
            tracing::warn!(error = %e, "session reset failed");
            return Err(e);
        }

        self.shared.store.reset_session();
        tracing::info!("session reset");

        self.shared.fetch().await;
        Ok(())
    }
}

impl Drop for AnalyticsPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{analytics, wait_until, FakeBackend};

    fn poller(backend: &Arc<FakeBackend>, store: &SessionStateStore, period: Duration) -> AnalyticsPoller {
        AnalyticsPoller::new(Arc::clone(backend) as Arc<dyn DetectionBackend>, store.clone(), period)
    }

    #[tokio::test]
    async fn test_first_fetch_is_immediate() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_analytics_default(Some(analytics(4)));
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_secs(60));

        poller.start();
        assert!(wait_until(Duration::from_secs(2), || store.snapshot().analytics.is_some()).await);
        assert_eq!(
            store.snapshot().analytics.map(|a| a.session_stats.total_predictions),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_snapshot_and_polling_continues() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_analytics(Some(analytics(7)));
        backend.set_analytics_default(None);
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_millis(20));

        poller.start();
        assert!(
            wait_until(Duration::from_secs(2), || FakeBackend::calls(&backend.analytics_calls) >= 4).await,
            "polling continues after failures"
        );
        assert_eq!(
            store.snapshot().analytics.map(|a| a.session_stats.total_predictions),
            Some(7)
        );
        assert!(store.snapshot().error_message.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_now_fetches_between_ticks() {
        let backend = Arc::new(FakeBackend::new());
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_secs(60));

        poller.start();
        assert!(wait_until(Duration::from_secs(2), || FakeBackend::calls(&backend.analytics_calls) == 1).await);

        poller.handle().refresh_now();
        assert!(wait_until(Duration::from_secs(2), || FakeBackend::calls(&backend.analytics_calls) == 2).await);
    }

    #[tokio::test]
    async fn test_reset_clears_then_refetches() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_analytics_default(Some(analytics(12)));
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_secs(60));
        assert!(poller.fetch_once().await);
        let _ = store
            .begin_capture(emolens_core::Trigger::Manual)
            .unwrap()
            .reconcile(emolens_core::DetectionResult::failed("stale"));
        assert_eq!(store.snapshot().error_message, "stale");

        backend.set_analytics_default(Some(analytics(0)));
        backend.observe_store(store.clone());
        poller.reset_session().await.unwrap();

        assert_eq!(FakeBackend::calls(&backend.reset_calls), 1);
        assert_eq!(*backend.analytics_while_cleared.lock(), vec![true]);
        assert!(store.snapshot().error_message.is_empty());
        assert_eq!(
            store.snapshot().analytics.map(|a| a.session_stats.total_predictions),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_fetch_spanning_reset_is_discarded() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_analytics(Some(analytics(50)));
        backend.set_analytics_default(Some(analytics(0)));
        let store = SessionStateStore::new();
        let poller = Arc::new(poller(&backend, &store, Duration::from_secs(60)));

        let gate = backend.hold_next_analytics();
        let stale = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.fetch_once().await })
        };
        assert!(wait_until(Duration::from_secs(2), || FakeBackend::calls(&backend.analytics_calls) == 1).await);

        poller.reset_session().await.unwrap();
        gate.notify_one();
        assert!(!stale.await.unwrap());
        assert_eq!(
            store.snapshot().analytics.map(|a| a.session_stats.total_predictions),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_local_snapshot() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_analytics_default(Some(analytics(3)));
        backend.fail_reset();
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_secs(60));
        poller.fetch_once().await;

        assert!(poller.reset_session().await.is_err());
        assert_eq!(
            store.snapshot().analytics.map(|a| a.session_stats.total_predictions),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_stop_halts_polling() {
        let backend = Arc::new(FakeBackend::new());
        let store = SessionStateStore::new();
        let poller = poller(&backend, &store, Duration::from_millis(10));

        poller.start();
        assert!(poller.is_running());
        assert!(wait_until(Duration::from_secs(2), || FakeBackend::calls(&backend.analytics_calls) >= 2).await);
        poller.stop();
        assert!(!poller.is_running());

        let calls = FakeBackend::calls(&backend.analytics_calls);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(FakeBackend::calls(&backend.analytics_calls) <= calls + 1);
    }
}
