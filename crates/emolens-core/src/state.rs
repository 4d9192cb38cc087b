//! Session state store: the single source of truth for what the user sees.
//!
//! Every mutation goes through a typed operation. Capture results are
//! applied through [`CaptureTicket::reconcile`], which fences on the
//! ticket's sequence number so a response to an older request can never
//! overwrite the result of a newer one, whatever order they arrive in.

use crate::types::{AnalyticsSnapshot, DetectionResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// What the display is currently showing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplaySource {
    #[default]
    None,
    LiveCamera,
    StaticImage {
        name: String,
    },
}

/// Aggregate session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub detection: DetectionResult,
    pub analytics: Option<AnalyticsSnapshot>,
    pub is_loading: bool,
    pub error_message: String,
    /// Real-time detection on/off.
    pub camera_mode: bool,
    pub display_source: DisplaySource,
}

/// Who asked for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A user action. Rejected while another capture is in flight.
    Manual,
    /// A real-time tick. Allowed to overlap, ordered by the fence.
    Scheduled,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRejected {
    #[error("a capture is already in flight")]
    InFlight,
}

/// Outcome of applying a capture result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Applied,
    /// Dropped: a request issued later was already applied.
    Superseded { latest: u64 },
}

struct Fence {
    /// Sequence number of the most recently issued ticket.
    issued: u64,
    /// Sequence number of the most recently applied ticket.
    applied: u64,
    in_flight: usize,
    /// Bumped on every session reset.
    analytics_epoch: u64,
}

struct Inner {
    fence: Mutex<Fence>,
    state: watch::Sender<SessionState>,
}

impl Inner {
    /// Lock order: fence first, then the watch value.
    fn settle(&self, seq: u64, result: Option<DetectionResult>) -> Reconciliation {
        let mut fence = self.fence.lock();
        fence.in_flight = fence.in_flight.saturating_sub(1);
        let loading = fence.in_flight > 0;

        let fresh = result.is_some() && seq > fence.applied;
        if fresh {
            fence.applied = seq;
        }
        let latest = fence.applied;

        self.state.send_modify(|state| {
            state.is_loading = loading;
            if let Some(result) = result.filter(|_| fresh) {
                state.error_message = result.error.clone();
                state.detection = result;
            }
        });

        if fresh {
            Reconciliation::Applied
        } else {
            Reconciliation::Superseded { latest }
        }
    }
}

/// Cheaply cloneable handle to the shared session state.
#[derive(Clone)]
pub struct SessionStateStore {
    inner: Arc<Inner>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                fence: Mutex::new(Fence {
                    issued: 0,
                    applied: 0,
                    in_flight: 0,
                    analytics_epoch: 0,
                }),
                state,
            }),
        }
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Issue a sequence-numbered ticket for a new capture and mark the
    /// session as loading.
    pub fn begin_capture(&self, trigger: Trigger) -> Result<CaptureTicket, CaptureRejected> {
        let mut fence = self.inner.fence.lock();
        if trigger == Trigger::Manual && fence.in_flight > 0 {
            return Err(CaptureRejected::InFlight);
        }
        fence.issued += 1;
        fence.in_flight += 1;
        let seq = fence.issued;

        self.inner.state.send_modify(|state| state.is_loading = true);

        Ok(CaptureTicket {
            seq,
            trigger,
            inner: Arc::clone(&self.inner),
            settled: false,
        })
    }

    /// Clear the detection result and discard every capture still in flight.
    pub fn clear_detection(&self) {
        let mut fence = self.inner.fence.lock();
        fence.applied = fence.issued;
        self.inner.state.send_modify(|state| {
            state.detection = DetectionResult::default();
            state.error_message.clear();
        });
    }

    pub fn set_camera_mode(&self, on: bool) {
        self.inner.state.send_if_modified(|state| {
            let changed = state.camera_mode != on;
            state.camera_mode = on;
            changed
        });
    }

    pub fn set_display_source(&self, source: DisplaySource) {
        self.inner.state.send_if_modified(|state| {
            let changed = state.display_source != source;
            state.display_source = source;
            changed
        });
    }

    /// Show a user-visible error without touching the detection result.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner
            .state
            .send_modify(|state| state.error_message = message);
    }

    pub fn clear_error(&self) {
        self.inner.state.send_if_modified(|state| {
            let changed = !state.error_message.is_empty();
            state.error_message.clear();
            changed
        });
    }

    /// Epoch to pass to [`apply_analytics`](Self::apply_analytics) for a
    /// fetch starting now.
    pub fn analytics_epoch(&self) -> AnalyticsEpoch {
        AnalyticsEpoch(self.inner.fence.lock().analytics_epoch)
    }

    /// Replace the analytics snapshot wholesale, unless the session was
    /// reset after the fetch began. Returns whether it was applied.
    pub fn apply_analytics(&self, epoch: AnalyticsEpoch, snapshot: AnalyticsSnapshot) -> bool {
        let fence = self.inner.fence.lock();
        if fence.analytics_epoch != epoch.0 {
            return false;
        }
        self.inner
            .state
            .send_modify(|state| state.analytics = Some(snapshot));
        true
    }

    /// Start a fresh session: drop the detection result and the analytics
    /// snapshot, and discard every capture and analytics fetch in flight.
    pub fn reset_session(&self) {
        let mut fence = self.inner.fence.lock();
        fence.applied = fence.issued;
        fence.analytics_epoch += 1;
        self.inner.state.send_modify(|state| {
            state.detection = DetectionResult::default();
            state.error_message.clear();
            state.analytics = None;
        });
    }
}

/// Session generation an analytics fetch was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsEpoch(u64);

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Authority to apply the result of one capture request.
///
/// Consumed by [`reconcile`](Self::reconcile). A ticket dropped without
/// being reconciled (e.g. its task was cancelled) releases its in-flight
/// slot and leaves the detection result untouched.
#[must_use = "an unreconciled ticket is treated as abandoned"]
pub struct CaptureTicket {
    seq: u64,
    trigger: Trigger,
    inner: Arc<Inner>,
    settled: bool,
}

impl CaptureTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Apply a capture result, unless a later request already has been.
    pub fn reconcile(mut self, result: DetectionResult) -> Reconciliation {
        self.settled = true;
        let outcome = self.inner.settle(self.seq, Some(result));
        if let Reconciliation::Superseded { latest } = outcome {
            tracing::debug!(seq = self.seq, latest, "discarding superseded capture result");
        }
        outcome
    }
}

impl Drop for CaptureTicket {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(seq = self.seq, "capture abandoned before completion");
            self.inner.settle(self.seq, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionResponse, NO_FACE_DETECTED};

    fn result(emotion: &str) -> DetectionResult {
        DetectionResult::from_response(DetectionResponse {
            primary_emotion: Some(emotion.into()),
            primary_confidence: Some(80.0),
            ..Default::default()
        })
    }

    #[test]
    fn test_initial_state() {
        let state = SessionStateStore::new().snapshot();
        assert!(state.detection.primary_emotion.is_empty());
        assert!(state.analytics.is_none());
        assert!(!state.is_loading);
        assert!(!state.camera_mode);
        assert_eq!(state.display_source, DisplaySource::None);
    }

    #[test]
    fn test_loading_while_in_flight() {
        let store = SessionStateStore::new();
        let ticket = store.begin_capture(Trigger::Manual).unwrap();
        assert!(store.snapshot().is_loading);

        assert_eq!(ticket.reconcile(result("Happy")), Reconciliation::Applied);
        let state = store.snapshot();
        assert!(!state.is_loading);
        assert_eq!(state.detection.primary_emotion, "Happy");
    }

    #[test]
    fn test_manual_capture_rejected_while_loading() {
        let store = SessionStateStore::new();
        let first = store.begin_capture(Trigger::Scheduled).unwrap();
        assert_eq!(
            store.begin_capture(Trigger::Manual).err(),
            Some(CaptureRejected::InFlight)
        );
        let _ = first.reconcile(result("Sad"));
        assert!(store.begin_capture(Trigger::Manual).is_ok());
    }

    #[test]
    fn test_late_response_does_not_overwrite_newer() {
        let store = SessionStateStore::new();
        let a = store.begin_capture(Trigger::Scheduled).unwrap();
        let b = store.begin_capture(Trigger::Scheduled).unwrap();
        assert!(a.seq() < b.seq());

        assert_eq!(b.reconcile(result("Surprise")), Reconciliation::Applied);
        assert!(store.snapshot().is_loading, "A is still in flight");

        assert_eq!(a.reconcile(result("Angry")), Reconciliation::Superseded { latest: 2 });
        let state = store.snapshot();
        assert_eq!(state.detection.primary_emotion, "Surprise");
        assert!(!state.is_loading);
    }

    #[test]
    fn test_in_order_responses_both_apply() {
        let store = SessionStateStore::new();
        let a = store.begin_capture(Trigger::Scheduled).unwrap();
        let b = store.begin_capture(Trigger::Scheduled).unwrap();
        assert_eq!(a.reconcile(result("Fear")), Reconciliation::Applied);
        assert_eq!(b.reconcile(result("Neutral")), Reconciliation::Applied);
        assert_eq!(store.snapshot().detection.primary_emotion, "Neutral");
    }

    #[test]
    fn test_failure_sets_error_and_success_clears_it() {
        let store = SessionStateStore::new();
        let ticket = store.begin_capture(Trigger::Manual).unwrap();
        let _ = ticket.reconcile(DetectionResult::failed("network down"));
        let state = store.snapshot();
        assert_eq!(state.error_message, "network down");
        assert!(state.detection.primary_emotion.is_empty());

        let ticket = store.begin_capture(Trigger::Manual).unwrap();
        let _ = ticket.reconcile(DetectionResult::from_response(DetectionResponse::default()));
        let state = store.snapshot();
        assert!(state.error_message.is_empty());
        assert_eq!(state.detection.primary_emotion, NO_FACE_DETECTED);
    }

    #[test]
    fn test_abandoned_ticket_releases_loading() {
        let store = SessionStateStore::new();
        let _ = store.begin_capture(Trigger::Manual).unwrap().reconcile(result("Happy"));

        let ticket = store.begin_capture(Trigger::Manual).unwrap();
        drop(ticket);

        let state = store.snapshot();
        assert!(!state.is_loading);
        assert_eq!(state.detection.primary_emotion, "Happy");
        assert!(store.begin_capture(Trigger::Manual).is_ok());
    }

    #[test]
    fn test_clear_detection_discards_pending() {
        let store = SessionStateStore::new();
        let pending = store.begin_capture(Trigger::Manual).unwrap();
        store.clear_detection();

        assert!(matches!(
            pending.reconcile(result("Happy")),
            Reconciliation::Superseded { .. }
        ));
        assert!(store.snapshot().detection.primary_emotion.is_empty());
    }

    fn snapshot(dominant: &str) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            dominant_emotion: Some(dominant.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_analytics_replaced_wholesale() {
        let store = SessionStateStore::new();
        assert!(store.apply_analytics(store.analytics_epoch(), snapshot("Happy")));
        assert!(store.apply_analytics(store.analytics_epoch(), snapshot("Sad")));
        assert_eq!(store.snapshot().analytics, Some(snapshot("Sad")));
    }

    #[test]
    fn test_reset_clears_detection_and_analytics() {
        let store = SessionStateStore::new();
        let _ = store.begin_capture(Trigger::Manual).unwrap().reconcile(result("Sad"));
        store.apply_analytics(store.analytics_epoch(), snapshot("Sad"));
        let pending = store.begin_capture(Trigger::Scheduled).unwrap();

        store.reset_session();
        let state = store.snapshot();
        assert!(state.detection.primary_emotion.is_empty());
        assert!(state.analytics.is_none());

        assert!(matches!(
            pending.reconcile(result("Angry")),
            Reconciliation::Superseded { .. }
        ));
        assert!(store.snapshot().detection.primary_emotion.is_empty());
    }

    #[test]
    fn test_analytics_fetched_before_reset_is_dropped() {
        let store = SessionStateStore::new();
        let before = store.analytics_epoch();
        store.reset_session();

        assert!(!store.apply_analytics(before, snapshot("Happy")));
        assert!(store.snapshot().analytics.is_none());
        assert!(store.apply_analytics(store.analytics_epoch(), snapshot("Neutral")));
    }

    #[test]
    fn test_subscribers_see_changes() {
        let store = SessionStateStore::new();
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store.set_camera_mode(true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().camera_mode);

        store.set_camera_mode(true);
        assert!(!rx.has_changed().unwrap(), "no-op update must not notify");
    }

    #[test]
    fn test_report_error_keeps_detection() {
        let store = SessionStateStore::new();
        let _ = store.begin_capture(Trigger::Manual).unwrap().reconcile(result("Happy"));
        store.report_error("Camera access denied");
        let state = store.snapshot();
        assert_eq!(state.error_message, "Camera access denied");
        assert_eq!(state.detection.primary_emotion, "Happy");
        store.clear_error();
        assert!(store.snapshot().error_message.is_empty());
    }
}
