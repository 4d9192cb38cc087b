//! Scripted in-process fakes for the camera device and the backend.

use crate::client::{DetectionBackend, TransportError, UploadImage};
use async_trait::async_trait;
use emolens_core::types::{BoundingBox, Face, SessionStats};
use emolens_core::{AnalyticsSnapshot, DetectionResponse, SessionStateStore};
use emolens_hw::{CameraError, CaptureConstraints, DeviceInfo, DeviceProvider, Frame, VideoDevice};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) fn detection(emotion: &str, confidence: f32) -> DetectionResponse {
    let scores: BTreeMap<String, f32> = [(emotion.to_string(), confidence)].into_iter().collect();
    DetectionResponse {
        primary_emotion: Some(emotion.to_string()),
        primary_confidence: Some(confidence),
        faces: Some(vec![Face {
            bbox: BoundingBox {
                x: 100.0,
                y: 50.0,
                w: 80.0,
                h: 80.0,
            },
            emotion: emotion.to_string(),
            confidence,
            all_emotions: scores,
        }]),
        error: None,
    }
}

pub(crate) fn analytics(total_predictions: u64) -> AnalyticsSnapshot {
    AnalyticsSnapshot {
        session_stats: SessionStats {
            duration_minutes: 1.0,
            total_predictions,
            emotion_percentages: [("Happy".to_string(), 100.0)].into_iter().collect(),
        },
        dominant_emotion: Some("Happy".to_string()),
        recent_history: Vec::new(),
    }
}

fn unavailable() -> TransportError {
    TransportError::Status {
        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        body: "scripted failure".to_string(),
    }
}

// --- camera ---

/// Counts of device handles opened through a [`FakeProvider`].
#[derive(Default)]
pub(crate) struct DeviceStats {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opened_total: AtomicUsize,
}

impl DeviceStats {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeProvider {
    stats: Arc<DeviceStats>,
    fail_with: Option<fn() -> CameraError>,
}

impl FakeProvider {
    pub fn new() -> (Self, Arc<DeviceStats>) {
        let stats = Arc::new(DeviceStats::default());
        (
            Self {
                stats: Arc::clone(&stats),
                fail_with: None,
            },
            stats,
        )
    }

    pub fn failing(error: fn() -> CameraError) -> (Self, Arc<DeviceStats>) {
        let (mut provider, stats) = Self::new();
        provider.fail_with = Some(error);
        (provider, stats)
    }
}

impl DeviceProvider for FakeProvider {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn VideoDevice>, CameraError> {
        if let Some(error) = self.fail_with {
            return Err(error());
        }
        let now_open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_open.fetch_max(now_open, Ordering::SeqCst);
        self.stats.opened_total.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            info: DeviceInfo {
                path: "/dev/fake0".to_string(),
                name: "fake camera".to_string(),
                driver: "fake".to_string(),
                width: constraints.width,
                height: constraints.height,
            },
            stats: Arc::clone(&self.stats),
            sequence: 0,
        }))
    }
}

struct FakeDevice {
    info: DeviceInfo,
    stats: Arc<DeviceStats>,
    sequence: u32,
}

impl VideoDevice for FakeDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        self.sequence += 1;
        Frame::from_rgb(vec![128; 8 * 6 * 3], 8, 6, self.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}

// --- backend ---

struct ScriptedDetection {
    delay: Duration,
    gate: Option<Arc<Notify>>,
    response: Option<DetectionResponse>,
}

/// Backend answering from scripts, recording every call.
///
/// Unscripted detections answer `Neutral` at once. Unscripted analytics
/// fetches fall back to `analytics_default`, where `None` is a failure.
pub(crate) struct FakeBackend {
    detections: Mutex<VecDeque<ScriptedDetection>>,
    analytics_script: Mutex<VecDeque<Option<AnalyticsSnapshot>>>,
    analytics_default: Mutex<Option<AnalyticsSnapshot>>,
    reset_fails: AtomicBool,
    observed_store: Mutex<Option<SessionStateStore>>,
    analytics_gate: Mutex<Option<Arc<Notify>>>,
    pub analytics_while_cleared: Mutex<Vec<bool>>,
    pub frame_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub analytics_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub uploads: Mutex<Vec<UploadImage>>,
    pub data_urls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            detections: Mutex::new(VecDeque::new()),
            analytics_script: Mutex::new(VecDeque::new()),
            analytics_default: Mutex::new(Some(analytics(0))),
            reset_fails: AtomicBool::new(false),
            observed_store: Mutex::new(None),
            analytics_gate: Mutex::new(None),
            analytics_while_cleared: Mutex::new(Vec::new()),
            frame_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            analytics_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            data_urls: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next detection answer; `None` is a transport failure.
    pub fn script_detection(&self, delay: Duration, response: Option<DetectionResponse>) {
        self.detections
            .lock()
            .push_back(ScriptedDetection {
                delay,
                gate: None,
                response,
            });
    }

    /// Queue a detection answer held back until the returned gate is
    /// notified.
    pub fn script_gated(&self, response: Option<DetectionResponse>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.detections.lock().push_back(ScriptedDetection {
            delay: Duration::ZERO,
            gate: Some(Arc::clone(&gate)),
            response,
        });
        gate
    }

    /// Hold the next analytics fetch, after it has picked its answer,
    /// until the returned gate is notified.
    pub fn hold_next_analytics(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.analytics_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn script_analytics(&self, snapshot: Option<AnalyticsSnapshot>) {
        self.analytics_script.lock().push_back(snapshot);
    }

    pub fn set_analytics_default(&self, snapshot: Option<AnalyticsSnapshot>) {
        *self.analytics_default.lock() = snapshot;
    }

    pub fn fail_reset(&self) {
        self.reset_fails.store(true, Ordering::SeqCst);
    }

    /// Record, on each analytics fetch, whether `store` held no snapshot.
    pub fn observe_store(&self, store: SessionStateStore) {
        *self.observed_store.lock() = Some(store);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn next_detection(&self) -> Result<DetectionResponse, TransportError> {
        let scripted = self.detections.lock().pop_front();
        match scripted {
            Some(ScriptedDetection { delay, gate, response }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                response.ok_or_else(unavailable)
            }
            None => Ok(detection("Neutral", 60.0)),
        }
    }
}

#[async_trait]
impl DetectionBackend for FakeBackend {
    async fn classify_frame(&self, data_url: String) -> Result<DetectionResponse, TransportError> {
        self.frame_calls.fetch_add(1, Ordering::SeqCst);
        self.data_urls.lock().push(data_url);
        self.next_detection().await
    }

    async fn classify_upload(&self, image: UploadImage) -> Result<DetectionResponse, TransportError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().push(image);
        self.next_detection().await
    }

    async fn fetch_analytics(&self) -> Result<AnalyticsSnapshot, TransportError> {
        self.analytics_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = self.observed_store.lock().as_ref() {
            let cleared = store.snapshot().analytics.is_none();
            self.analytics_while_cleared.lock().push(cleared);
        }
        let scripted = self.analytics_script.lock().pop_front();
        let snapshot = match scripted {
            Some(snapshot) => snapshot,
            None => self.analytics_default.lock().clone(),
        };
        let gate = self.analytics_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        snapshot.ok_or_else(unavailable)
    }

    async fn reset_session(&self) -> Result<(), TransportError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        if self.reset_fails.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}
