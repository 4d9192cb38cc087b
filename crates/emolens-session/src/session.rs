//! The emotion session: camera, capture pipeline, real-time scheduler and
//! analytics poller wired to one state store, torn down exactly once.

use crate::analytics::AnalyticsPoller;
use crate::camera::{CameraSessionError, CameraSessionManager, CameraState, StartOutcome, StopOutcome};
use crate::client::{DetectionBackend, TransportError, UploadImage};
use crate::config::Config;
use crate::pipeline::{CaptureOutcome, CaptureSource, CapturePipeline};
use crate::scheduler::{RealTimeScheduler, SchedulerError, SchedulerState};
use emolens_core::overlay::{render_overlays, FaceOverlay, ReferenceFrame};
use emolens_core::{DisplaySource, SessionState, SessionStateStore, Trigger};
use emolens_hw::{CaptureConstraints, DeviceProvider};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CameraSessionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("session reset failed: {0}")]
    Reset(#[from] TransportError),
    #[error("failed to read image {path}: {source}")]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct EmotionSession {
    store: SessionStateStore,
    camera: CameraSessionManager,
    pipeline: CapturePipeline,
    scheduler: RealTimeScheduler,
    analytics: AnalyticsPoller,
    shut_down: AtomicBool,
}

impl EmotionSession {
    /// Wire up a session and start analytics polling. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: &Config,
        provider: Box<dyn DeviceProvider>,
        backend: Arc<dyn DetectionBackend>,
    ) -> Result<Self, SessionError> {
        let store = SessionStateStore::new();
        let constraints = CaptureConstraints {
            width: config.capture_width,
            height: config.capture_height,
        };
        let camera = CameraSessionManager::spawn(provider, constraints)?;

        let analytics = AnalyticsPoller::new(Arc::clone(&backend), store.clone(), config.analytics_interval());
        let pipeline = CapturePipeline::new(
            camera.clone(),
            backend,
            store.clone(),
            analytics.handle(),
            config.jpeg_quality,
        );
        let scheduler = RealTimeScheduler::new(
            pipeline.clone(),
            camera.clone(),
            store.clone(),
            config.capture_interval(),
        );

        analytics.start();
        tracing::info!(api_url = %config.api_url, "session started");

        Ok(Self {
            store,
            camera,
            pipeline,
            scheduler,
            analytics,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SessionState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn camera_state(&self) -> CameraState {
        self.camera.state()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Acquire the camera and show its live feed. Access failures are
    /// shown to the user and returned; there is no retry.
    pub async fn start_camera(&self) -> Result<StartOutcome, SessionError> {
        match self.camera.start().await {
            Ok(outcome) => {
                self.store.set_display_source(DisplaySource::LiveCamera);
                self.store.clear_error();
                Ok(outcome)
            }
            Err(e) => {
                self.store.report_error(format!("Unable to access camera: {e}"));
                Err(e.into())
            }
        }
    }

    /// Release the camera. Real-time detection is cancelled with it.
    /// Idempotent.
    pub async fn stop_camera(&self) -> Result<StopOutcome, SessionError> {
        let outcome = self.camera.stop().await?;
        self.clear_live_display();
        Ok(outcome)
    }

    /// One manual capture from the live camera.
    pub async fn capture(&self) -> CaptureOutcome {
        self.pipeline
            .capture_and_classify(CaptureSource::LiveFrame, Trigger::Manual)
            .await
    }

    /// Classify an image file in place of the camera feed.
    pub async fn upload_path(&self, path: &Path) -> Result<CaptureOutcome, SessionError> {
        let image = UploadImage::from_path(path)
            .await
            .map_err(|source| SessionError::ReadImage {
                path: path.to_path_buf(),
                source,
            })?;
        self.upload(image).await
    }

    /// Stop the camera, show `image` and classify it. Refused with no
    /// effect while another capture is in flight.
    pub async fn upload(&self, image: UploadImage) -> Result<CaptureOutcome, SessionError> {
        let name = image.file_name.clone();
        let source = CaptureSource::StillImage(image);
        let ticket = match self.pipeline.reserve(&source, Trigger::Manual) {
            Ok(ticket) => ticket,
            Err(outcome) => return Ok(outcome),
        };

        self.stop_camera().await?;
        self.store.set_display_source(DisplaySource::StaticImage { name });
        Ok(self.pipeline.run(ticket, source).await)
    }

    /// Drop the uploaded image and its result. Captures still in flight
    /// are ignored when they complete.
    pub fn remove_image(&self) {
        if matches!(self.store.snapshot().display_source, DisplaySource::StaticImage { .. }) {
            self.store.set_display_source(DisplaySource::None);
        }
        self.store.clear_detection();
    }

    pub fn enable_real_time(&self) -> Result<(), SessionError> {
        Ok(self.scheduler.enable()?)
    }

    pub fn disable_real_time(&self) {
        self.scheduler.disable();
    }

    /// Flip real-time detection and return the new state.
    pub fn toggle_real_time(&self) -> Result<SchedulerState, SessionError> {
        match self.scheduler.state() {
            SchedulerState::On => self.scheduler.disable(),
            SchedulerState::Off => self.scheduler.enable()?,
        }
        Ok(self.scheduler.state())
    }

    pub async fn refresh_analytics(&self) -> bool {
        self.analytics.fetch_once().await
    }

    pub async fn reset_session(&self) -> Result<(), SessionError> {
        Ok(self.analytics.reset_session().await?)
    }

    /// Overlays for the faces of the current result.
    pub fn overlays(&self) -> Vec<FaceOverlay> {
        render_overlays(&self.store.snapshot().detection.faces, ReferenceFrame::default())
    }

    /// Stop the scheduler, the camera and the analytics poller. Runs once;
    /// later calls and the drop that follows do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.disable();
        self.camera.request_stop();
        self.analytics.stop();
        self.clear_live_display();
        tracing::info!("session shut down");
    }

    fn clear_live_display(&self) {
        if self.store.snapshot().display_source == DisplaySource::LiveCamera {
            self.store.set_display_source(DisplaySource::None);
        }
    }
}

impl Drop for EmotionSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
