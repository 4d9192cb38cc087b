//! Capture pipeline: source, encoded image, detection service, state.
//!
//! Every failure on this path ends as a state mutation; nothing is
//! returned to the caller as an error.

use crate::analytics::AnalyticsHandle;
use crate::camera::{CameraSessionError, CameraSessionManager};
use crate::client::{DetectionBackend, TransportError, UploadImage};
use emolens_core::types::{REFERENCE_HEIGHT, REFERENCE_WIDTH};
use emolens_core::{CaptureTicket, DetectionResponse, DetectionResult, Reconciliation, SessionStateStore, Trigger};
use emolens_hw::encode::{encode_jpeg, jpeg_data_url, EncodeError};
use std::sync::Arc;
use thiserror::Error;

/// Shown when a capture fails before the service could answer.
pub const CAPTURE_FAILED_MESSAGE: &str = "Failed to analyze image. Please try again.";

/// Shown when a live capture is requested without a running camera.
pub const CAMERA_NOT_STREAMING_MESSAGE: &str = "Camera is not running. Start the camera first.";

#[derive(Error, Debug)]
enum CaptureError {
    #[error(transparent)]
    Camera(#[from] CameraSessionError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("encoder task failed: {0}")]
    EncodeTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What to classify.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// The current frame of the streaming camera.
    LiveFrame,
    StillImage(UploadImage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The result (success or error) is now displayed.
    Applied,
    /// A later capture's result was already displayed; this one was dropped.
    Superseded,
    /// A manual capture arrived while another was in flight.
    Busy,
    /// A live capture was requested while the camera was not streaming.
    CameraNotStreaming,
}

#[derive(Clone)]
pub struct CapturePipeline {
    camera: CameraSessionManager,
    backend: Arc<dyn DetectionBackend>,
    store: SessionStateStore,
    analytics: AnalyticsHandle,
    jpeg_quality: u8,
}

impl CapturePipeline {
    pub fn new(
        camera: CameraSessionManager,
        backend: Arc<dyn DetectionBackend>,
        store: SessionStateStore,
        analytics: AnalyticsHandle,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            camera,
            backend,
            store,
            analytics,
            jpeg_quality,
        }
    }

    /// Classify `source` and reconcile the answer into the session state.
    ///
    /// Manual captures are refused while any capture is in flight.
    /// Scheduled captures may overlap; their results are applied in issue
    /// order and late ones are dropped.
    pub async fn capture_and_classify(&self, source: CaptureSource, trigger: Trigger) -> CaptureOutcome {
        match self.reserve(&source, trigger) {
            Ok(ticket) => self.run(ticket, source).await,
            Err(outcome) => outcome,
        }
    }

    /// Claim a capture slot for `source` without doing any work yet. On
    /// refusal the outcome to report is returned instead.
    pub fn reserve(&self, source: &CaptureSource, trigger: Trigger) -> Result<CaptureTicket, CaptureOutcome> {
        if matches!(source, CaptureSource::LiveFrame) && !self.camera.is_streaming() {
            tracing::debug!(?trigger, "live capture requested without a streaming camera");
            if trigger == Trigger::Manual {
                self.store.report_error(CAMERA_NOT_STREAMING_MESSAGE);
            }
            return Err(CaptureOutcome::CameraNotStreaming);
        }

        self.store.begin_capture(trigger).map_err(|rejected| {
            tracing::debug!(%rejected, "capture rejected");
            CaptureOutcome::Busy
        })
    }

    /// Classify `source` on a slot obtained from [`reserve`](Self::reserve).
    pub async fn run(&self, ticket: CaptureTicket, source: CaptureSource) -> CaptureOutcome {
        let seq = ticket.seq();

        let result = match self.classify(source).await {
            Ok(response) => DetectionResult::from_response(response),
            Err(e) => {
                tracing::warn!(seq, error = %e, "capture failed");
                DetectionResult::failed(CAPTURE_FAILED_MESSAGE)
            }
        };

        if result.is_error() {
            tracing::info!(seq, error = %result.error, "detection reported an error");
        } else {
            tracing::info!(
                seq,
                emotion = %result.primary_emotion,
                confidence = ?result.primary_confidence,
                faces = result.faces.len(),
                "detection result"
            );
        }

        let outcome = match ticket.reconcile(result) {
            Reconciliation::Applied => CaptureOutcome::Applied,
            Reconciliation::Superseded { .. } => CaptureOutcome::Superseded,
        };
        self.analytics.refresh_now();
        outcome
    }

    async fn classify(&self, source: CaptureSource) -> Result<DetectionResponse, CaptureError> {
        match source {
            CaptureSource::LiveFrame => {
                let frame = self.camera.capture_frame().await?;
                if frame.is_dark {
                    tracing::warn!(
                        sequence = frame.sequence,
                        brightness = frame.avg_brightness(),
                        "captured frame is almost entirely dark"
                    );
                }

                let quality = self.jpeg_quality;
                let data_url = tokio::task::spawn_blocking(move || {
                    encode_jpeg(&frame, REFERENCE_WIDTH, REFERENCE_HEIGHT, quality).map(|jpeg| jpeg_data_url(&jpeg))
                })
                .await??;

                Ok(self.backend.classify_frame(data_url).await?)
            }
            CaptureSource::StillImage(image) => Ok(self.backend.classify_upload(image).await?),
        }
    }
}
