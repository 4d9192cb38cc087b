//! Synthetic camera that serves one still image as a looping frame source.
//!
//! Lets the live pipeline run on hosts without a webcam.

use crate::device::{CameraError, CaptureConstraints, DeviceInfo, DeviceProvider, VideoDevice};
use crate::frame::Frame;
use std::path::Path;

/// Provides [`StillCamera`] devices backed by a decoded image.
pub struct StillImageProvider {
    source: String,
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

impl StillImageProvider {
    /// Decode an image file once; every opened device serves it.
    pub fn from_path(path: &Path) -> Result<Self, CameraError> {
        let img = image::open(path)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", path.display())))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        tracing::debug!(path = %path.display(), width, height, "loaded still camera image");
        Ok(Self {
            source: path.display().to_string(),
            width,
            height,
            rgb: img.into_raw(),
        })
    }

    /// Serve an already captured frame.
    pub fn from_frame(name: &str, frame: &Frame) -> Self {
        Self {
            source: name.to_string(),
            width: frame.width,
            height: frame.height,
            rgb: frame.data.clone(),
        }
    }
}

impl DeviceProvider for StillImageProvider {
    fn open(&self, _constraints: &CaptureConstraints) -> Result<Box<dyn VideoDevice>, CameraError> {
        Ok(Box::new(StillCamera {
            info: DeviceInfo {
                path: self.source.clone(),
                name: "still image".to_string(),
                driver: "emolens-still".to_string(),
                width: self.width,
                height: self.height,
            },
            rgb: self.rgb.clone(),
            sequence: 0,
        }))
    }
}

/// A device that returns the same image on every capture.
pub struct StillCamera {
    info: DeviceInfo,
    rgb: Vec<u8>,
    sequence: u32,
}

impl VideoDevice for StillCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let frame = Frame::from_rgb(self.rgb.clone(), self.info.width, self.info.height, self.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}
