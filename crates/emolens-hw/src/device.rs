//! Camera device traits shared by every capture backend.

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

impl CameraError {
    /// True when the device could not be acquired at all, as opposed to a
    /// failure while reading from an open device.
    pub fn is_access_error(&self) -> bool {
        !matches!(self, CameraError::CaptureFailed(_))
    }
}

/// Requested capture format for the user-facing camera. Backends treat the
/// size as an ideal, not a hard requirement, and report what they
/// negotiated in [`DeviceInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// Info about an opened or discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub width: u32,
    pub height: u32,
}

/// An open, exclusively held capture device. Dropping it releases the device.
pub trait VideoDevice: Send {
    fn info(&self) -> &DeviceInfo;

    /// Block until the next frame is available.
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens capture devices.
pub trait DeviceProvider: Send {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn VideoDevice>, CameraError>;
}
