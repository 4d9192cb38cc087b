//! emolens-hw — Camera device access and frame encoding.
//!
//! Provides V4L2-based camera access, a still-image stand-in camera, and
//! the JPEG/data-URL encoding live frames are sent to the detection
//! service with.

pub mod device;
pub mod encode;
pub mod frame;
pub mod still;
pub mod v4l2;

pub use device::{CameraError, CaptureConstraints, DeviceInfo, DeviceProvider, VideoDevice};
pub use frame::Frame;
pub use still::StillImageProvider;
pub use v4l2::{V4lCamera, V4lProvider};
