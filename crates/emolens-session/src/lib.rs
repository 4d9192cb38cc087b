//! emolens-session — Client-side orchestration of an emotion detection session.
//!
//! Owns the camera device, drives captures through the detection backend,
//! runs the real-time and analytics loops, and reconciles everything into
//! one [`SessionStateStore`](emolens_core::SessionStateStore).

pub mod analytics;
pub mod camera;
pub mod client;
pub mod config;
pub mod pipeline;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use analytics::{AnalyticsHandle, AnalyticsPoller};
pub use camera::{CameraSessionError, CameraSessionManager, CameraState, StartOutcome, StopOutcome};
pub use client::{DetectionBackend, HttpBackend, TransportError, UploadImage};
pub use config::{Config, ConfigError};
pub use pipeline::{CaptureOutcome, CaptureSource, CapturePipeline};
pub use scheduler::{RealTimeScheduler, SchedulerError, SchedulerState};
pub use session::{EmotionSession, SessionError};
