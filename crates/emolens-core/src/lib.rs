//! emolens-core — Detection data model, session state and overlay geometry.
//!
//! Holds everything the session layer reconciles into and everything a
//! display layer reads out of: service response shapes, the fenced
//! session state store, and the reference-frame overlay mapping.

pub mod overlay;
pub mod state;
pub mod types;

pub use overlay::{map_to_overlay, render_overlays, FaceOverlay, OverlayRect, ReferenceFrame};
pub use state::{CaptureTicket, DisplaySource, Reconciliation, SessionState, SessionStateStore, Trigger};
pub use types::{AnalyticsSnapshot, BoundingBox, DetectionResponse, DetectionResult, Face};
