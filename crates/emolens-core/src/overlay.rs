//! Overlay geometry. Maps reference-frame face boxes onto any display.
//!
//! Placement is a percentage of the reference frame, so the same overlay
//! lines up with the image at whatever size it is rendered.

use crate::types::{BoundingBox, Face, REFERENCE_HEIGHT, REFERENCE_WIDTH};
use serde::Serialize;
use thiserror::Error;

/// Border/label color for emotions outside the palette.
pub const FALLBACK_COLOR: &str = "#6b7280";

const EMOTION_PALETTE: [(&str, &str); 7] = [
    ("Angry", "#ef4444"),
    ("Disgust", "#22c55e"),
    ("Fear", "#8b5cf6"),
    ("Happy", "#fbbf24"),
    ("Sad", "#3b82f6"),
    ("Surprise", "#f97316"),
    ("Neutral", FALLBACK_COLOR),
];

#[derive(Error, Debug, PartialEq)]
pub enum OverlayError {
    #[error("reference frame must be non-empty, got {width}x{height}")]
    EmptyReference { width: u32, height: u32 },
}

/// Coordinate space the detection service reports boxes in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceFrame {
    width: f32,
    height: f32,
}

impl ReferenceFrame {
    pub fn new(width: u32, height: u32) -> Result<Self, OverlayError> {
        if width == 0 || height == 0 {
            return Err(OverlayError::EmptyReference { width, height });
        }
        Ok(Self {
            width: width as f32,
            height: height as f32,
        })
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }
}

impl Default for ReferenceFrame {
    /// The 640x480 frame used by the detection service.
    fn default() -> Self {
        Self {
            width: REFERENCE_WIDTH as f32,
            height: REFERENCE_HEIGHT as f32,
        }
    }
}

/// Box placement as percentages of the displayed element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayRect {
    pub left_pct: f32,
    pub top_pct: f32,
    pub width_pct: f32,
    pub height_pct: f32,
}

impl OverlayRect {
    /// Pixel rectangle `(left, top, width, height)` for a display of the given size.
    pub fn to_pixels(&self, render_width: f32, render_height: f32) -> (f32, f32, f32, f32) {
        (
            self.left_pct / 100.0 * render_width,
            self.top_pct / 100.0 * render_height,
            self.width_pct / 100.0 * render_width,
            self.height_pct / 100.0 * render_height,
        )
    }
}

/// Everything needed to draw one face: box, caption and color.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceOverlay {
    pub rect: OverlayRect,
    pub emotion: String,
    pub confidence: f32,
    /// Caption such as `Happy (87.3%)`.
    pub label: String,
    pub color: &'static str,
}

/// Map a reference-frame box to percentage placement.
pub fn map_to_overlay(bbox: &BoundingBox, reference: ReferenceFrame) -> OverlayRect {
    OverlayRect {
        left_pct: bbox.x / reference.width * 100.0,
        top_pct: bbox.y / reference.height * 100.0,
        width_pct: bbox.w / reference.width * 100.0,
        height_pct: bbox.h / reference.height * 100.0,
    }
}

/// Build one overlay per face, in the order the service returned them.
pub fn render_overlays(faces: &[Face], reference: ReferenceFrame) -> Vec<FaceOverlay> {
    faces
        .iter()
        .map(|face| FaceOverlay {
            rect: map_to_overlay(&face.bbox, reference),
            emotion: face.emotion.clone(),
            confidence: face.confidence,
            label: format!("{} ({:.1}%)", face.emotion, face.confidence),
            color: emotion_color(&face.emotion),
        })
        .collect()
}

/// Display color for an emotion label.
pub fn emotion_color(emotion: &str) -> &'static str {
    EMOTION_PALETTE
        .iter()
        .find(|(name, _)| *name == emotion)
        .map(|(_, color)| *color)
        .unwrap_or(FALLBACK_COLOR)
}
