use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Width of the coordinate space the detection service reports boxes in.
pub const REFERENCE_WIDTH: u32 = 640;
/// Height of the coordinate space the detection service reports boxes in.
pub const REFERENCE_HEIGHT: u32 = 480;

/// Primary emotion shown when the service answered without naming one.
pub const NO_FACE_DETECTED: &str = "No face detected";

/// Face bounding box in reference-frame pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub w: f32,
    #[serde(default)]
    pub h: f32,
}

/// A classified face as returned by the detection service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Face {
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default)]
    pub emotion: String,
    /// Confidence of `emotion`, 0–100.
    #[serde(default)]
    pub confidence: f32,
    /// Score per emotion label, 0–100.
    #[serde(default)]
    pub all_emotions: BTreeMap<String, f32>,
}

/// Wire shape of a `/webcam` or `/upload` answer.
///
/// Every field is optional. Older backends answer with `emotion` and
/// `confidence` instead of the `primary_*` keys; both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    #[serde(default, alias = "emotion")]
    pub primary_emotion: Option<String>,
    #[serde(default, alias = "confidence")]
    pub primary_confidence: Option<f32>,
    #[serde(default)]
    pub faces: Option<Vec<Face>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reconciled detection state shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Empty until the first capture completes.
    pub primary_emotion: String,
    pub primary_confidence: Option<f32>,
    pub faces: Vec<Face>,
    /// Per-emotion scores of the first face, empty without faces.
    pub all_emotions: BTreeMap<String, f32>,
    /// Service-reported or transport error; empty on success.
    pub error: String,
}

impl DetectionResult {
    /// Reconcile a service response into display state.
    ///
    /// A non-empty `error` clears every detection field. Otherwise the
    /// primary emotion defaults to [`NO_FACE_DETECTED`] and the score map
    /// is taken from the first face.
    pub fn from_response(response: DetectionResponse) -> Self {
        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            return Self::failed(error);
        }

        let faces = response.faces.unwrap_or_default();
        let all_emotions = faces
            .first()
            .map(|face| face.all_emotions.clone())
            .unwrap_or_default();

        Self {
            primary_emotion: response
                .primary_emotion
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| NO_FACE_DETECTED.to_string()),
            primary_confidence: response.primary_confidence,
            faces,
            all_emotions,
            error: String::new(),
        }
    }

    /// An errored result with all detection fields cleared.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

impl From<DetectionResponse> for DetectionResult {
    fn from(response: DetectionResponse) -> Self {
        Self::from_response(response)
    }
}

/// Aggregate counters for the current backend session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    #[serde(default)]
    pub duration_minutes: f64,
    #[serde(default)]
    pub total_predictions: u64,
    /// Share of predictions per emotion, 0–100.
    #[serde(default)]
    pub emotion_percentages: BTreeMap<String, f64>,
}

/// One past prediction in the session history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub confidence: f32,
    /// RFC 3339 string or unix seconds on the wire; anything else is dropped.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Session-wide summary served by `/analytics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    #[serde(default)]
    pub session_stats: SessionStats,
    #[serde(default)]
    pub dominant_emotion: Option<String>,
    #[serde(default)]
    pub recent_history: Vec<HistoryEntry>,
}

impl AnalyticsSnapshot {
    /// Emotions with a non-zero share, largest first.
    pub fn distribution(&self) -> Vec<(&str, f64)> {
        let mut shares: Vec<(&str, f64)> = self
            .session_stats
            .emotion_percentages
            .iter()
            .filter(|(_, pct)| **pct > 0.0)
            .map(|(emotion, pct)| (emotion.as_str(), *pct))
            .collect();
        shares.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        shares
    }

    /// The last `count` history entries, newest first.
    pub fn latest(&self, count: usize) -> Vec<&HistoryEntry> {
        self.recent_history.iter().rev().take(count).collect()
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64)),
        _ => None,
    })
}
