//! HTTP client for the detection and analytics backend.

use async_trait::async_trait;
use emolens_core::{AnalyticsSnapshot, DetectionResponse};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// A still image to send to `/upload`.
#[derive(Debug, Clone)]
pub struct UploadImage {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl UploadImage {
    /// Wrap encoded image bytes, sniffing the MIME type from their content.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mime = emolens_hw::encode::sniff_mime(&bytes)
            .unwrap_or("application/octet-stream")
            .to_string();
        Self {
            file_name: file_name.into(),
            mime,
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Ok(Self::new(file_name, bytes))
    }
}

/// The remote collaborator that classifies images and keeps session analytics.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    /// `POST /webcam` with a JPEG data URL.
    async fn classify_frame(&self, data_url: String) -> Result<DetectionResponse, TransportError>;

    /// `POST /upload` with the image as multipart field `image`.
    async fn classify_upload(&self, image: UploadImage) -> Result<DetectionResponse, TransportError>;

    /// `GET /analytics`.
    async fn fetch_analytics(&self) -> Result<AnalyticsSnapshot, TransportError>;

    /// `POST /reset-session`.
    async fn reset_session(&self) -> Result<(), TransportError>;
}

/// [`DetectionBackend`] over HTTP.
pub struct HttpBackend {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl DetectionBackend for HttpBackend {
    async fn classify_frame(&self, data_url: String) -> Result<DetectionResponse, TransportError> {
        tracing::debug!(bytes = data_url.len(), "POST /webcam");
        let response = self
            .http
            .post(self.url("webcam"))
            .json(&serde_json::json!({ "image": data_url }))
            .send()
            .await?;
        decode_detection(response).await
    }

    async fn classify_upload(&self, image: UploadImage) -> Result<DetectionResponse, TransportError> {
        tracing::debug!(file = %image.file_name, mime = %image.mime, bytes = image.bytes.len(), "POST /upload");
        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(&image.mime)?;
        let response = self
            .http
            .post(self.url("upload"))
            .multipart(Form::new().part("image", part))
            .send()
            .await?;
        decode_detection(response).await
    }

    async fn fetch_analytics(&self) -> Result<AnalyticsSnapshot, TransportError> {
        let response = self.http.get(self.url("analytics")).send().await?;
        decode(response).await
    }

    async fn reset_session(&self) -> Result<(), TransportError> {
        let response = self.http.post(self.url("reset-session")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status { status, body });
    }
    Ok(response.json::<T>().await?)
}

/// Like [`decode`], but an error status whose body still carries an
/// `error` field is the service reporting a problem, not a transport failure.
async fn decode_detection(response: reqwest::Response) -> Result<DetectionResponse, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<DetectionResponse>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<DetectionResponse>(&body) {
        Ok(reported) if reported.error.as_deref().is_some_and(|e| !e.is_empty()) => Ok(reported),
        _ => Err(TransportError::Status { status, body }),
    }
}
