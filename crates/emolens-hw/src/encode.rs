//! JPEG encoding into a fixed output size and data-URL packaging.

use crate::frame::Frame;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use thiserror::Error;

/// JPEG quality for live captures (0.8 on a 0–1 scale).
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame buffer does not match {width}x{height} RGB")]
    BufferMismatch { width: u32, height: u32 },
    #[error("target size must be non-zero, got {width}x{height}")]
    EmptyTarget { width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Draw `frame` onto a `width` x `height` canvas (stretching, like a
/// canvas `drawImage`) and encode it as JPEG.
pub fn encode_jpeg(frame: &Frame, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyTarget { width, height });
    }

    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or(
        EncodeError::BufferMismatch {
            width: frame.width,
            height: frame.height,
        },
    )?;

    let img = if img.dimensions() == (width, height) {
        img
    } else {
        image::imageops::resize(&img, width, height, FilterType::Triangle)
    };

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    img.write_with_encoder(encoder)?;
    Ok(out)
}

/// `data:image/jpeg;base64,...` URL for an encoded JPEG.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    base64::engine::general_purpose::STANDARD.encode_string(jpeg, &mut url);
    url
}

/// MIME type of an encoded image, sniffed from its magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|format| format.to_mime_type())
}
