//! Transport codec: base64 text ⇄ `RgbImage`.
//!
//! Browsers hand frames over as `canvas.toDataURL()` strings, i.e. a
//! `data:image/jpeg;base64,` header followed by the payload. Everything up to
//! the first comma is discarded, so bare base64 and data-URIs decode the same.
//! Rectified results go back out as JPEG data-URIs.

use crate::error::CardflatError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use tracing::debug;

/// Header prepended to every encoded payload.
pub const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// A decoded-from-base64 but not yet decompressed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Compressed container bytes exactly as the client sent them.
    pub bytes: Vec<u8>,
    /// Container format sniffed from the magic bytes.
    pub format: ImageFormat,
}

impl Frame {
    /// Decompress the container into an RGB raster.
    pub fn to_raster(&self) -> Result<RgbImage, CardflatError> {
        let img = image::load_from_memory_with_format(&self.bytes, self.format)
            .map_err(|e| CardflatError::decode(format!("corrupt {:?} data: {e}", self.format)))?;
        debug!("Decoded frame → {}x{} px", img.width(), img.height());
        Ok(img.to_rgb8())
    }
}

/// Strip an optional `<scheme>,` header, returning the payload part.
pub fn strip_data_uri(text: &str) -> &str {
    match text.split_once(',') {
        Some((_, payload)) => payload,
        None => text,
    }
}

/// Base64-decode `text` and identify its image container.
pub fn decode_frame(text: &str) -> Result<Frame, CardflatError> {
    let payload: String = strip_data_uri(text)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let bytes = STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| CardflatError::decode(format!("invalid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(CardflatError::decode("empty image payload"));
    }

    let format = image::guess_format(&bytes)
        .map_err(|e| CardflatError::decode(format!("unrecognised image container: {e}")))?;
    debug!("Frame payload: {} bytes, {:?}", bytes.len(), format);

    Ok(Frame { bytes, format })
}

/// Decode a (optionally data-URI prefixed) base64 image into an RGB raster.
pub fn decode(text: &str) -> Result<RgbImage, CardflatError> {
    decode_frame(text)?.to_raster()
}

/// JPEG-compress a raster. `quality` must lie in 1–100.
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, CardflatError> {
    if !(1..=100).contains(&quality) {
        return Err(CardflatError::encode(format!(
            "JPEG quality must be 1–100, got {quality}"
        )));
    }
    if img.width() == 0 || img.height() == 0 {
        return Err(CardflatError::encode(format!(
            "cannot encode a {}x{} image",
            img.width(),
            img.height()
        )));
    }

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(img)
        .map_err(|e| CardflatError::encode(e.to_string()))?;
    Ok(buf)
}

/// Encode a raster as a `data:image/jpeg;base64,` string.
pub fn encode(img: &RgbImage, quality: u8) -> Result<String, CardflatError> {
    let jpeg = encode_jpeg(img, quality)?;
    let b64 = STANDARD.encode(&jpeg);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(format!("{JPEG_DATA_URI_PREFIX}{b64}"))
}
