//! Transport decoding: base64 (optionally wrapped in a `data:` URI) to RGB pixels.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
}

/// Strip a `data:image/...;base64,` prefix if the client sent a data URI.
fn strip_data_uri(payload: &str) -> &str {
    match payload.split_once("base64,") {
        Some((_, body)) => body,
        None => payload,
    }
}

/// Decode a base64 image payload into 8-bit RGB pixels.
pub fn decode_base64_image(payload: &str) -> Result<RgbImage, CodecError> {
    let body = strip_data_uri(payload.trim()).trim();
    if body.is_empty() {
        return Err(CodecError::Empty);
    }

    let bytes = STANDARD.decode(body)?;
    decode_image_bytes(&bytes)
}

/// Decode raw encoded image bytes (PNG, JPEG, ...) into 8-bit RGB pixels.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// Base64-encode raw image bytes for transport.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
