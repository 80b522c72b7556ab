use base64::{engine::general_purpose::STANDARD, Engine as _};
use herd_core::oracle_contracts::{OracleError, OracleFailureKind};
use herd_core::SampledFrame;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: &'static str,
    pub base64_data: String,
    pub width: u32,
    pub height: u32,
}

/// Re-encodes a frame as base64 JPEG, downscaled so neither side exceeds
/// `max_dimension` (0 keeps the original size).
pub fn encode_frame(frame: &SampledFrame, max_dimension: u32) -> Result<EncodedImage, OracleError> {
    let mut image = image::load_from_memory(&frame.bytes).map_err(|err| {
        OracleError::new(
            OracleFailureKind::Encoding,
            format!("frame {} could not be decoded: {err}", frame.index),
        )
    })?;

    if max_dimension > 0 && (image.width() > max_dimension || image.height() > max_dimension) {
        image = image.resize(max_dimension, max_dimension, FilterType::Triangle);
    }

    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|err| {
            OracleError::new(
                OracleFailureKind::Encoding,
                format!("frame {} could not be encoded as jpeg: {err}", frame.index),
            )
        })?;

    Ok(EncodedImage {
        mime_type: "image/jpeg",
        base64_data: STANDARD.encode(&buffer),
        width: rgb.width(),
        height: rgb.height(),
    })
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 255) as u8, (y % 255) as u8, 120])
    });
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Png)
        .expect("encode png fixture");
    cursor.into_inner()
}
