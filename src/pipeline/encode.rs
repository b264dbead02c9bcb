//! Image encoding: raw bytes → base64 payload with a sniffed MIME type.
//!
//! Vision APIs take images as base64 blobs in the JSON body, tagged with a
//! MIME type. Extracted images are usually PNG, but standalone inputs may be
//! JPEG, so the type is sniffed from the magic bytes rather than assumed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// A base64 image ready for a provider request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub mime_type: &'static str,
}

impl EncodedImage {
    /// Convert into the edgequake-llm attachment type.
    ///
    /// `detail: "high"` keeps small labels and axis values legible to
    /// OpenAI-style tilers.
    pub fn into_image_data(self) -> ImageData {
        ImageData::new(self.data, self.mime_type).with_detail("high")
    }
}

/// MIME type of an image, from its magic bytes. Defaults to PNG.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        _ => "image/png",
    }
}

/// Base64-encode raw image bytes.
pub fn encode_bytes(bytes: &[u8]) -> EncodedImage {
    let data = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", data.len());
    EncodedImage {
        data,
        mime_type: sniff_mime(bytes),
    }
}

/// PNG-encode a decoded image (pdfium hands us `DynamicImage`s).
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red_square() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn png_round_trip_through_base64() {
        let png = png_bytes(&red_square()).expect("encode should succeed");
        let enc = encode_bytes(&png);
        assert_eq!(enc.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&enc.data).expect("valid base64"), png);
    }

    #[test]
    fn sniffs_jpeg() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "image/jpeg");
    }

    #[test]
    fn unknown_bytes_default_to_png() {
        assert_eq!(sniff_mime(b"not an image"), "image/png");
    }
}
