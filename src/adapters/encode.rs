//! Image encoding: `DynamicImage` → base64 PNG.
//!
//! Scanned pages have no text layer, so the parser receives them as images.
//! PNG is chosen over JPEG because it is lossless; digits in a ledger column
//! must survive encoding exactly.

use super::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page as a base64 PNG.
pub fn encode_page(img: &DynamicImage) -> Result<PageImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let data = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", data.len());

    Ok(PageImage {
        mime_type: "image/png".to_string(),
        data,
    })
}

/// Wrap a stored page image for a multimodal chat request.
///
/// `detail: "high"` keeps small print legible on providers that tile images.
pub fn to_image_data(image: &PageImage) -> ImageData {
    ImageData::new(image.data.clone(), image.mime_type.clone()).with_detail("high")
}
