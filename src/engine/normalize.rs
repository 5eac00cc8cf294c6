// src/engine/normalize.rs
//
// Format normalizer: TIFF-class inputs become an 8-bit RGB/RGBA raster the
// encoders accept. Only the first page (IFD) is used.

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::decoder::{FormatClass, ProbedImage};
use crate::engine::encoder::{Provenance, WorkingImage};
use crate::engine::io::SourceImage;
use crate::error::CompressError;
use image::codecs::tiff::TiffDecoder;
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;

/// Output of the normalizer.
#[derive(Clone, Debug)]
pub struct NormalizedImage {
    pub working: WorkingImage,
    /// Size of the intermediate raster buffer in bytes
    pub byte_size: u64,
}

/// Normalize a probed `NeedsNormalization` source.
///
/// Pixel dimensions are preserved exactly. Any decoder failure here is a
/// `ConversionFailed`, never a decode error: the probe already accepted the
/// container.
pub fn normalize(source: &SourceImage, probed: &ProbedImage) -> EngineResult<NormalizedImage> {
    if probed.class != FormatClass::NeedsNormalization {
        return Err(CompressError::invalid_argument(
            "format_class",
            format!("{:?}", probed.class),
            "Only TIFF-class inputs are normalized",
        ));
    }

    let name = probed.format_name();
    let decoded = run_with_panic_policy("normalize:tiff", || decode_first_page(source.as_bytes()))
        .map_err(|e| match e {
            CompressError::InternalPanic { .. } => e,
            other => CompressError::conversion_failed(name, other.to_string()),
        })?;

    let raster = to_8bit_raster(decoded);
    if (raster.width(), raster.height()) != (probed.width, probed.height) {
        return Err(CompressError::conversion_failed(
            name,
            format!(
                "decoded {}x{} but header declared {}x{}",
                raster.width(),
                raster.height(),
                probed.width,
                probed.height
            ),
        ));
    }

    let byte_size = raster.as_bytes().len() as u64;
    tracing::debug!(
        width = raster.width(),
        height = raster.height(),
        alpha = raster.color().has_alpha(),
        byte_size,
        "normalized TIFF first page"
    );

    Ok(NormalizedImage {
        working: WorkingImage::new(Arc::new(raster), Provenance::Normalized),
        byte_size,
    })
}

fn decode_first_page(bytes: &[u8]) -> EngineResult<DynamicImage> {
    let decoder = TiffDecoder::new(Cursor::new(bytes))
        .map_err(|e| CompressError::decode_failed(format!("tiff header: {e}")))?;
    DynamicImage::from_decoder(decoder)
        .map_err(|e| CompressError::decode_failed(format!("tiff pixels: {e}")))
}

/// 16-bit and float samples are reduced to 8 bits; alpha is kept only when
/// the source has it.
fn to_8bit_raster(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}
