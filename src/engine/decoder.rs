// src/engine/decoder.rs
//
// Probe and decode: container detection, header-only dimensions,
// format classification, and full decodes routed to the fastest codec
// (JPEG → mozjpeg, PNG → zune-png, WebP → libwebp, rest → image crate).

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::io::SourceImage;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::CompressError;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

/// How a detected container reaches the encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatClass {
    /// Decodes straight into an encodable raster
    DirectEncodable,
    /// Must go through the format normalizer first (TIFF)
    NeedsNormalization,
    /// Recognised but not accepted
    Unsupported,
}

/// Where the container type came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectedBy {
    MagicBytes,
    MimeHint,
    Extension,
}

/// Header facts about a source, gathered without decoding pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbedImage {
    /// Width as stored in the container (before EXIF orientation)
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub class: FormatClass,
    pub detected_by: DetectedBy,
    /// EXIF orientation (1-8), when present
    pub orientation: Option<u16>,
}

impl ProbedImage {
    /// Dimensions after EXIF orientation; 5-8 swap the axes.
    pub fn oriented_dimensions(&self) -> (u32, u32) {
        match self.orientation {
            Some(5..=8) => (self.height, self.width),
            _ => (self.width, self.height),
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn format_name(&self) -> &'static str {
        format_name(self.format)
    }
}

pub fn classify(format: ImageFormat) -> FormatClass {
    match format {
        ImageFormat::Jpeg
        | ImageFormat::Png
        | ImageFormat::WebP
        | ImageFormat::Gif
        | ImageFormat::Bmp => FormatClass::DirectEncodable,
        ImageFormat::Tiff => FormatClass::NeedsNormalization,
        _ => FormatClass::Unsupported,
    }
}

pub fn format_name(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("unknown")
}

/// Detect input format using magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Magic bytes first, then the declared MIME hint, then the file extension.
pub fn detect_source_format(source: &SourceImage) -> Option<(ImageFormat, DetectedBy)> {
    if let Some(format) = detect_format(source.as_bytes()) {
        return Some((format, DetectedBy::MagicBytes));
    }
    if let Some(format) = source.mime_hint().and_then(ImageFormat::from_mime_type) {
        return Some((format, DetectedBy::MimeHint));
    }
    source
        .extension_hint()
        .and_then(ImageFormat::from_extension)
        .map(|format| (format, DetectedBy::Extension))
}

/// Probe a source: container, class and header dimensions.
///
/// Bytes that are not a raster image fail with `DecodeFailed`; a recognised
/// container we do not accept fails with `UnsupportedFormat`.
pub fn probe(source: &SourceImage) -> EngineResult<ProbedImage> {
    let bytes = source.as_bytes();
    if bytes.is_empty() {
        return Err(CompressError::decode_failed("empty input"));
    }

    let (format, detected_by) = detect_source_format(source).ok_or_else(|| {
        CompressError::decode_failed(format!(
            "'{}' is not a recognised image container",
            source.declared_name()
        ))
    })?;

    let class = classify(format);
    if class == FormatClass::Unsupported {
        return Err(CompressError::unsupported_format(format_name(format)));
    }

    let (width, height) = read_header_dimensions(bytes, format)?;
    if width == 0 || height == 0 {
        return Err(CompressError::decode_failed(format!(
            "{}: zero-sized image ({width}x{height})",
            format_name(format)
        )));
    }
    check_dimensions(width, height)?;

    Ok(ProbedImage {
        width,
        height,
        format,
        class,
        detected_by,
        orientation: detect_exif_orientation(bytes),
    })
}

fn read_header_dimensions(bytes: &[u8], format: ImageFormat) -> EngineResult<(u32, u32)> {
    run_with_panic_policy("probe:header", || {
        ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(|e| {
                CompressError::decode_failed(format!(
                    "{}: cannot read header: {e}",
                    format_name(format)
                ))
            })
    })
}

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo)
pub fn decode_jpeg_mozjpeg(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(CompressError::decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            CompressError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;

        let mut decompress = decompress.rgb().map_err(|e| {
            CompressError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = decompress.width();
        let height = decompress.height();
        if width > MAX_DIMENSION as usize || height > MAX_DIMENSION as usize {
            return Err(CompressError::dimension_exceeds_limit(
                width.max(height) as u32,
                MAX_DIMENSION,
            ));
        }
        let width_u32 = width as u32;
        let height_u32 = height as u32;
        check_dimensions(width_u32, height_u32)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            CompressError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image =
            RgbImage::from_raw(width_u32, height_u32, flat_pixels).ok_or_else(|| {
                CompressError::decode_failed("mozjpeg: failed to create image from raw data")
            })?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        let mut decoder = PngDecoder::new_with_options(zune_core::bytestream::ZCursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| CompressError::decode_failed(format!("png: decode failed: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| CompressError::decode_failed("png: missing header info"))?;

        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(CompressError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| CompressError::decode_failed("png: missing colorspace"))?;

        let img = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| CompressError::decode_failed("png: failed to build RGB image"))?,
            ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| CompressError::decode_failed("png: failed to build RGBA image"))?,
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| CompressError::decode_failed("png: failed to build Luma image"))?,
            ColorSpace::LumaA => GrayAlphaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(|| {
                    CompressError::decode_failed("png: failed to build LumaA image")
                })?,
            other => {
                return Err(CompressError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };

        Ok(img)
    })
}

/// Decode WebP using libwebp. Animated WebP falls back to the image crate
/// (first frame).
pub fn decode_webp_libwebp(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Parse header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data).ok_or_else(|| {
            CompressError::decode_failed("webp: failed to read bitstream features")
        })?;

        if features.has_animation() {
            return image::load_from_memory_with_format(data, ImageFormat::WebP).map_err(|e| {
                CompressError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        check_dimensions(features.width(), features.height())?;

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| CompressError::decode_failed("webp: decode failed"))?;
        check_dimensions(decoded.width(), decoded.height())?;

        Ok(decoded.to_image())
    })
}

/// Decode with the image crate under the panic policy.
/// The format is explicit because it may come from a hint, not magic bytes.
pub fn decode_with_image_crate(data: &[u8], format: ImageFormat) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        image::load_from_memory_with_format(data, format).map_err(|e| {
            CompressError::decode_failed(format!("{}: decode failed: {e}", format_name(format)))
        })
    })
}

/// Full decode of a directly-encodable source.
pub fn decode_image(bytes: &[u8], format: ImageFormat) -> EngineResult<DynamicImage> {
    match format {
        ImageFormat::Jpeg => decode_jpeg_mozjpeg(bytes),
        ImageFormat::Png => decode_png_zune(bytes),
        ImageFormat::WebP => decode_webp_libwebp(bytes),
        other => decode_with_image_crate(bytes, other),
    }
}

/// Check if image dimensions are within safe limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32) -> EngineResult<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(CompressError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(CompressError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Extract EXIF Orientation tag (1-8). Returns None if missing or invalid.
pub fn detect_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = field.value.get_uint(0)? as u16;
    (1..=8).contains(&orientation).then_some(orientation)
}

/// Rotate/flip so the pixels match the EXIF display orientation.
pub fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(), // transpose
        6 => img.rotate90(),
        7 => img.rotate270().fliph(), // transverse
        8 => img.rotate270(),
        _ => img,
    }
}
