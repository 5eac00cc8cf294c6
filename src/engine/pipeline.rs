// src/engine/pipeline.rs
//
// Dimension planning and Lanczos3 resampling.
// plan_dimensions is pure; fast_resize is the single resampler every
// rasterize step goes through (fast_image_resize, image crate fallback).

use crate::engine::common::EngineResult;
use crate::error::CompressError;
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, RgbImage, RgbaImage};

/// Fit `native` inside the `max` envelope, preserving aspect ratio.
///
/// Never upscales. Rounds half away from zero and never returns a zero side.
/// Applying the planner to its own output is a no-op.
pub fn plan_dimensions(native_w: u32, native_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if native_w <= max_w && native_h <= max_h {
        return (native_w, native_h);
    }
    if native_w == 0 || native_h == 0 {
        return (native_w.clamp(1, max_w.max(1)), native_h.clamp(1, max_h.max(1)));
    }

    let aspect = native_w as f64 / native_h as f64;

    // Width-constrained first
    let height_at_max_w = round_dimension(max_w as f64 / aspect);
    if height_at_max_w <= max_h {
        return (max_w.max(1), height_at_max_w);
    }

    // Still too tall: height-constrained
    (round_dimension(max_h as f64 * aspect), max_h.max(1))
}

#[inline]
fn round_dimension(value: f64) -> u32 {
    // f64::round rounds half away from zero
    (value.round() as u32).max(1)
}

/// Whether `target` is strictly smaller than `current` on at least one side
/// and larger on neither.
pub fn shrinks(current: (u32, u32), target: (u32, u32)) -> bool {
    target.0 <= current.0 && target.1 <= current.1 && target != current
}

fn default_resize_options() -> ResizeOptions {
    ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3))
}

/// Resample to exactly `dst_width` x `dst_height`.
///
/// RGB8/RGBA8 buffers are used as-is; every other layout is widened to RGBA8.
/// The source is never mutated.
pub fn fast_resize(img: &DynamicImage, dst_width: u32, dst_height: u32) -> EngineResult<DynamicImage> {
    let src_width = img.width();
    let src_height = img.height();
    let fail = |reason: String| {
        CompressError::resize_failed((src_width, src_height), (dst_width, dst_height), reason)
    };

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(fail("invalid dimensions for resize".to_string()));
    }

    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.as_raw().clone()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.as_raw().clone()),
        other => (PixelType::U8x4, other.to_rgba8().into_raw()),
    };

    resize_pixels(
        src_width,
        src_height,
        src_pixels,
        pixel_type,
        dst_width,
        dst_height,
        default_resize_options(),
    )
    .map_err(fail)
}

/// Decide whether alpha premultiplication is required for a given pixel layout.
#[inline]
fn requires_premultiply(pixel_type: PixelType) -> bool {
    matches!(pixel_type, PixelType::U8x4)
}

fn resize_pixels(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let pixel_count = (src_width as usize)
        .checked_mul(src_height as usize)
        .ok_or_else(|| "image dimensions overflow during resize".to_string())?;
    let required_bytes = pixel_count
        .checked_mul(pixel_type.size())
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;

    if src_pixels.len() < required_bytes {
        return Err(format!(
            "fir source image invalid buffer size. expected {required_bytes} bytes, got {} bytes",
            src_pixels.len()
        ));
    }

    let primary_result = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => {
            resize_with_source_image(src_image, pixel_type, dst_width, dst_height, &options)
        }
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let aligned_image = copy_pixels_to_aligned_image(
                src_width,
                src_height,
                pixel_type,
                &src_pixels,
                required_bytes,
            )?;
            resize_with_source_image(aligned_image, pixel_type, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary_result {
        Ok(img) => Ok(img),
        Err(err) => {
            tracing::debug!(%err, "fast_image_resize failed, using image crate fallback");
            resize_with_image_crate_fallback(
                &src_pixels,
                src_width,
                src_height,
                pixel_type,
                dst_width,
                dst_height,
            )
            .map_err(|fallback_err| format!("{err}; image crate fallback failed: {fallback_err}"))
        }
    }
}

fn copy_pixels_to_aligned_image(
    width: u32,
    height: u32,
    pixel_type: PixelType,
    src_pixels: &[u8],
    required_bytes: usize,
) -> std::result::Result<fir::images::Image<'static>, String> {
    let mut aligned_image = fir::images::Image::new(width, height, pixel_type);
    let aligned_buffer = aligned_image.buffer_mut();
    if aligned_buffer.len() != required_bytes {
        return Err(format!(
            "fir alignment fallback buffer mismatch. expected {required_bytes} bytes, got {} bytes",
            aligned_buffer.len()
        ));
    }
    aligned_buffer.copy_from_slice(&src_pixels[..required_bytes]);
    Ok(aligned_image)
}

fn resize_with_image_crate_fallback(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let filter = FilterType::Lanczos3;
    match pixel_type {
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(image::imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(image::imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8x3/U8x4 pixel types".to_string()),
    }
}

/// Only checks images ≥1MP; below that the premultiply pass is cheaper than the scan.
fn is_fully_opaque(image: &fir::images::Image, pixel_type: PixelType, width: u32, height: u32) -> bool {
    if pixel_type != PixelType::U8x4 {
        return true;
    }

    const THRESHOLD_PIXELS: u64 = 1_000_000;
    if (width as u64).saturating_mul(height as u64) < THRESHOLD_PIXELS {
        return false;
    }

    image.buffer().iter().skip(3).step_by(4).all(|&alpha| alpha == 255)
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    let src_width = src_image.width();
    let src_height = src_image.height();
    let needs_premultiply = requires_premultiply(pixel_type)
        && !is_fully_opaque(&src_image, pixel_type, src_width, src_height);

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    match pixel_type {
        PixelType::U8x3 => RgbImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| "failed to create rgb image from resized data".to_string()),
        PixelType::U8x4 => RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| "failed to create rgba image from resized data".to_string()),
        _ => Err("unsupported pixel type after resize".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    mod plan_tests {
        use super::*;

        #[test]
        fn within_envelope_is_unchanged() {
            assert_eq!(plan_dimensions(1200, 800, 3840, 2160), (1200, 800));
            assert_eq!(plan_dimensions(3840, 2160, 3840, 2160), (3840, 2160));
        }

        #[test]
        fn wide_image_is_width_constrained() {
            assert_eq!(plan_dimensions(8000, 2000, 3840, 2160), (3840, 960));
        }

        #[test]
        fn three_by_two_falls_through_to_height_constraint() {
            // 3840 / 1.5 = 2560 > 2160, so the height bound wins
            assert_eq!(plan_dimensions(6000, 4000, 3840, 2160), (3240, 2160));
        }

        #[test]
        fn portrait_is_height_constrained() {
            assert_eq!(plan_dimensions(3000, 4000, 1920, 1080), (810, 1080));
        }

        #[test]
        fn rounds_half_away_from_zero() {
            // 101 / 2 = 50.5 -> 51
            assert_eq!(plan_dimensions(202, 101, 101, 1000), (101, 51));
        }

        #[test]
        fn extreme_aspect_never_yields_zero() {
            assert_eq!(plan_dimensions(30000, 1, 100, 100), (100, 1));
            assert_eq!(plan_dimensions(1, 30000, 100, 100), (1, 100));
        }

        #[test]
        fn planning_is_idempotent() {
            let first = plan_dimensions(6000, 4000, 1920, 1080);
            assert_eq!(plan_dimensions(first.0, first.1, 1920, 1080), first);
        }

        #[test]
        fn shrinks_requires_strict_reduction() {
            assert!(shrinks((100, 100), (50, 50)));
            assert!(shrinks((100, 100), (100, 99)));
            assert!(!shrinks((100, 100), (100, 100)));
            assert!(!shrinks((100, 100), (120, 50)));
        }
    }

    mod resize_tests {
        use super::*;

        #[test]
        fn downscale_and_aspect_change() {
            let img = create_test_image(200, 100);
            assert_eq!(fast_resize(&img, 100, 50).unwrap().dimensions(), (100, 50));
            assert_eq!(fast_resize(&img, 100, 200).unwrap().dimensions(), (100, 200));
        }

        #[test]
        fn source_is_left_untouched() {
            let img = create_test_image(64, 64);
            let before = img.as_bytes().to_vec();
            let _ = fast_resize(&img, 16, 16).unwrap();
            assert_eq!(img.as_bytes(), before.as_slice());
        }

        #[test]
        fn invalid_dimensions_are_a_resize_error() {
            let img = create_test_image(100, 100);
            let err = fast_resize(&img, 0, 100).unwrap_err();
            match err {
                CompressError::ResizeFailed {
                    source_width,
                    target_width,
                    ..
                } => {
                    assert_eq!(source_width, 100);
                    assert_eq!(target_width, 0);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[test]
        fn luma_input_is_widened_to_rgba() {
            let img = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(10, 10, image::Luma([9])));
            let resized = fast_resize(&img, 5, 5).unwrap();
            assert!(matches!(resized, DynamicImage::ImageRgba8(_)));
        }

        #[test]
        fn rgba_downscale_respects_transparency() {
            // Premultiply keeps the transparent blue pixel from bleeding into red
            let mut img = DynamicImage::ImageRgba8(RgbaImage::new(2, 1));
            {
                let buf = img.as_mut_rgba8().unwrap();
                buf.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
                buf.put_pixel(1, 0, image::Rgba([0, 0, 255, 0]));
            }

            let resized = fast_resize(&img, 1, 1).unwrap().to_rgba8();
            let pixel = resized.get_pixel(0, 0);
            assert!(pixel[0] > 200, "red channel should dominate, got {}", pixel[0]);
            assert!(pixel[2] < 30, "blue channel should be minimal, got {}", pixel[2]);
            assert!(pixel[3] > 100, "alpha should remain non-zero, got {}", pixel[3]);
        }

        #[test]
        fn image_crate_fallback_resizes_rgb() {
            let src: Vec<u8> = (0..8 * 4 * 3).map(|i| (i % 251) as u8).collect();
            let resized =
                resize_with_image_crate_fallback(&src, 8, 4, PixelType::U8x3, 4, 2).unwrap();
            assert_eq!(resized.dimensions(), (4, 2));
            assert!(matches!(resized, DynamicImage::ImageRgb8(_)));
        }

        #[test]
        fn short_buffer_is_rejected() {
            let res = resize_pixels(4, 4, vec![0u8; 10], PixelType::U8x3, 2, 2, default_resize_options());
            assert!(res.is_err());
        }

        #[test]
        fn aligned_copy_preserves_data() {
            let src: Vec<u8> = (0..16).collect();
            let image = copy_pixels_to_aligned_image(2, 2, PixelType::U8x4, &src, src.len()).unwrap();
            assert_eq!(image.buffer(), src.as_slice());
        }

        #[test]
        fn opacity_scan_only_for_large_images() {
            let mut small = vec![255u8; 512 * 512 * 4];
            let image =
                fir::images::Image::from_slice_u8(512, 512, small.as_mut_slice(), PixelType::U8x4)
                    .unwrap();
            assert!(!is_fully_opaque(&image, PixelType::U8x4, 512, 512));

            let mut large = vec![255u8; 1000 * 1000 * 4];
            let image =
                fir::images::Image::from_slice_u8(1000, 1000, large.as_mut_slice(), PixelType::U8x4)
                    .unwrap();
            assert!(is_fully_opaque(&image, PixelType::U8x4, 1000, 1000));
        }

        #[test]
        fn works_inside_a_rayon_pool() {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
            pool.install(|| {
                let img = create_test_image(256, 256);
                assert_eq!(fast_resize(&img, 64, 64).unwrap().dimensions(), (64, 64));
            });
        }
    }
}
