// src/engine/encoder.rs
//
// Rasterizer/encoder capability: WorkingImage, the RasterEncoder trait the
// controller drives, and the native JPEG (mozjpeg), WebP (libwebp) and
// PNG (image + oxipng) encoders with optional ICC embedding.

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::pipeline::fast_resize;
use crate::engine::MAX_DIMENSION;
use crate::error::CompressError;
use crate::ops::{CompressionConfig, CompressionPlan, OutputFormat};
use image::{DynamicImage, ImageFormat};
use img_parts::{jpeg::Jpeg, png::Png, ImageICC};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;

/// Where a WorkingImage's pixels came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Straight decode of a directly-encodable source
    Original,
    /// Output of the format normalizer
    Normalized,
    /// Resampled for a dimension-ladder step
    Rasterized,
}

/// Decoded raster handed to the encoder. Read-only once created; a new
/// size means a new WorkingImage.
#[derive(Clone, Debug)]
pub struct WorkingImage {
    image: Arc<DynamicImage>,
    provenance: Provenance,
    icc: Option<Arc<Vec<u8>>>,
}

impl WorkingImage {
    pub fn new(image: Arc<DynamicImage>, provenance: Provenance) -> Self {
        Self {
            image,
            provenance,
            icc: None,
        }
    }

    pub fn with_icc(mut self, icc: Option<Vec<u8>>) -> Self {
        self.icc = icc.map(Arc::new);
        self
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_shared_image(self) -> Arc<DynamicImage> {
        self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn icc_profile(&self) -> Option<&[u8]> {
        self.icc.as_deref().map(Vec::as_slice)
    }

    /// Size of the in-memory pixel buffer.
    pub fn raster_bytes(&self) -> u64 {
        self.image.as_bytes().len() as u64
    }
}

/// Encoding capability injected into the controller.
///
/// `encode` must be deterministic for identical inputs within a process and
/// must not mutate the WorkingImage. When the plan's dimensions differ from
/// the WorkingImage, the implementation resamples first.
pub trait RasterEncoder: Send + Sync {
    fn encode(&self, working: &WorkingImage, plan: &CompressionPlan) -> EngineResult<Vec<u8>>;

    /// Produce a new WorkingImage at exactly `width` x `height`.
    fn rasterize(&self, working: &WorkingImage, width: u32, height: u32) -> EngineResult<WorkingImage> {
        let resized = fast_resize(working.image(), width, height)?;
        Ok(WorkingImage {
            image: Arc::new(resized),
            provenance: Provenance::Rasterized,
            icc: working.icc.clone(),
        })
    }
}

impl<F> RasterEncoder for F
where
    F: Fn(&WorkingImage, &CompressionPlan) -> EngineResult<Vec<u8>> + Send + Sync,
{
    fn encode(&self, working: &WorkingImage, plan: &CompressionPlan) -> EngineResult<Vec<u8>> {
        self(working, plan)
    }
}

/// Shipped encoder: mozjpeg / libwebp / oxipng.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeEncoder {
    pub jpeg_fast_mode: bool,
    pub preserve_icc: bool,
}

impl NativeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CompressionConfig) -> Self {
        Self {
            jpeg_fast_mode: config.jpeg_fast_mode,
            preserve_icc: config.preserve_icc,
        }
    }
}

impl RasterEncoder for NativeEncoder {
    fn encode(&self, working: &WorkingImage, plan: &CompressionPlan) -> EngineResult<Vec<u8>> {
        let img: Cow<'_, DynamicImage> = if working.dimensions() == (plan.width, plan.height) {
            Cow::Borrowed(working.image())
        } else {
            Cow::Owned(fast_resize(working.image(), plan.width, plan.height)?)
        };
        let icc = if self.preserve_icc {
            working.icc_profile()
        } else {
            None
        };

        let quality = plan.quality.get();
        match plan.format {
            OutputFormat::Jpeg => encode_jpeg_with_settings(&img, quality, icc, self.jpeg_fast_mode),
            OutputFormat::WebP => encode_webp(&img, quality, icc),
            OutputFormat::Png => encode_png(&img, icc),
        }
    }
}

/// Derives libwebp tuning from the 0-100 quality value.
/// Bands: High (>=85), Balanced (70-84), Fast (<70).
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else {
            QualityBand::Fast
        }
    }

    pub fn webp_method(&self) -> i32 {
        4
    }

    pub fn webp_pass(&self) -> i32 {
        1
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast => 0,
        }
    }

    /// mozjpeg smoothing; heavier at low quality to hide blocking.
    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else if self.quality >= 60.0 {
            10
        } else {
            18
        }
    }
}

/// Encode to JPEG with the default (optimized) settings.
pub fn encode_jpeg(img: &DynamicImage, quality: u8, icc: Option<&[u8]>) -> EngineResult<Vec<u8>> {
    encode_jpeg_with_settings(img, quality, icc, false)
}

/// Encode to JPEG with mozjpeg: progressive, 4:2:0.
///
/// `fast_mode` skips Huffman and scan optimization (libjpeg-turbo defaults),
/// trading a few percent of size for latency.
pub fn encode_jpeg_with_settings(
    img: &DynamicImage,
    quality: u8,
    icc: Option<&[u8]>,
    fast_mode: bool,
) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let quality = quality.min(100);

        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let pixels: &[u8] = rgb.as_raw();

        if w == 0 || h == 0 {
            return Err(CompressError::encode_failed(
                "jpeg",
                "width or height is zero",
            ));
        }
        if w > MAX_DIMENSION || h > MAX_DIMENSION {
            return Err(CompressError::dimension_exceeds_limit(
                w.max(h),
                MAX_DIMENSION,
            ));
        }
        let expected_len = (w as usize) * (h as usize) * 3;
        if pixels.len() != expected_len {
            return Err(CompressError::corrupted_image());
        }

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(quality as f32);
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_progressive_mode();

        if fast_mode {
            comp.set_optimize_coding(false);
            comp.set_optimize_scans(false);
        } else {
            comp.set_optimize_coding(true);
            comp.set_optimize_scans(true);
            comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        }
        comp.set_smoothing_factor(QualitySettings::new(quality).jpeg_smoothing());

        let estimated_size = (w as usize * h as usize * 3 / 10).max(4096);
        let mut output = Vec::with_capacity(estimated_size);

        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                CompressError::encode_failed(
                    "jpeg",
                    format!("mozjpeg: failed to start compress: {e:?}"),
                )
            })?;

            let stride = w as usize * 3;
            for row in pixels.chunks(stride) {
                writer.write_scanlines(row).map_err(|e| {
                    CompressError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: failed to write scanlines: {e:?}"),
                    )
                })?;
            }

            writer.finish().map_err(|e| {
                CompressError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }

        match icc {
            Some(icc_data) => embed_icc_jpeg(output, icc_data),
            None => Ok(output),
        }
    })
}

/// Embed ICC profile into JPEG as a single APP2 segment.
pub fn embed_icc_jpeg(jpeg_data: Vec<u8>, icc: &[u8]) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg:embed_icc", || {
        use img_parts::jpeg::{markers::APP2, JpegSegment};
        use img_parts::Bytes;

        let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data)).map_err(|e| {
            CompressError::encode_failed("jpeg", format!("failed to parse JPEG for ICC: {e}"))
        })?;

        let mut marker_data = Vec::with_capacity(14 + icc.len());
        marker_data.extend_from_slice(b"ICC_PROFILE\0");
        marker_data.push(1);
        marker_data.push(1);
        marker_data.extend_from_slice(icc);

        let segment = JpegSegment::new_with_contents(APP2, Bytes::from(marker_data));
        jpeg.segments_mut().insert(0, segment);

        let mut output = Vec::new();
        jpeg.encoder().write_to(&mut output).map_err(|e| {
            CompressError::encode_failed("jpeg", format!("failed to write JPEG with ICC: {e}"))
        })?;

        Ok(output)
    })
}

/// Encode to PNG, then recompress losslessly with oxipng.
pub fn encode_png(img: &DynamicImage, icc: Option<&[u8]>) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| CompressError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        let mut options = oxipng::Options::from_preset(4);
        options.strip = oxipng::StripChunks::None;

        let optimized = oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            CompressError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })?;

        match icc {
            Some(icc_data) => embed_icc_png(optimized, icc_data),
            None => Ok(optimized),
        }
    })
}

/// Embed ICC profile into PNG as an iCCP chunk.
pub fn embed_icc_png(png_data: Vec<u8>, icc: &[u8]) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:png:embed_icc", || {
        use img_parts::Bytes;

        let mut png = Png::from_bytes(Bytes::from(png_data)).map_err(|e| {
            CompressError::encode_failed("png", format!("failed to parse PNG for ICC: {e}"))
        })?;
        png.set_icc_profile(Some(Bytes::from(icc.to_vec())));

        let mut output = Vec::new();
        png.encoder().write_to(&mut output).map_err(|e| {
            CompressError::encode_failed("png", format!("failed to write PNG with ICC: {e}"))
        })?;

        Ok(output)
    })
}

/// Encode to lossy WebP. Alpha is dropped; uploads are photographs.
pub fn encode_webp(img: &DynamicImage, quality: u8, icc: Option<&[u8]>) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let encoder = webp::Encoder::from_rgb(&rgb, w, h);

        let mut config = webp::WebPConfig::new()
            .map_err(|_| CompressError::encode_failed("webp", "failed to create WebPConfig"))?;

        let settings = QualitySettings::new(quality);
        config.quality = settings.quality;
        config.method = settings.webp_method();
        config.pass = settings.webp_pass();
        config.preprocessing = 0;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();

        let encoded = encoder
            .encode_advanced(&config)
            .map_err(|e| CompressError::encode_failed("webp", format!("WebP encode failed: {e:?}")))?
            .to_vec();

        match icc {
            Some(icc_data) => embed_icc_webp(encoded, icc_data),
            None => Ok(encoded),
        }
    })
}

/// Embed ICC profile into WebP as an ICCP chunk (promotes to VP8X).
pub fn embed_icc_webp(webp_data: Vec<u8>, icc: &[u8]) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:webp:embed_icc", || {
        use img_parts::webp::WebP;
        use img_parts::Bytes;

        let mut webp = WebP::from_bytes(Bytes::from(webp_data)).map_err(|e| {
            CompressError::encode_failed("webp", format!("failed to parse WebP for ICC: {e}"))
        })?;
        webp.set_icc_profile(Some(Bytes::from(icc.to_vec())));

        let mut output = Vec::new();
        webp.encoder().write_to(&mut output).map_err(|e| {
            CompressError::encode_failed("webp", format!("failed to write WebP with ICC: {e}"))
        })?;

        Ok(output)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::io::test_support::minimal_icc;
    use crate::ops::Quality;
    use image::{GenericImageView, RgbImage, RgbaImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn working(width: u32, height: u32) -> WorkingImage {
        WorkingImage::new(Arc::new(create_test_image(width, height)), Provenance::Original)
    }

    const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    mod encode_tests {
        use super::*;

        #[test]
        fn test_encode_jpeg_produces_valid_jpeg() {
            let result = encode_jpeg(&create_test_image(100, 100), 80, None).unwrap();
            assert_eq!(&result[0..2], &[0xFF, 0xD8]);
            assert_eq!(&result[result.len() - 2..], &[0xFF, 0xD9]);
        }

        #[test]
        fn test_encode_jpeg_fast_mode_produces_valid_jpeg() {
            let img = create_test_image(300, 300);
            let fast = encode_jpeg_with_settings(&img, 80, None, true).unwrap();
            let optimized = encode_jpeg_with_settings(&img, 80, None, false).unwrap();
            assert_eq!(&fast[0..2], &[0xFF, 0xD8]);
            assert_eq!(&fast[fast.len() - 2..], &[0xFF, 0xD9]);
            assert!(fast.len() < optimized.len() * 2);
        }

        #[test]
        fn test_encode_jpeg_is_deterministic() {
            let img = create_test_image(64, 48);
            assert_eq!(
                encode_jpeg(&img, 70, None).unwrap(),
                encode_jpeg(&img, 70, None).unwrap()
            );
        }

        #[test]
        fn test_encode_png_produces_valid_png() {
            let result = encode_png(&create_test_image(100, 100), None).unwrap();
            assert_eq!(&result[0..8], &PNG_SIGNATURE);
        }

        #[test]
        fn test_encode_webp_produces_valid_webp() {
            let result = encode_webp(&create_test_image(100, 100), 80, None).unwrap();
            assert_eq!(&result[0..4], b"RIFF");
            assert_eq!(&result[8..12], b"WEBP");
        }

        #[test]
        fn test_encoders_accept_icc() {
            let img = create_test_image(40, 40);
            let icc = minimal_icc();
            assert_eq!(&encode_jpeg(&img, 80, Some(&icc)).unwrap()[0..2], &[0xFF, 0xD8]);
            assert_eq!(&encode_png(&img, Some(&icc)).unwrap()[0..8], &PNG_SIGNATURE);
            assert_eq!(&encode_webp(&img, 80, Some(&icc)).unwrap()[0..4], b"RIFF");
        }

        #[test]
        fn test_encode_rgba_image() {
            let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(50, 50, |x, y| {
                image::Rgba([x as u8, y as u8, 128, 200])
            }));
            assert_eq!(&encode_jpeg(&img, 80, None).unwrap()[0..2], &[0xFF, 0xD8]);
            assert_eq!(&encode_png(&img, None).unwrap()[0..8], &PNG_SIGNATURE);
        }

        #[test]
        fn test_quality_settings_webp_mapping_is_stable() {
            let high = QualitySettings::new(90);
            assert_eq!(high.webp_method(), 4);
            assert_eq!(high.webp_pass(), 1);
            assert_eq!(high.webp_sns_strength(), 50);
            assert_eq!(high.webp_filter_strength(), 20);
            assert_eq!(high.webp_filter_sharpness(), 2);

            let balanced = QualitySettings::new(75);
            assert_eq!(balanced.webp_sns_strength(), 70);
            assert_eq!(balanced.webp_filter_strength(), 30);
            assert_eq!(balanced.webp_filter_sharpness(), 0);

            let fast = QualitySettings::new(40);
            assert_eq!(fast.webp_sns_strength(), 80);
            assert_eq!(fast.webp_filter_strength(), 40);
            assert_eq!(fast.jpeg_smoothing(), 18);
        }
    }

    mod native_encoder_tests {
        use super::*;

        #[test]
        fn encodes_at_plan_dimensions() {
            let encoder = NativeEncoder::new();
            let plan = CompressionPlan::new(50, 25, Quality::new(80), OutputFormat::Jpeg);
            let bytes = encoder.encode(&working(200, 100), &plan).unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!(decoded.dimensions(), (50, 25));
        }

        #[test]
        fn routes_each_output_format() {
            let encoder = NativeEncoder::new();
            let w = working(32, 32);
            let plan = CompressionPlan::new(32, 32, Quality::new(80), OutputFormat::WebP);
            assert_eq!(&encoder.encode(&w, &plan).unwrap()[8..12], b"WEBP");
            let plan = CompressionPlan { format: OutputFormat::Png, ..plan };
            assert_eq!(&encoder.encode(&w, &plan).unwrap()[0..8], &PNG_SIGNATURE);
        }

        #[test]
        fn icc_is_embedded_only_when_preserved() {
            let w = working(16, 16).with_icc(Some(minimal_icc()));
            let plan = CompressionPlan::new(16, 16, Quality::new(80), OutputFormat::Jpeg);

            let keep = NativeEncoder {
                preserve_icc: true,
                ..NativeEncoder::default()
            };
            let kept = keep.encode(&w, &plan).unwrap();
            assert!(crate::engine::io::extract_icc_profile(&kept).is_some());

            let stripped = NativeEncoder::default().encode(&w, &plan).unwrap();
            assert!(crate::engine::io::extract_icc_profile(&stripped).is_none());
        }

        #[test]
        fn rasterize_builds_a_new_working_image() {
            let original = working(200, 100).with_icc(Some(minimal_icc()));
            let smaller = NativeEncoder::new().rasterize(&original, 100, 50).unwrap();
            assert_eq!(smaller.dimensions(), (100, 50));
            assert_eq!(smaller.provenance(), Provenance::Rasterized);
            assert_eq!(smaller.icc_profile(), original.icc_profile());
            assert_eq!(original.dimensions(), (200, 100));
        }

        #[test]
        fn closures_are_encoders() {
            let fixed = |_: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
                Ok(vec![0; plan.quality.get() as usize])
            };
            let plan = CompressionPlan::new(1, 1, Quality::new(7), OutputFormat::Jpeg);
            assert_eq!(fixed.encode(&working(1, 1), &plan).unwrap().len(), 7);
        }
    }
}
