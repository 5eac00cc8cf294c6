// src/engine/api.rs
//
// Pipeline entry points: compress, compress_with_encoder, compress_bytes.
// Probe -> (normalize) -> plan -> controller -> report, all on the caller's
// thread and strictly sequential.

use crate::engine::controller::SizeController;
use crate::engine::decoder::{apply_orientation, decode_image, probe, FormatClass, ProbedImage};
use crate::engine::encoder::{NativeEncoder, Provenance, RasterEncoder, WorkingImage};
use crate::engine::io::{extract_icc_profile, SourceImage};
use crate::engine::normalize::normalize;
use crate::engine::pipeline::plan_dimensions;
use crate::engine::report::{CompressionReport, ReportBuilder, StepLog};
use crate::error::{CompressError, Result};
use crate::ops::{CompressionConfig, CompressionPlan, Quality};
use std::sync::Arc;

/// Compress `source` with the native encoder.
pub fn compress(source: &SourceImage, config: &CompressionConfig) -> Result<CompressionReport> {
    compress_with_encoder(source, config, &NativeEncoder::from_config(config))
}

/// Convenience entry point for upload handlers.
///
/// `start_quality` accepts a 0-1 factor or a 0-100 value. Everything not
/// given here comes from `CompressionConfig::default()`.
pub fn compress_bytes(
    bytes: impl Into<Vec<u8>>,
    declared_name: &str,
    mime_hint: Option<&str>,
    max_bytes: u64,
    max_width: u32,
    max_height: u32,
    start_quality: f32,
) -> Result<CompressionReport> {
    let config = CompressionConfig::default()
        .with_max_bytes(max_bytes)
        .with_envelope(max_width, max_height)
        .with_start_quality(Quality::from_factor(start_quality)?);
    let source = SourceImage::from_bytes(bytes, declared_name, mime_hint);
    compress(&source, &config)
}

/// Compress `source` with any encoder implementation.
pub fn compress_with_encoder<E: RasterEncoder + ?Sized>(
    source: &SourceImage,
    config: &CompressionConfig,
    encoder: &E,
) -> Result<CompressionReport> {
    config.validate()?;

    let bytes = source.as_bytes();
    config.firewall.enforce_source_len(bytes.len())?;
    config.firewall.scan_metadata(bytes)?;

    let mut log = StepLog::default();

    let probed = probe(source)?;
    config.firewall.enforce_pixels(probed.width, probed.height)?;
    log.push(format!(
        "probed {} {}x{} ({} bytes, detected by {:?})",
        probed.format_name(),
        probed.width,
        probed.height,
        bytes.len(),
        probed.detected_by
    ));
    tracing::debug!(
        name = source.declared_name(),
        format = probed.format_name(),
        width = probed.width,
        height = probed.height,
        class = ?probed.class,
        "probed source"
    );

    let mut working = load_working_image(source, &probed, &mut log)?;

    if config.auto_orient {
        if let Some(orientation) = probed.orientation.filter(|&o| o != 1) {
            working = orient(working, orientation);
            log.push(format!(
                "applied EXIF orientation {orientation} -> {}x{}",
                working.width(),
                working.height()
            ));
        }
    }

    if config.preserve_icc {
        if let Some(icc) = extract_icc_profile(bytes) {
            log.push(format!("carrying ICC profile ({} bytes)", icc.len()));
            working = working.with_icc(Some(icc));
        }
    }

    let (source_w, source_h) = working.dimensions();
    let (planned_w, planned_h) =
        plan_dimensions(source_w, source_h, config.max_width, config.max_height);
    if (planned_w, planned_h) != (source_w, source_h) {
        log.push(format!(
            "planned {planned_w}x{planned_h} from {source_w}x{source_h} to fit {}x{}",
            config.max_width, config.max_height
        ));
        working = encoder.rasterize(&working, planned_w, planned_h)?;
    } else {
        log.push(format!(
            "planned {planned_w}x{planned_h}: within {}x{}",
            config.max_width, config.max_height
        ));
    }

    let start = CompressionPlan::new(
        planned_w,
        planned_h,
        config.start_quality,
        config.output_format,
    );
    let outcome = SizeController::new(encoder, config).run(&working, start, &mut log)?;

    let final_len = outcome.attempt.len();
    if outcome.budget_met {
        log.push(format!(
            "done: {} within {} byte budget after {} attempt(s)",
            outcome.attempt.plan, config.max_bytes, outcome.attempts
        ));
        tracing::info!(
            name = source.declared_name(),
            original_bytes = bytes.len(),
            final_bytes = final_len,
            attempts = outcome.attempts,
            plan = %outcome.attempt.plan,
            "compressed within budget"
        );
    } else {
        log.push(format!(
            "done: best effort {} is {} bytes, over the {} byte budget",
            outcome.attempt.plan, final_len, config.max_bytes
        ));
        tracing::warn!(
            name = source.declared_name(),
            final_bytes = final_len,
            max_bytes = config.max_bytes,
            attempts = outcome.attempts,
            "ladders exhausted, output still over budget"
        );
    }

    Ok(
        ReportBuilder::new(bytes.len() as u64, probed.format_name(), source.declared_name())
            .normalized(probed.class == FormatClass::NeedsNormalization)
            .original_dimensions(source_w, source_h)
            .start_quality(config.start_quality)
            .max_bytes(config.max_bytes)
            .build(outcome, log),
    )
}

fn load_working_image(
    source: &SourceImage,
    probed: &ProbedImage,
    log: &mut StepLog,
) -> Result<WorkingImage> {
    match probed.class {
        FormatClass::DirectEncodable => {
            let image = decode_image(source.as_bytes(), probed.format)?;
            Ok(WorkingImage::new(Arc::new(image), Provenance::Original))
        }
        FormatClass::NeedsNormalization => {
            let normalized = normalize(source, probed)?;
            log.push(format!(
                "normalized {} first page to {}-bit {} raster ({} bytes)",
                probed.format_name(),
                8,
                if normalized.working.image().color().has_alpha() {
                    "RGBA"
                } else {
                    "RGB"
                },
                normalized.byte_size
            ));
            Ok(normalized.working)
        }
        FormatClass::Unsupported => Err(CompressError::unsupported_format(probed.format_name())),
    }
}

fn orient(working: WorkingImage, orientation: u16) -> WorkingImage {
    let provenance = working.provenance();
    let image = Arc::try_unwrap(working.into_shared_image()).unwrap_or_else(|shared| (*shared).clone());
    WorkingImage::new(Arc::new(apply_orientation(image, orientation)), provenance)
}
