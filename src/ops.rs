// src/ops.rs
//
// Compression plans, output formats, quality ladders and presets.
// These are cheap to create and store - the expensive work happens in the controller.

use crate::engine::FirewallConfig;
use crate::error::{CompressError, Result};
use std::fmt;
use std::str::FromStr;

/// 8 MiB, the upload ceiling of the storage collaborator.
pub const DEFAULT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Upper bound for the quality-search attempt cap.
pub const MAX_QUALITY_ATTEMPTS: u32 = 20;

/// Output format for encoding. Always something the storage collaborator
/// accepts directly; TIFF-class inputs never leave the pipeline as TIFF.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    WebP,
    /// Lossless: the quality ladder has no effect, only the dimension ladder does.
    Png,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::WebP => "webp",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::WebP => "webp",
            OutputFormat::Png => "png",
        }
    }

    /// Whether the encoder honours the quality factor.
    pub fn uses_quality(&self) -> bool {
        !matches!(self, OutputFormat::Png)
    }
}

impl FromStr for OutputFormat {
    type Err = CompressError;

    fn from_str(format: &str) -> Result<Self> {
        match format.trim().to_lowercase().as_str() {
            "jpeg" | "jpg" | "image/jpeg" => Ok(Self::Jpeg),
            "webp" | "image/webp" => Ok(Self::WebP),
            "png" | "image/png" => Ok(Self::Png),
            other => Err(CompressError::invalid_argument(
                "output_format",
                other.to_string(),
                "Expected jpeg, webp or png",
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder quality on the 0-100 scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quality(u8);

impl Quality {
    pub const MAX: Quality = Quality(100);

    /// Values above 100 are clamped.
    pub const fn new(value: u8) -> Self {
        if value > 100 {
            Self(100)
        } else {
            Self(value)
        }
    }

    /// Accepts either a 0-1 factor (browser canvas style) or a 0-100 value.
    ///
    /// Anything `<= 1.0` is read as a factor, so `1.0` means 100, not 1.
    pub fn from_factor(value: f32) -> Result<Self> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(CompressError::invalid_argument(
                "quality",
                value.to_string(),
                "Expected a factor in 0..=1 or a value in 0..=100",
            ));
        }
        let scaled = if value <= 1.0 { value * 100.0 } else { value };
        Ok(Self::new(scaled.round() as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn as_factor(self) -> f32 {
        self.0 as f32 / 100.0
    }

    pub fn saturating_sub(self, step: u8) -> Self {
        Self(self.0.saturating_sub(step))
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One encode attempt's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionPlan {
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
    pub format: OutputFormat,
}

impl CompressionPlan {
    pub fn new(width: u32, height: u32, quality: Quality, format: OutputFormat) -> Self {
        Self {
            width,
            height,
            quality,
            format,
        }
    }

    pub fn with_quality(self, quality: Quality) -> Self {
        Self { quality, ..self }
    }

    pub fn with_dimensions(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for CompressionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.format.uses_quality() {
            write!(
                f,
                "{}x{} {} q{}",
                self.width, self.height, self.format, self.quality
            )
        } else {
            write!(f, "{}x{} {}", self.width, self.height, self.format)
        }
    }
}

/// Descending quality ladder: `start, start - step, ...` down to `floor`,
/// never more than `max_attempts` rungs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityLadder {
    pub step: u8,
    pub floor: Quality,
    pub max_attempts: u32,
}

impl QualityLadder {
    pub fn new(step: u8, floor: Quality, max_attempts: u32) -> Self {
        Self {
            step,
            floor,
            max_attempts,
        }
    }

    /// Rungs starting at `start`. Strictly descending; the last rung is
    /// clamped to the floor. A start below the floor yields just the start.
    pub fn rungs(&self, start: Quality) -> Vec<Quality> {
        let cap = self.max_attempts.max(1) as usize;
        let mut rungs = vec![start];
        let mut current = start;
        while rungs.len() < cap && current > self.floor && self.step > 0 {
            let next = current.saturating_sub(self.step).max(self.floor);
            rungs.push(next);
            current = next;
        }
        rungs
    }
}

impl Default for QualityLadder {
    fn default() -> Self {
        Self::new(10, Quality::new(55), 5)
    }
}

/// Progressively smaller `(max_width, max_height)` envelopes, largest first.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DimensionLadder {
    entries: Vec<(u32, u32)>,
}

impl DimensionLadder {
    /// Entries are sorted largest envelope first and de-duplicated.
    pub fn new(mut entries: Vec<(u32, u32)>) -> Self {
        entries.sort_by(|a, b| {
            let area_a = a.0 as u64 * a.1 as u64;
            let area_b = b.0 as u64 * b.1 as u64;
            area_b.cmp(&area_a).then(b.0.cmp(&a.0))
        });
        entries.dedup();
        Self { entries }
    }

    pub fn entries(&self) -> &[(u32, u32)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// PRESETS - one canonical configuration plus the two execution contexts
// =============================================================================

/// Full configuration for one compression run.
#[derive(Clone, Debug)]
pub struct CompressionConfig {
    /// Byte budget for the encoded output
    pub max_bytes: u64,
    /// Pixel envelope applied before the first attempt
    pub max_width: u32,
    pub max_height: u32,
    pub start_quality: Quality,
    pub output_format: OutputFormat,
    pub quality_ladder: QualityLadder,
    pub dimension_ladder: DimensionLadder,
    /// Fixed quality for the dimension phase (capped at the quality search's last rung)
    pub dimension_phase_quality: Quality,
    /// Carry the source ICC profile into the output
    pub preserve_icc: bool,
    /// Apply EXIF orientation before encoding (re-encoding strips EXIF)
    pub auto_orient: bool,
    /// Skip mozjpeg scan optimization for lower latency
    pub jpeg_fast_mode: bool,
    pub firewall: FirewallConfig,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_width: 3840,
            max_height: 2160,
            start_quality: Quality::new(85),
            output_format: OutputFormat::Jpeg,
            quality_ladder: QualityLadder::default(),
            dimension_ladder: DimensionLadder::new(vec![
                (3840, 2160),
                (2560, 1440),
                (1920, 1080),
                (1280, 720),
                (800, 450),
            ]),
            dimension_phase_quality: Quality::new(70),
            preserve_icc: true,
            auto_orient: true,
            jpeg_fast_mode: false,
            firewall: FirewallConfig::disabled(),
        }
    }
}

impl CompressionConfig {
    /// Get the built-in preset by name
    pub fn preset(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "default" | "standard" => Ok(Self::default()),
            "interactive" => Ok(Self::interactive()),
            "ingestion" => Ok(Self::ingestion()),
            _ => Err(CompressError::invalid_preset(name.to_string())),
        }
    }

    /// Pre-upload preset: fewer, coarser rungs and fast JPEG for latency.
    pub fn interactive() -> Self {
        Self {
            quality_ladder: QualityLadder::new(10, Quality::new(50), 5),
            dimension_ladder: DimensionLadder::new(vec![(2560, 1440), (1920, 1080), (1280, 720)]),
            dimension_phase_quality: Quality::new(70),
            jpeg_fast_mode: true,
            ..Self::default()
        }
    }

    /// Server ingestion preset: finer quality steps, a higher floor and the
    /// lenient upload firewall.
    pub fn ingestion() -> Self {
        Self {
            quality_ladder: QualityLadder::new(5, Quality::new(60), 5),
            dimension_ladder: DimensionLadder::new(vec![
                (3200, 1800),
                (2560, 1440),
                (1920, 1080),
                (1600, 900),
                (1280, 720),
            ]),
            dimension_phase_quality: Quality::new(75),
            firewall: FirewallConfig::lenient(),
            ..Self::default()
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_envelope(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_start_quality(mut self, quality: Quality) -> Self {
        self.start_quality = quality;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_quality_ladder(mut self, ladder: QualityLadder) -> Self {
        self.quality_ladder = ladder;
        self
    }

    pub fn with_dimension_ladder(mut self, ladder: DimensionLadder) -> Self {
        self.dimension_ladder = ladder;
        self
    }

    pub fn with_dimension_phase_quality(mut self, quality: Quality) -> Self {
        self.dimension_phase_quality = quality;
        self
    }

    pub fn with_firewall(mut self, firewall: FirewallConfig) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_preserve_icc(mut self, preserve: bool) -> Self {
        self.preserve_icc = preserve;
        self
    }

    pub fn with_auto_orient(mut self, auto_orient: bool) -> Self {
        self.auto_orient = auto_orient;
        self
    }

    pub fn with_jpeg_fast_mode(mut self, fast_mode: bool) -> Self {
        self.jpeg_fast_mode = fast_mode;
        self
    }

    /// Upper bound on encode attempts for one run.
    pub fn max_total_attempts(&self) -> usize {
        self.quality_ladder.max_attempts.max(1) as usize + self.dimension_ladder.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(CompressError::invalid_argument(
                "max_bytes",
                "0",
                "Byte budget must be positive",
            ));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(CompressError::invalid_argument(
                "envelope",
                format!("{}x{}", self.max_width, self.max_height),
                "Maximum width and height must be positive",
            ));
        }
        if self.quality_ladder.step == 0 {
            return Err(CompressError::invalid_argument(
                "quality_ladder.step",
                "0",
                "Quality step must be positive",
            ));
        }
        if !(1..=MAX_QUALITY_ATTEMPTS).contains(&self.quality_ladder.max_attempts) {
            return Err(CompressError::invalid_argument(
                "quality_ladder.max_attempts",
                self.quality_ladder.max_attempts.to_string(),
                format!("Expected 1..={MAX_QUALITY_ATTEMPTS}"),
            ));
        }
        if let Some(&(w, h)) = self
            .dimension_ladder
            .entries()
            .iter()
            .find(|(w, h)| *w == 0 || *h == 0)
        {
            return Err(CompressError::invalid_argument(
                "dimension_ladder",
                format!("{w}x{h}"),
                "Ladder entries must be positive",
            ));
        }
        Ok(())
    }
}
